/// Compile-time model of the operand stack depth.
///
/// The builder adjusts this for every emitted instruction; `maximum` becomes
/// the sequence's `stack_max`, which the VM uses to size frame stacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackTracker {
    current: usize,
    maximum: usize,
}

/// Popping more values than the tracker holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Underflow {
    pub depth: usize,
    pub pops: usize,
}

impl StackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn maximum(&self) -> usize {
        self.maximum
    }

    /// Apply an instruction's effect: first its pops, then its pushes.
    pub fn change(&mut self, pops: usize, pushes: usize) -> Result<(), Underflow> {
        if pops > self.current {
            return Err(Underflow {
                depth: self.current,
                pops,
            });
        }
        self.current = self.current - pops + pushes;
        self.maximum = self.maximum.max(self.current);
        Ok(())
    }

    /// Reset the depth at a join point whose depth is known from another
    /// path, e.g. the `else` label of an `if` expression.
    pub fn set_current(&mut self, depth: usize) {
        self.current = depth;
        self.maximum = self.maximum.max(depth);
    }

    /// Restore a maximum read back from a serialized sequence.
    pub fn with_maximum(maximum: usize) -> Self {
        Self {
            current: 0,
            maximum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_op_effect() {
        let mut stack = StackTracker::new();
        stack.change(0, 1).unwrap();
        stack.change(0, 1).unwrap();
        stack.change(2, 1).unwrap();
        assert_eq!(stack.current(), 1);
        assert_eq!(stack.maximum(), 2);
    }

    #[test]
    fn test_underflow() {
        let mut stack = StackTracker::new();
        stack.change(0, 1).unwrap();
        let err = stack.change(2, 1).unwrap_err();
        assert_eq!(err, Underflow { depth: 1, pops: 2 });
        assert_eq!(stack.current(), 1);
    }

    #[test]
    fn test_set_current_keeps_maximum() {
        let mut stack = StackTracker::new();
        stack.change(0, 3).unwrap();
        stack.set_current(1);
        assert_eq!(stack.current(), 1);
        assert_eq!(stack.maximum(), 3);
    }
}
