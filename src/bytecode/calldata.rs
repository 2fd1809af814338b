use std::rc::Rc;

/// Immutable description of a call site.
///
/// Call data is referenced from `send`-family instructions through an
/// `Rc`, so several instructions (e.g. the two halves of `opt_neq`) can
/// share one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallData {
    pub method: String,
    pub argc: usize,
    pub flags: u32,
    /// Keyword names for `KWARG` calls, in push order.
    pub kw_arg: Vec<String>,
}

impl CallData {
    pub const ARGS_SPLAT: u32 = 1 << 0;
    pub const ARGS_BLOCKARG: u32 = 1 << 1;
    pub const FCALL: u32 = 1 << 2;
    pub const VCALL: u32 = 1 << 3;
    pub const ARGS_SIMPLE: u32 = 1 << 4;
    pub const BLOCKISEQ: u32 = 1 << 5;
    pub const KWARG: u32 = 1 << 6;
    pub const KW_SPLAT: u32 = 1 << 7;
    pub const TAILCALL: u32 = 1 << 8;
    pub const SUPER: u32 = 1 << 9;
    pub const ZSUPER: u32 = 1 << 10;
    pub const OPT_SEND: u32 = 1 << 11;
    pub const KW_SPLAT_MUT: u32 = 1 << 12;

    const FLAG_NAMES: [(u32, &'static str); 13] = [
        (Self::ARGS_SPLAT, "ARGS_SPLAT"),
        (Self::ARGS_BLOCKARG, "ARGS_BLOCKARG"),
        (Self::FCALL, "FCALL"),
        (Self::VCALL, "VCALL"),
        (Self::ARGS_SIMPLE, "ARGS_SIMPLE"),
        (Self::BLOCKISEQ, "BLOCKISEQ"),
        (Self::KWARG, "KWARG"),
        (Self::KW_SPLAT, "KW_SPLAT"),
        (Self::TAILCALL, "TAILCALL"),
        (Self::SUPER, "SUPER"),
        (Self::ZSUPER, "ZSUPER"),
        (Self::OPT_SEND, "SEND"),
        (Self::KW_SPLAT_MUT, "KW_SPLAT_MUT"),
    ];

    pub fn new(method: impl Into<String>, argc: usize, flags: u32) -> Rc<Self> {
        Rc::new(Self {
            method: method.into(),
            argc,
            flags,
            kw_arg: Vec::new(),
        })
    }

    /// Call data for a plain `recv.method(args)` without splats or blocks.
    pub fn simple(method: impl Into<String>, argc: usize) -> Rc<Self> {
        Self::new(method, argc, Self::ARGS_SIMPLE)
    }

    pub fn with_keywords(method: impl Into<String>, argc: usize, flags: u32, kw_arg: Vec<String>) -> Rc<Self> {
        Rc::new(Self {
            method: method.into(),
            argc,
            flags,
            kw_arg,
        })
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Only positional arguments: no splat, keywords or block argument.
    pub fn is_simple(&self) -> bool {
        self.has(Self::ARGS_SIMPLE)
            && !self.has(Self::ARGS_SPLAT | Self::ARGS_BLOCKARG | Self::KWARG | Self::KW_SPLAT)
    }

    /// Values popped for the arguments, excluding the receiver.
    pub fn stack_args(&self) -> usize {
        self.argc + usize::from(self.has(Self::ARGS_BLOCKARG))
    }

    pub fn flag_names(&self) -> Vec<&'static str> {
        Self::FLAG_NAMES
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::fmt::Display for CallData {
    /// `<calldata!mid:+, argc:1, ARGS_SIMPLE>`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<calldata!")?;
        if !self.method.is_empty() {
            write!(f, "mid:{}, ", self.method)?;
        }
        write!(f, "argc:{}", self.argc)?;
        for name in self.flag_names() {
            write!(f, ", {}", name)?;
        }
        if !self.kw_arg.is_empty() {
            write!(f, ", kw:[{}]", self.kw_arg.join(", "))?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let cd = CallData::new("puts", 1, CallData::FCALL | CallData::ARGS_SIMPLE);
        assert_eq!(cd.to_string(), "<calldata!mid:puts, argc:1, FCALL, ARGS_SIMPLE>");
    }

    #[test]
    fn test_display_without_method() {
        let cd = CallData::simple("", 2);
        assert_eq!(cd.to_string(), "<calldata!argc:2, ARGS_SIMPLE>");
    }

    #[test]
    fn test_simple_excludes_block_arg() {
        assert!(CallData::simple("+", 1).is_simple());
        let cd = CallData::new("each", 0, CallData::ARGS_SIMPLE | CallData::ARGS_BLOCKARG);
        assert!(!cd.is_simple());
        assert_eq!(cd.stack_args(), 1);
    }
}
