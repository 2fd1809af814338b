use std::fmt;
use std::str::FromStr;

/// Language version the emitted bytecode targets.
///
/// Several instructions changed shape between releases (inline caches for
/// instance variables, class variables and constants), so the builder
/// checks this before picking an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetVersion {
    pub major: u32,
    pub minor: u32,
}

impl TargetVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub const V3_0: TargetVersion = TargetVersion::new(3, 0);
    pub const V3_2: TargetVersion = TargetVersion::new(3, 2);
    pub const LATEST: TargetVersion = TargetVersion::new(3, 3);

    pub fn at_least(self, other: TargetVersion) -> bool {
        self >= other
    }
}

impl Default for TargetVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for TargetVersion {
    type Err = String;

    /// Parses `"3.2"` or `"3.2.1"` (the patch level is ignored).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("invalid target version '{}'", s))?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| format!("invalid target version '{}'", s))?,
            None => 0,
        };
        Ok(Self::new(major, minor))
    }
}

/// Knobs controlling how the builder encodes instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// String literals become frozen `putobject` operands.
    pub frozen_string_literal: bool,
    /// `getlocal`/`setlocal` at level 0/1 and `putobject 0/1` use operand-free forms.
    pub operands_unification: bool,
    /// Simple calls to well-known selectors use dedicated `opt_*` opcodes.
    pub specialized_instruction: bool,
    /// Run the peephole pass when a sequence is finished.
    pub peephole_optimization: bool,
    /// Constant reads go through an inline cache.
    pub inline_const_cache: bool,
    pub target_version: TargetVersion,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            frozen_string_literal: false,
            operands_unification: true,
            specialized_instruction: true,
            peephole_optimization: true,
            inline_const_cache: true,
            target_version: TargetVersion::LATEST,
        }
    }
}

impl CompileOptions {
    /// Every optimization off: each call is a generic `send`.
    pub fn plain() -> Self {
        Self {
            frozen_string_literal: false,
            operands_unification: false,
            specialized_instruction: false,
            peephole_optimization: false,
            inline_const_cache: false,
            target_version: TargetVersion::LATEST,
        }
    }

    pub fn with_target(mut self, target_version: TargetVersion) -> Self {
        self.target_version = target_version;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_version() {
        assert_eq!("3.1".parse::<TargetVersion>().unwrap(), TargetVersion::new(3, 1));
        assert_eq!("3.2.4".parse::<TargetVersion>().unwrap(), TargetVersion::V3_2);
        assert_eq!("3".parse::<TargetVersion>().unwrap(), TargetVersion::V3_0);
        assert!("x.1".parse::<TargetVersion>().is_err());
    }

    #[test]
    fn test_version_ordering() {
        assert!(TargetVersion::new(3, 1) < TargetVersion::V3_2);
        assert!(TargetVersion::LATEST.at_least(TargetVersion::V3_2));
        assert!(!TargetVersion::new(2, 7).at_least(TargetVersion::V3_0));
    }

    #[test]
    fn test_defaults_enable_optimizations() {
        let options = CompileOptions::default();
        assert!(options.specialized_instruction);
        assert!(options.operands_unification);
        assert!(!options.frozen_string_literal);
        assert_eq!(options.target_version.to_string(), "3.3");
    }
}
