use serde::{Deserialize, Serialize};

/// Source span of a node.
///
/// Lines are 1-based, columns and character offsets are 0-based, matching
/// what the external parser reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    pub start_line: usize,
    pub start_column: usize,
    pub end_line: usize,
    pub end_column: usize,
    pub start_char: usize,
    pub end_char: usize,
}

impl Location {
    /// A zero-width location on a single line.
    pub fn line(line: usize) -> Self {
        Self {
            start_line: line,
            end_line: line,
            ..Self::default()
        }
    }

    /// The smallest location covering both `self` and `other`.
    pub fn to(self, other: Location) -> Self {
        Self {
            start_line: self.start_line,
            start_column: self.start_column,
            start_char: self.start_char,
            end_line: other.end_line,
            end_column: other.end_column,
            end_char: other.end_char,
        }
    }
}

impl std::fmt::Display for Location {
    /// Formats as `line:col` for CLI-friendly diagnostics.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.start_line, self.start_column)
    }
}
