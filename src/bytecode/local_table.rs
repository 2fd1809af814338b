use thiserror::Error;

/// Upper bound on local slots addressable by a `getlocal` operand.
pub const MAX_LOCALS: usize = u16::MAX as usize;

/// Words of environment data stored between the locals and the operand
/// stack of a frame (method entry, block handler, flags).
pub const ENV_DATA_SIZE: usize = 3;

/// How a local slot is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    /// Ordinary variable, read with `getlocal`.
    Plain,
    /// `&blk` parameter; aliases the block handler and is read with
    /// `getblockparam`.
    BlockProxy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    pub name: String,
    pub kind: LocalKind,
}

/// Result of resolving a name through the lexical scope chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalLookup {
    /// Declaration index in the owning table.
    pub index: usize,
    /// Number of parent links traversed; 0 is the current scope.
    pub level: usize,
    pub kind: LocalKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalError {
    #[error("local '{name}' already declared as {existing:?}, cannot redeclare as {requested:?}")]
    KindConflict {
        name: String,
        existing: LocalKind,
        requested: LocalKind,
    },
    #[error("too many locals (limit is {limit})")]
    TooMany { limit: usize },
}

/// Ordered registry of the local slots of one instruction sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTable {
    locals: Vec<Local>,
}

impl LocalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, returning its index.
    ///
    /// Declaring an existing name with the same kind is a no-op; the first
    /// declaration fixes the kind for good.
    pub fn declare(&mut self, name: &str, kind: LocalKind) -> Result<usize, LocalError> {
        if let Some((index, existing)) = self.find(name) {
            if existing != kind {
                return Err(LocalError::KindConflict {
                    name: name.to_string(),
                    existing,
                    requested: kind,
                });
            }
            return Ok(index);
        }
        if self.locals.len() >= MAX_LOCALS {
            return Err(LocalError::TooMany { limit: MAX_LOCALS });
        }
        self.locals.push(Local {
            name: name.to_string(),
            kind,
        });
        Ok(self.locals.len() - 1)
    }

    pub fn plain(&mut self, name: &str) -> Result<usize, LocalError> {
        self.declare(name, LocalKind::Plain)
    }

    pub fn block_proxy(&mut self, name: &str) -> Result<usize, LocalError> {
        self.declare(name, LocalKind::BlockProxy)
    }

    pub fn find(&self, name: &str) -> Option<(usize, LocalKind)> {
        self.locals
            .iter()
            .position(|local| local.name == name)
            .map(|index| (index, self.locals[index].kind))
    }

    pub fn get(&self, index: usize) -> Option<&Local> {
        self.locals.get(index)
    }

    pub fn size(&self) -> usize {
        self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.locals.iter().map(|local| local.name.as_str())
    }

    /// Operand emitted for the local at `index`.
    ///
    /// Locals are addressed downward from the environment pointer, so the
    /// offset depends on the final table size. Only call this once no more
    /// declarations can happen.
    pub fn offset(&self, index: usize) -> usize {
        self.size() + ENV_DATA_SIZE - 1 - index
    }

    /// Inverse of [`offset`](Self::offset).
    pub fn index_for_offset(&self, offset: usize) -> Option<usize> {
        let top = self.size() + ENV_DATA_SIZE - 1;
        if offset < ENV_DATA_SIZE || offset > top {
            return None;
        }
        Some(top - offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_is_idempotent() {
        let mut table = LocalTable::new();
        assert_eq!(table.plain("a").unwrap(), 0);
        assert_eq!(table.plain("b").unwrap(), 1);
        assert_eq!(table.plain("a").unwrap(), 0);
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn test_kind_conflict() {
        let mut table = LocalTable::new();
        table.block_proxy("blk").unwrap();
        let err = table.plain("blk").unwrap_err();
        assert!(matches!(err, LocalError::KindConflict { .. }));
        assert!(err.to_string().contains("blk"));
    }

    #[test]
    fn test_offsets_follow_table_size() {
        let mut table = LocalTable::new();
        table.plain("a").unwrap();
        assert_eq!(table.offset(0), 3);

        table.plain("b").unwrap();
        table.plain("c").unwrap();
        assert_eq!(table.offset(0), 5);
        assert_eq!(table.offset(1), 4);
        assert_eq!(table.offset(2), 3);
    }

    #[test]
    fn test_offset_round_trip() {
        let mut table = LocalTable::new();
        for name in ["x", "y", "z", "w"] {
            table.plain(name).unwrap();
        }
        for index in 0..table.size() {
            assert_eq!(table.index_for_offset(table.offset(index)), Some(index));
        }
        assert_eq!(table.index_for_offset(2), None);
        assert_eq!(table.index_for_offset(7), None);
    }
}
