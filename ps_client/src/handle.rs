use std::fmt;

/// Opaque reference to one remote table, returned by `create_table`.
///
/// Handles are only meaningful on the cluster that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableHandle(usize);

impl TableHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// The table's creation index on its cluster.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}
