use std::fmt;

/// Identifies a row: a table name and a row id within it.
///
/// Ordered by table, then row id, which gives the delay queue a
/// deterministic tie-break between requests due at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub table: String,
    pub row_id: String,
}

impl RowKey {
    pub fn new(table: impl Into<String>, row_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            row_id: row_id.into(),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.row_id)
    }
}
