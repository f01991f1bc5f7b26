//! Mutation payloads exchanged with row stores.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

/// Cell values of a row, keyed by column family then column.
pub type ColumnFamilyData = BTreeMap<String, BTreeMap<String, Bytes>>;

/// Columns to remove from a row, keyed by column family.
pub type RemovedColumns = BTreeMap<String, BTreeSet<String>>;

/// Signed deltas to add to counter columns, keyed by column family then column.
pub type Increments = BTreeMap<String, BTreeMap<String, i64>>;

/// The changes to apply to a single row in one call.
///
/// An empty map means "no change of that kind". A payload where every map
/// is empty is still meaningful: storing it makes the row exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowChanges {
    /// Columns whose value is overwritten.
    pub changed: ColumnFamilyData,
    /// Columns that are removed.
    pub removed: RemovedColumns,
    /// Counter columns that are incremented.
    pub increments: Increments,
}

impl RowChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `family:column` to `value`.
    pub fn with_change(
        mut self,
        family: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.changed
            .entry(family.into())
            .or_default()
            .insert(column.into(), value.into());
        self
    }

    /// Removes `family:column`.
    pub fn with_removal(mut self, family: impl Into<String>, column: impl Into<String>) -> Self {
        self.removed
            .entry(family.into())
            .or_default()
            .insert(column.into());
        self
    }

    /// Adds `delta` to the counter at `family:column`.
    ///
    /// Repeated increments of the same column within one payload add up.
    pub fn with_increment(
        mut self,
        family: impl Into<String>,
        column: impl Into<String>,
        delta: i64,
    ) -> Self {
        *self
            .increments
            .entry(family.into())
            .or_default()
            .entry(column.into())
            .or_default() += delta;
        self
    }

    /// Returns true if no column is changed, removed or incremented.
    pub fn is_empty(&self) -> bool {
        self.column_count() == 0
    }

    /// Number of columns touched by this payload.
    pub fn column_count(&self) -> usize {
        self.changed.values().map(BTreeMap::len).sum::<usize>()
            + self.removed.values().map(BTreeSet::len).sum::<usize>()
            + self.increments.values().map(BTreeMap::len).sum::<usize>()
    }
}

/// Context travelling alongside a mutation, such as the persisted type or
/// schema hints a backend uses to create missing tables and families.
///
/// When several mutations are merged into one request, their meta
/// information is integrated with [`MetaInformation::integrate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaInformation {
    hints: BTreeMap<String, String>,
}

impl MetaInformation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.insert(key.into(), value.into());
        self
    }

    pub fn hint(&self, key: &str) -> Option<&str> {
        self.hints.get(key).map(String::as_str)
    }

    pub fn hints(&self) -> &BTreeMap<String, String> {
        &self.hints
    }

    /// Merges `other` into this meta information.
    ///
    /// Hints already present are kept; hints only known to `other` are added.
    pub fn integrate(&mut self, other: &MetaInformation) {
        for (key, value) in &other.hints {
            self.hints
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}
