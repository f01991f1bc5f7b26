//! The row store contract.
//!
//! [`Store`] is implemented by backends (see [`in_memory::InMemoryStore`])
//! and by the write-retention buffer, which delegates to another store.

pub mod in_memory;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::{ColumnFamilyData, MetaInformation, RowChanges};

/// A sparse-column row store.
///
/// All methods may fail with [`StoreError::Unavailable`](crate::StoreError::Unavailable)
/// when the backend cannot be reached.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads a row.
    ///
    /// Only the requested column families are returned; an empty `families`
    /// set returns every family. Returns `None` if the row does not exist.
    async fn get(
        &self,
        meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
        families: &BTreeSet<String>,
    ) -> StoreResult<Option<ColumnFamilyData>>;

    /// Applies changes to a row, creating it if necessary.
    ///
    /// Changed columns are written first, then removed columns are deleted,
    /// then counter columns are incremented.
    async fn store_changes(
        &self,
        meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
        changes: &RowChanges,
    ) -> StoreResult<()>;

    /// Deletes a whole row. Deleting a missing row is not an error.
    async fn delete(
        &self,
        meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
    ) -> StoreResult<()>;

    /// Returns true if the row exists.
    async fn exists(&self, table: &str, row_id: &str) -> StoreResult<bool> {
        Ok(self
            .get(None, table, row_id, &BTreeSet::new())
            .await?
            .is_some())
    }
}
