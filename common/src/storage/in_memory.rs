//! In-memory [`Store`] implementation.
//!
//! Used by tests and benchmarks in place of a real row store. Counters are
//! stored as 8-byte big-endian signed integers, the way column stores
//! usually encode atomic increments.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::Store;
use crate::error::{StoreError, StoreResult};
use crate::model::{ColumnFamilyData, MetaInformation, RowChanges};

type Table = BTreeMap<String, ColumnFamilyData>;

/// A row store kept entirely in memory.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored in `table`.
    pub async fn row_count(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, Table::len)
    }

    /// Reads the counter at `family:column`, or `None` if the row or
    /// column is missing.
    pub async fn counter(
        &self,
        table: &str,
        row_id: &str,
        family: &str,
        column: &str,
    ) -> StoreResult<Option<i64>> {
        let tables = self.tables.read().await;
        let cell = tables
            .get(table)
            .and_then(|rows| rows.get(row_id))
            .and_then(|row| row.get(family))
            .and_then(|columns| columns.get(column));
        cell.map(|value| decode_counter(family, column, value))
            .transpose()
    }
}

fn decode_counter(family: &str, column: &str, value: &Bytes) -> StoreResult<i64> {
    let raw: [u8; 8] = value.as_ref().try_into().map_err(|_| {
        StoreError::Internal(format!(
            "column {}:{} holds {} bytes, not a counter",
            family,
            column,
            value.len()
        ))
    })?;
    Ok(i64::from_be_bytes(raw))
}

#[async_trait]
impl Store for InMemoryStore {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(
        &self,
        _meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
        families: &BTreeSet<String>,
    ) -> StoreResult<Option<ColumnFamilyData>> {
        let tables = self.tables.read().await;
        let Some(row) = tables.get(table).and_then(|rows| rows.get(row_id)) else {
            return Ok(None);
        };

        if families.is_empty() {
            return Ok(Some(row.clone()));
        }
        Ok(Some(
            row.iter()
                .filter(|(family, _)| families.contains(*family))
                .map(|(family, columns)| (family.clone(), columns.clone()))
                .collect(),
        ))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn store_changes(
        &self,
        _meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
        changes: &RowChanges,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        // Applied to a copy so that a bad increment leaves the row untouched.
        let mut row = rows.get(row_id).cloned().unwrap_or_default();

        for (family, columns) in &changes.changed {
            let family_data = row.entry(family.clone()).or_default();
            for (column, value) in columns {
                family_data.insert(column.clone(), value.clone());
            }
        }

        for (family, columns) in &changes.removed {
            if let Some(family_data) = row.get_mut(family) {
                for column in columns {
                    family_data.remove(column);
                }
                if family_data.is_empty() {
                    row.remove(family);
                }
            }
        }

        for (family, columns) in &changes.increments {
            let family_data = row.entry(family.clone()).or_default();
            for (column, delta) in columns {
                let current = match family_data.get(column) {
                    Some(value) => decode_counter(family, column, value)?,
                    None => 0,
                };
                let next = current.wrapping_add(*delta);
                family_data.insert(column.clone(), Bytes::copy_from_slice(&next.to_be_bytes()));
            }
        }

        rows.insert(row_id.to_string(), row);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn delete(
        &self,
        _meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
    ) -> StoreResult<()> {
        if let Some(rows) = self.tables.write().await.get_mut(table) {
            rows.remove(row_id);
        }
        Ok(())
    }
}
