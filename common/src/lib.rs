//! Store contract shared by the write-retention buffer and row store backends.
//!
//! A row store addresses data by table, row id, column family and column.
//! Writes to a single row are expressed as a [`RowChanges`] payload and are
//! applied through the [`Store`] trait.

pub mod error;
pub mod model;
pub mod storage;

pub use error::{StoreError, StoreResult};
pub use model::{ColumnFamilyData, Increments, MetaInformation, RemovedColumns, RowChanges};
pub use storage::Store;
pub use storage::in_memory::InMemoryStore;
