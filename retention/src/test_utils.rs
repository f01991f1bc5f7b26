use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    ColumnFamilyData, InMemoryStore, MetaInformation, RowChanges, Store, StoreError, StoreResult,
};

/// A write that reached the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Store {
        table: String,
        row_id: String,
        meta: Option<MetaInformation>,
        changes: RowChanges,
    },
    Delete {
        table: String,
        row_id: String,
        meta: Option<MetaInformation>,
    },
}

impl Call {
    pub(crate) fn row_id(&self) -> &str {
        match self {
            Call::Store { row_id, .. } | Call::Delete { row_id, .. } => row_id,
        }
    }

    pub(crate) fn changes(&self) -> &RowChanges {
        match self {
            Call::Store { changes, .. } => changes,
            Call::Delete { .. } => panic!("expected a store, got {:?}", self),
        }
    }
}

/// Shared state for RecordingStore - lets tests inspect writes and inject failures
#[derive(Default)]
struct RecordingState {
    calls: Vec<Call>,
    failing: bool,
    /// Delays applied to the next writes, in order, before they are recorded
    delays: VecDeque<Duration>,
}

/// A backing store that records every write before applying it to an
/// in-memory store.
#[derive(Clone, Default)]
pub(crate) struct RecordingStore {
    state: Arc<Mutex<RecordingState>>,
    inner: Arc<InMemoryStore>,
}

impl RecordingStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail with `StoreError::Unavailable`.
    pub(crate) fn failing() -> Self {
        let store = Self::default();
        store.state.lock().unwrap().failing = true;
        store
    }

    /// Holds the next write for `delay` before recording and applying it.
    /// Successive calls queue delays for successive writes.
    pub(crate) fn delay_next_write(&self, delay: Duration) {
        self.state.lock().unwrap().delays.push_back(delay);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Recorded calls sorted by row id, for assertions that do not depend on
    /// flush order.
    pub(crate) fn calls_by_row(&self) -> Vec<Call> {
        let mut calls = self.calls();
        calls.sort_by(|a, b| a.row_id().cmp(b.row_id()));
        calls
    }

    pub(crate) fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    async fn hold(&self) {
        let delay = self.state.lock().unwrap().delays.pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, call: Call) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.failing {
            return Err(StoreError::Unavailable("backend is down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn get(
        &self,
        meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
        families: &BTreeSet<String>,
    ) -> StoreResult<Option<ColumnFamilyData>> {
        self.inner.get(meta, table, row_id, families).await
    }

    async fn store_changes(
        &self,
        meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
        changes: &RowChanges,
    ) -> StoreResult<()> {
        self.hold().await;
        self.record(Call::Store {
            table: table.to_string(),
            row_id: row_id.to_string(),
            meta: meta.cloned(),
            changes: changes.clone(),
        })?;
        self.inner.store_changes(meta, table, row_id, changes).await
    }

    async fn delete(
        &self,
        meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
    ) -> StoreResult<()> {
        self.hold().await;
        self.record(Call::Delete {
            table: table.to_string(),
            row_id: row_id.to_string(),
            meta: meta.cloned(),
        })?;
        self.inner.delete(meta, table, row_id).await
    }
}
