//! Per-row accumulation of buffered mutations.
//!
//! A [`PendingRequest`] collects every update and delete issued against one
//! row during a retention window. Each merge is tagged with a transaction id
//! taken from a per-request counter, so merges performed concurrently from
//! different threads can be combined deterministically when the request is
//! sealed, whatever order they were recorded in.
//!
//! Merging and sealing are coordinated by a reader-writer gate: any number
//! of merges hold it in shared mode, sealing takes it exclusively. A merge
//! that starts after the request was sealed fails with [`RequestSealed`] and
//! must be retried against a fresh request.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use common::{MetaInformation, RowChanges, Store, StoreResult};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::time::Instant;

use crate::row::RowKey;

/// Number of delete transactions remembered by a request. Only the latest
/// one decides the outcome; the second absorbs deletes recorded out of order.
const DELETION_HISTORY: usize = 2;

/// Returned when a merge targets a request that is already being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSealed;

impl std::error::Error for RequestSealed {}

impl std::fmt::Display for RequestSealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pending request is sealed")
    }
}

/// A value recorded for a column by one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cell {
    Value(Bytes),
    Removed,
    Increment(i64),
}

impl Cell {
    fn delta(&self) -> Option<i64> {
        match self {
            Cell::Increment(delta) => Some(*delta),
            _ => None,
        }
    }
}

/// What a sealed request sends to the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEffect {
    /// Apply the merged column changes.
    Store {
        meta: Option<MetaInformation>,
        changes: RowChanges,
    },
    /// Delete the whole row.
    Delete { meta: Option<MetaInformation> },
}

impl NetEffect {
    /// Sends this effect for `key` to `store`.
    pub async fn apply(&self, store: &dyn Store, key: &RowKey) -> StoreResult<()> {
        match self {
            NetEffect::Store { meta, changes } => {
                store
                    .store_changes(meta.as_ref(), &key.table, &key.row_id, changes)
                    .await
            }
            NetEffect::Delete { meta } => {
                store
                    .delete(meta.as_ref(), &key.table, &key.row_id)
                    .await
            }
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, NetEffect::Delete { .. })
    }
}

/// Mutations buffered for a single row, awaiting their flush.
pub struct PendingRequest {
    key: RowKey,
    flush_at: Instant,
    next_transaction: AtomicU64,
    sealed: AtomicBool,
    gate: RwLock<()>,
    deletions: Mutex<BTreeSet<u64>>,
    /// (family, column) -> transaction id -> value
    columns: DashMap<(String, String), BTreeMap<u64, Cell>>,
    meta: Mutex<Option<MetaInformation>>,
}

impl PendingRequest {
    /// Creates an empty request for `key`, eligible for flushing at `flush_at`.
    pub fn new(key: RowKey, flush_at: Instant) -> Self {
        Self {
            key,
            flush_at,
            next_transaction: AtomicU64::new(0),
            sealed: AtomicBool::new(false),
            gate: RwLock::new(()),
            deletions: Mutex::new(BTreeSet::new()),
            columns: DashMap::new(),
            meta: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    pub fn flush_at(&self) -> Instant {
        self.flush_at
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Starts a merge and assigns it a transaction id.
    ///
    /// Blocks while the request is being sealed. The returned guard holds
    /// the gate in shared mode until it records its mutation or is dropped.
    pub fn start_merge(&self) -> Result<Merge<'_>, RequestSealed> {
        if self.is_sealed() {
            return Err(RequestSealed);
        }
        let gate = self.gate.read();
        // The request may have been sealed while we waited for the gate.
        if self.is_sealed() {
            return Err(RequestSealed);
        }
        let transaction = self.next_transaction.fetch_add(1, Ordering::AcqRel);
        Ok(Merge {
            request: self,
            transaction,
            _gate: gate,
        })
    }

    /// Seals the request and computes what must be sent to the store.
    ///
    /// Waits for in-flight merges to finish. Returns `None` if the request
    /// was already sealed, so each request is flushed at most once, or if
    /// no merge ever started on it.
    pub fn seal(&self) -> Option<NetEffect> {
        {
            let _gate = self.gate.write();
            if self.sealed.swap(true, Ordering::AcqRel) {
                return None;
            }
        }
        if self.next_transaction.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.net_effect())
    }

    fn net_effect(&self) -> NetEffect {
        let last_delete = self.deletions.lock().last().copied();
        let meta = self.meta.lock().clone();

        let mut last_write: Option<u64> = None;
        let mut changes = RowChanges::new();
        for entry in self.columns.iter() {
            let (family, column) = entry.key();
            let history = entry.value();
            let Some((&latest, _)) = history.last_key_value() else {
                continue;
            };
            last_write = last_write.max(Some(latest));

            // Written, then deleted along with the whole row.
            if last_delete.is_some_and(|deleted| latest <= deleted) {
                continue;
            }

            // The latest overwrite or removal; increments after it add up.
            let base = history
                .iter()
                .rev()
                .find(|(_, cell)| cell.delta().is_none());
            if let Some((&transaction, cell)) = base
                && last_delete.is_none_or(|deleted| transaction > deleted)
            {
                match cell {
                    Cell::Value(value) => {
                        changes
                            .changed
                            .entry(family.clone())
                            .or_default()
                            .insert(column.clone(), value.clone());
                    }
                    Cell::Removed => {
                        changes
                            .removed
                            .entry(family.clone())
                            .or_default()
                            .insert(column.clone());
                    }
                    Cell::Increment(_) => {}
                }
            }

            let after_base = match base {
                Some((&transaction, _)) => {
                    history.range((Bound::Excluded(transaction), Bound::Unbounded))
                }
                None => history.range(..),
            };
            let mut deltas = after_base
                .filter_map(|(_, cell)| cell.delta())
                .peekable();
            if deltas.peek().is_some() {
                let total = deltas.fold(0i64, i64::wrapping_add);
                changes
                    .increments
                    .entry(family.clone())
                    .or_default()
                    .insert(column.clone(), total);
            }
        }

        match last_delete {
            Some(deleted) if last_write.is_none_or(|written| written <= deleted) => {
                NetEffect::Delete { meta }
            }
            _ => NetEffect::Store { meta, changes },
        }
    }

    fn integrate_meta(&self, meta: Option<&MetaInformation>) {
        let Some(meta) = meta else {
            return;
        };
        let mut current = self.meta.lock();
        match current.as_mut() {
            Some(existing) => existing.integrate(meta),
            None => *current = Some(meta.clone()),
        }
    }

    fn record_cell(&self, family: &str, column: &str, transaction: u64, cell: Cell) {
        let prune = cell.delta().is_none();
        let mut history = self
            .columns
            .entry((family.to_string(), column.to_string()))
            .or_default();
        let previous = history.insert(transaction, cell);
        debug_assert!(previous.is_none(), "transaction recorded twice");
        if prune {
            // Only entries at or after this transaction can still matter.
            // Newer entries recorded first by concurrent merges are kept.
            let retained = history.split_off(&transaction);
            *history = retained;
        }
    }

    #[cfg(test)]
    fn history_len(&self, family: &str, column: &str) -> usize {
        self.columns
            .get(&(family.to_string(), column.to_string()))
            .map_or(0, |history| history.len())
    }
}

/// A merge in progress against a [`PendingRequest`].
///
/// Holds the request's gate in shared mode, which keeps the request from
/// being sealed until the mutation is recorded. Each merge records exactly
/// one mutation under its transaction id.
pub struct Merge<'a> {
    request: &'a PendingRequest,
    transaction: u64,
    _gate: RwLockReadGuard<'a, ()>,
}

impl Merge<'_> {
    pub fn transaction(&self) -> u64 {
        self.transaction
    }

    /// Records a delete of the whole row.
    pub fn record_delete(self, meta: Option<&MetaInformation>) {
        {
            let mut deletions = self.request.deletions.lock();
            deletions.insert(self.transaction);
            while deletions.len() > DELETION_HISTORY {
                deletions.pop_first();
            }
        }
        self.request.integrate_meta(meta);
    }

    /// Records column changes, removals and increments.
    pub fn record_update(self, meta: Option<&MetaInformation>, changes: &RowChanges) {
        self.request.integrate_meta(meta);

        for (family, columns) in &changes.changed {
            for (column, value) in columns {
                self.request.record_cell(
                    family,
                    column,
                    self.transaction,
                    Cell::Value(value.clone()),
                );
            }
        }

        for (family, columns) in &changes.increments {
            for (column, delta) in columns {
                self.request.record_cell(
                    family,
                    column,
                    self.transaction,
                    Cell::Increment(*delta),
                );
            }
        }

        for (family, columns) in &changes.removed {
            for column in columns {
                self.request
                    .record_cell(family, column, self.transaction, Cell::Removed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn request() -> PendingRequest {
        PendingRequest::new(RowKey::new("users", "u1"), Instant::now())
    }

    fn update(request: &PendingRequest, changes: RowChanges) {
        request
            .start_merge()
            .unwrap()
            .record_update(None, &changes);
    }

    fn delete(request: &PendingRequest) {
        request.start_merge().unwrap().record_delete(None);
    }

    fn stored_changes(effect: NetEffect) -> RowChanges {
        match effect {
            NetEffect::Store { changes, .. } => changes,
            NetEffect::Delete { .. } => panic!("expected a store, got a delete"),
        }
    }

    #[test]
    fn should_assign_strictly_increasing_transactions() {
        // given
        let request = request();

        // when
        let first = request.start_merge().unwrap().transaction();
        let second = request.start_merge().unwrap().transaction();
        let third = request.start_merge().unwrap().transaction();

        // then
        assert!(first < second);
        assert!(second < third);
    }

    #[test]
    fn should_keep_latest_value_of_column() {
        // given
        let request = request();
        update(&request, RowChanges::new().with_change("props", "name", "a"));
        update(&request, RowChanges::new().with_change("props", "name", "b"));

        // when
        let changes = stored_changes(request.seal().unwrap());

        // then
        assert_eq!(changes.changed["props"]["name"], Bytes::from("b"));
        assert_eq!(changes.column_count(), 1);
    }

    #[test]
    fn should_order_values_by_transaction_not_arrival() {
        // given - the later transaction is recorded first
        let request = request();
        let early = request.start_merge().unwrap();
        let late = request.start_merge().unwrap();
        late.record_update(None, &RowChanges::new().with_change("props", "name", "b"));
        early.record_update(None, &RowChanges::new().with_change("props", "name", "a"));

        // when
        let changes = stored_changes(request.seal().unwrap());

        // then
        assert_eq!(changes.changed["props"]["name"], Bytes::from("b"));
    }

    #[test]
    fn should_sum_increments() {
        // given
        let request = request();
        for delta in [3, 5, -2] {
            update(&request, RowChanges::new().with_increment("stats", "visits", delta));
        }

        // when
        let changes = stored_changes(request.seal().unwrap());

        // then
        assert_eq!(changes.increments["stats"]["visits"], 6);
        assert!(changes.changed.is_empty());
    }

    #[test]
    fn should_keep_overwrite_before_following_increments() {
        // given
        let request = request();
        update(&request, RowChanges::new().with_increment("stats", "visits", 4));
        update(
            &request,
            RowChanges::new().with_change("stats", "visits", 5i64.to_be_bytes().to_vec()),
        );
        update(&request, RowChanges::new().with_increment("stats", "visits", 1));

        // when
        let changes = stored_changes(request.seal().unwrap());

        // then
        assert_eq!(
            changes.changed["stats"]["visits"],
            Bytes::copy_from_slice(&5i64.to_be_bytes())
        );
        assert_eq!(changes.increments["stats"]["visits"], 1);
    }

    #[test]
    fn should_turn_latest_removal_into_removed_column() {
        // given
        let request = request();
        update(&request, RowChanges::new().with_change("props", "email", "a@example.com"));
        update(&request, RowChanges::new().with_removal("props", "email"));

        // when
        let changes = stored_changes(request.seal().unwrap());

        // then
        assert!(changes.changed.is_empty());
        assert!(changes.removed["props"].contains("email"));
    }

    #[test]
    fn should_flush_delete_when_delete_comes_last() {
        // given
        let request = request();
        update(&request, RowChanges::new().with_change("props", "name", "a"));
        delete(&request);

        // when
        let effect = request.seal().unwrap();

        // then
        assert!(effect.is_delete());
    }

    #[test]
    fn should_flush_delete_without_any_write() {
        // given
        let request = request();
        delete(&request);

        // when
        let effect = request.seal().unwrap();

        // then
        assert_eq!(effect, NetEffect::Delete { meta: None });
    }

    #[test]
    fn should_store_writes_issued_after_delete() {
        // given
        let request = request();
        update(&request, RowChanges::new().with_change("props", "email", "old"));
        delete(&request);
        update(&request, RowChanges::new().with_change("props", "name", "new"));

        // when
        let changes = stored_changes(request.seal().unwrap());

        // then - the column written before the delete is left out
        assert_eq!(changes.changed["props"].len(), 1);
        assert_eq!(changes.changed["props"]["name"], Bytes::from("new"));
    }

    #[test]
    fn should_sum_increments_across_a_delete() {
        // given
        let request = request();
        update(&request, RowChanges::new().with_increment("stats", "visits", 2));
        delete(&request);
        update(&request, RowChanges::new().with_increment("stats", "visits", 3));

        // when
        let changes = stored_changes(request.seal().unwrap());

        // then
        assert_eq!(changes.increments["stats"]["visits"], 5);
    }

    #[test]
    fn should_flush_empty_store_without_mutations() {
        // given
        let request = request();
        update(&request, RowChanges::new());

        // when
        let effect = request.seal().unwrap();

        // then
        assert_eq!(
            effect,
            NetEffect::Store {
                meta: None,
                changes: RowChanges::new()
            }
        );
    }

    #[test]
    fn should_prune_overwritten_values() {
        // given
        let request = request();

        // when
        for value in ["a", "b", "c", "d"] {
            update(&request, RowChanges::new().with_change("props", "name", value));
        }
        update(&request, RowChanges::new().with_removal("props", "name"));

        // then
        assert_eq!(request.history_len("props", "name"), 1);
    }

    #[test]
    fn should_retain_newer_entries_when_pruning() {
        // given
        let request = request();
        let early = request.start_merge().unwrap();
        let late = request.start_merge().unwrap();

        // when
        late.record_update(None, &RowChanges::new().with_change("props", "name", "b"));
        early.record_update(None, &RowChanges::new().with_change("props", "name", "a"));

        // then
        assert_eq!(request.history_len("props", "name"), 2);
    }

    #[test]
    fn should_retain_every_increment() {
        // given
        let request = request();

        // when
        for _ in 0..5 {
            update(&request, RowChanges::new().with_increment("stats", "visits", 1));
        }

        // then
        assert_eq!(request.history_len("stats", "visits"), 5);
    }

    #[test]
    fn should_remember_two_latest_deletions() {
        // given
        let request = request();

        // when
        for _ in 0..4 {
            delete(&request);
        }

        // then
        let deletions = request.deletions.lock().clone();
        assert_eq!(deletions.into_iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn should_integrate_meta_of_every_merge() {
        // given
        let request = request();
        let first = MetaInformation::new().with_hint("class", "User");
        let second = MetaInformation::new()
            .with_hint("class", "Other")
            .with_hint("schema", "v2");
        request
            .start_merge()
            .unwrap()
            .record_update(Some(&first), &RowChanges::new().with_change("props", "name", "a"));
        request.start_merge().unwrap().record_update(None, &RowChanges::new());
        request.start_merge().unwrap().record_delete(Some(&second));

        // when
        let effect = request.seal().unwrap();

        // then
        let NetEffect::Delete { meta: Some(meta) } = effect else {
            panic!("expected a delete carrying meta information");
        };
        assert_eq!(meta.hint("class"), Some("User"));
        assert_eq!(meta.hint("schema"), Some("v2"));
    }

    #[test]
    fn should_reject_merge_after_seal() {
        // given
        let request = request();
        update(&request, RowChanges::new().with_change("props", "name", "a"));
        request.seal().unwrap();

        // when
        let result = request.start_merge();

        // then
        assert!(matches!(result, Err(RequestSealed)));
        assert!(request.is_sealed());
    }

    #[test]
    fn should_have_nothing_to_flush_without_merges() {
        // given
        let request = request();

        // when
        let effect = request.seal();

        // then
        assert!(effect.is_none());
        assert!(request.start_merge().is_err());
    }

    #[test]
    fn should_seal_only_once() {
        // given
        let request = request();
        update(&request, RowChanges::new().with_change("props", "name", "a"));

        // when
        let first = request.seal();
        let second = request.seal();

        // then
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn should_wait_for_in_flight_merge_before_sealing() {
        // given
        let request = Arc::new(request());
        let merge = request.start_merge().unwrap();
        let (tx, rx) = mpsc::channel();
        let sealer = {
            let request = Arc::clone(&request);
            thread::spawn(move || {
                let effect = request.seal();
                tx.send(()).unwrap();
                effect
            })
        };

        // when
        thread::sleep(Duration::from_millis(50));
        let sealed_early = rx.try_recv().is_ok();
        merge.record_update(None, &RowChanges::new().with_change("props", "name", "a"));
        let effect = sealer.join().unwrap().unwrap();

        // then
        assert!(!sealed_early);
        let changes = stored_changes(effect);
        assert_eq!(changes.changed["props"]["name"], Bytes::from("a"));
    }
}
