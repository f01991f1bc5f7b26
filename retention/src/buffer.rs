//! The write-retention buffer.
//!
//! [`RetentionBuffer`] implements [`Store`] on top of another store. Writes
//! to a row are merged into that row's pending request and sent to the
//! backing store once the retention window has elapsed, so a burst of
//! mutations against one row costs a single backend call. Reads go straight
//! to the backing store.
//!
//! # Lifecycle
//!
//! A buffer is created idle: writes accumulate but nothing is flushed until
//! [`RetentionBuffer::start`] spawns the eviction worker.
//! [`RetentionBuffer::shutdown`] flushes everything still buffered and
//! returns once it has been sent; from then on writes go straight to the
//! backing store. Dropping a running buffer signals the worker to drain in
//! the background.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use common::{ColumnFamilyData, MetaInformation, RowChanges, Store, StoreResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::pending::{Merge, NetEffect, PendingRequest, RequestSealed};
use crate::queue::DelayQueue;
use crate::row::RowKey;
use crate::worker::{EvictionWorker, InFlight, SendTurn, WorkerState};

/// State shared between the buffer, its writers and the eviction worker.
pub(crate) struct Shared {
    pub(crate) config: RetentionConfig,
    pub(crate) store: Arc<dyn Store>,
    /// Routes each row to its active pending request.
    pub(crate) rows: DashMap<RowKey, Arc<PendingRequest>>,
    pub(crate) queue: DelayQueue,
    /// Set once shutdown begins; writes after that bypass the buffer.
    pub(crate) stopped: AtomicBool,
    pub(crate) in_flight: AtomicUsize,
    /// Latest send turn reserved per row; see [`SendTurn`].
    pub(crate) turns: DashMap<RowKey, (u64, oneshot::Receiver<()>)>,
    pub(crate) next_turn: AtomicU64,
    pub(crate) metrics: Metrics,
    pub(crate) state: watch::Sender<WorkerState>,
}

impl Shared {
    /// Returns the active request for `key`, opening one if there is none.
    fn resolve(&self, key: &RowKey) -> Arc<PendingRequest> {
        if let Some(existing) = self.rows.get(key) {
            return Arc::clone(existing.value());
        }

        let request = match self.rows.entry(key.clone()) {
            Entry::Occupied(entry) => return Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let flush_at = Instant::now() + self.config.write_retention;
                let request = Arc::new(PendingRequest::new(key.clone(), flush_at));
                entry.insert(Arc::clone(&request));
                request
            }
        };

        self.queue.put(Arc::clone(&request));
        self.metrics.requests_created_total.inc();
        debug!(table = %key.table, row_id = %key.row_id, "opened pending request");
        request
    }

    /// Unroutes `request`, unless its row already moved on to another one.
    pub(crate) fn forget(&self, request: &Arc<PendingRequest>) {
        self.rows
            .remove_if(request.key(), |_, current| Arc::ptr_eq(current, request));
    }

    fn try_merge<F>(
        &self,
        request: &PendingRequest,
        record: &F,
    ) -> std::result::Result<(), RequestSealed>
    where
        F: Fn(Merge<'_>),
    {
        let merge = request.start_merge()?;
        record(merge);
        self.metrics.merges_total.inc();
        Ok(())
    }

    /// Sends a sealed request's effect to the backing store once every
    /// earlier send for its row has finished.
    ///
    /// Failures are logged and counted, never retried.
    pub(crate) async fn send(&self, mut turn: SendTurn, effect: &NetEffect) {
        turn.wait().await;
        let key = turn.key();
        match effect.apply(self.store.as_ref(), key).await {
            Ok(()) => {
                self.metrics.record_flush(effect, true);
                debug!(
                    table = %key.table,
                    row_id = %key.row_id,
                    delete = effect.is_delete(),
                    "flushed pending request"
                );
            }
            Err(err) => {
                self.metrics.record_flush(effect, false);
                error!(
                    table = %key.table,
                    row_id = %key.row_id,
                    delete = effect.is_delete(),
                    error = %err,
                    "failed to flush pending request"
                );
            }
        }
    }

    /// Flushes `request` from the writer that merged into it, if shutdown
    /// started after the merge and the drain has not sealed it.
    async fn settle(self: &Arc<Self>, request: Arc<PendingRequest>) {
        if !self.stopped.load(Ordering::Acquire) {
            return;
        }
        let _in_flight = InFlight::enter(self);
        let turn = SendTurn::reserve(self, request.key());
        self.forget(&request);
        self.queue.remove(&request);
        if let Some(effect) = request.seal() {
            let key = request.key();
            debug!(
                table = %key.table,
                row_id = %key.row_id,
                "flushing request merged during shutdown"
            );
            self.send(turn, &effect).await;
        }
    }
}

enum Lifecycle {
    Idle,
    Running {
        shutdown_tx: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// A [`Store`] that holds writes for a retention window and coalesces them
/// per row before sending them to a backing store.
///
/// # Example
///
/// ```ignore
/// let buffer = RetentionBuffer::new(RetentionConfig::default(), store)?;
/// buffer.start();
/// buffer.store_changes(None, "users", "u1", &changes).await?;
/// buffer.shutdown().await?;
/// ```
pub struct RetentionBuffer {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl RetentionBuffer {
    /// Creates an idle buffer in front of `store`.
    pub fn new(config: RetentionConfig, store: Arc<dyn Store>) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(WorkerState::Idle);
        let shared = Arc::new(Shared {
            config,
            store,
            rows: DashMap::new(),
            queue: DelayQueue::new(),
            stopped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            turns: DashMap::new(),
            next_turn: AtomicU64::new(0),
            metrics: Metrics::new(),
            state,
        });
        Ok(Self {
            shared,
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Spawns the eviction worker on the current tokio runtime.
    ///
    /// Does nothing if the buffer was already started or shut down.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            debug!("retention buffer already started");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = EvictionWorker::new(Arc::clone(&self.shared));
        let handle = tokio::spawn(worker.run(shutdown_rx));
        *lifecycle = Lifecycle::Running {
            shutdown_tx,
            handle,
        };
    }

    /// Flushes every buffered request and stops buffering.
    ///
    /// Returns once every flush has been sent, successfully or not. Writes
    /// issued afterwards go directly to the backing store. Calling this more
    /// than once is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.stopped.store(true, Ordering::Release);
        let lifecycle = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);

        match lifecycle {
            Lifecycle::Idle => {
                info!("retention buffer shutting down before start");
                EvictionWorker::new(Arc::clone(&self.shared)).drain().await;
            }
            Lifecycle::Running {
                shutdown_tx,
                handle,
            } => {
                info!("retention buffer shutting down");
                // Fails only if the worker already exited; awaiting its
                // handle reports why.
                let _ = shutdown_tx.send(true);
                handle.await?;
            }
            Lifecycle::Stopped => {}
        }
        Ok(())
    }

    /// Number of requests waiting for their flush plus flushes being sent.
    pub fn pending_request_count(&self) -> usize {
        self.shared.queue.len() + self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn worker_state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    /// Watches the eviction worker's state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.shared.state.subscribe()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Merges a mutation into the row's pending request, retrying against a
    /// fresh request whenever the current one gets sealed first.
    ///
    /// Returns false once the buffer has stopped; the caller must then write
    /// to the backing store itself.
    async fn merge<F>(&self, key: &RowKey, record: F) -> bool
    where
        F: Fn(Merge<'_>),
    {
        loop {
            if self.shared.stopped.load(Ordering::Acquire) {
                return false;
            }

            let request = self.shared.resolve(key);
            match self.shared.try_merge(&request, &record) {
                Ok(()) => {
                    self.shared.settle(request).await;
                    return true;
                }
                Err(RequestSealed) => {
                    self.shared.metrics.sealed_retries_total.inc();
                    self.shared.forget(&request);
                    self.shared.queue.remove(&request);
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

#[async_trait]
impl Store for RetentionBuffer {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(
        &self,
        meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
        families: &BTreeSet<String>,
    ) -> StoreResult<Option<ColumnFamilyData>> {
        self.shared.store.get(meta, table, row_id, families).await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn store_changes(
        &self,
        meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
        changes: &RowChanges,
    ) -> StoreResult<()> {
        let key = RowKey::new(table, row_id);
        if self
            .merge(&key, |merge| merge.record_update(meta, changes))
            .await
        {
            return Ok(());
        }

        self.shared.metrics.passthrough_writes_total.inc();
        debug!(table, row_id, "buffer stopped, storing changes directly");
        let mut turn = SendTurn::reserve(&self.shared, &key);
        turn.wait().await;
        self.shared
            .store
            .store_changes(meta, table, row_id, changes)
            .await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn delete(
        &self,
        meta: Option<&MetaInformation>,
        table: &str,
        row_id: &str,
    ) -> StoreResult<()> {
        let key = RowKey::new(table, row_id);
        if self.merge(&key, |merge| merge.record_delete(meta)).await {
            return Ok(());
        }

        self.shared.metrics.passthrough_writes_total.inc();
        debug!(table, row_id, "buffer stopped, deleting directly");
        let mut turn = SendTurn::reserve(&self.shared, &key);
        turn.wait().await;
        self.shared.store.delete(meta, table, row_id).await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn exists(&self, table: &str, row_id: &str) -> StoreResult<bool> {
        self.shared.store.exists(table, row_id).await
    }
}
