//! Background eviction of due pending requests.
//!
//! The [`EvictionWorker`] takes requests from the delay queue as they become
//! due, seals them and sends their net effect to the backing store on a
//! bounded set of tasks. When shutdown is signalled it stops waiting and
//! flushes everything still buffered, one request at a time, before
//! reporting [`WorkerState::Stopped`].

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{Semaphore, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

use crate::buffer::Shared;
use crate::pending::PendingRequest;
use crate::row::RowKey;

/// Lifecycle of the eviction worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// The buffer has not been started; writes accumulate without flushing.
    Idle,
    /// Due requests are flushed as they come.
    Running,
    /// Shutdown was requested; every buffered request is being flushed.
    Draining,
    /// Everything has been flushed.
    Stopped,
}

/// Counts a flush as in flight for as long as it is alive.
///
/// Dropped when the send finishes, fails or panics, so shutdown never waits
/// on a flush that can no longer complete.
pub(crate) struct InFlight {
    shared: Arc<Shared>,
}

impl InFlight {
    pub(crate) fn enter(shared: &Arc<Shared>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        shared.metrics.in_flight_flushes.inc();
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.shared.metrics.in_flight_flushes.dec();
    }
}

/// A place in a row's send order.
///
/// Turns are reserved before a request is unrouted, so a request always
/// reserves after every earlier request of its row. A send waits for the
/// turn reserved before it; dropping the turn lets the next one proceed,
/// whether the send succeeded, failed or panicked.
pub(crate) struct SendTurn {
    shared: Arc<Shared>,
    key: RowKey,
    id: u64,
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl SendTurn {
    pub(crate) fn reserve(shared: &Arc<Shared>, key: &RowKey) -> Self {
        let id = shared.next_turn.fetch_add(1, Ordering::Relaxed);
        let (done, finished) = oneshot::channel();
        let previous = shared
            .turns
            .insert(key.clone(), (id, finished))
            .map(|(_, previous)| previous);
        Self {
            shared: Arc::clone(shared),
            key: key.clone(),
            id,
            previous,
            _done: done,
        }
    }

    pub(crate) fn key(&self) -> &RowKey {
        &self.key
    }

    /// Waits until every send reserved earlier for this row has finished.
    pub(crate) async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            // Resolves with an error once the previous turn is dropped.
            let _ = previous.await;
        }
    }
}

impl Drop for SendTurn {
    fn drop(&mut self) {
        self.shared
            .turns
            .remove_if(&self.key, |_, (id, _)| *id == self.id);
    }
}

pub(crate) struct EvictionWorker {
    shared: Arc<Shared>,
    senders: JoinSet<()>,
    permits: Arc<Semaphore>,
}

impl EvictionWorker {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let permits = Arc::new(Semaphore::new(shared.config.flush_concurrency));
        Self {
            shared,
            senders: JoinSet::new(),
            permits,
        }
    }

    /// Flushes requests as they become due until `shutdown` is signalled or
    /// its sender is dropped, then drains.
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.shared.state.send_replace(WorkerState::Running);
        info!(
            write_retention_ms = self.shared.config.write_retention.as_millis() as u64,
            flush_concurrency = self.shared.config.flush_concurrency,
            "eviction worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                Some(joined) = self.senders.join_next(), if !self.senders.is_empty() => {
                    log_join(joined);
                }
                request = self.shared.queue.take() => self.dispatch(request).await,
            }
        }

        self.drain().await;
    }

    async fn dispatch(&mut self, request: Arc<PendingRequest>) {
        let in_flight = InFlight::enter(&self.shared);
        let turn = SendTurn::reserve(&self.shared, request.key());
        // Unroute before sealing: a writer that still finds this request
        // either merges before the seal or retries against a new one.
        self.shared.forget(&request);
        let Some(effect) = request.seal() else {
            return;
        };

        let shared = Arc::clone(&self.shared);
        match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => {
                self.senders.spawn(async move {
                    let _permit = permit;
                    let _in_flight = in_flight;
                    shared.send(turn, &effect).await;
                });
            }
            // The semaphore is never closed; send inline rather than drop data.
            Err(_) => {
                shared.send(turn, &effect).await;
                drop(in_flight);
            }
        }
    }

    /// Flushes every buffered request sequentially, then waits for sends
    /// already dispatched.
    pub(crate) async fn drain(mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.state.send_replace(WorkerState::Draining);

        info!(
            pending = self.shared.queue.len(),
            in_flight = self.senders.len(),
            "draining pending requests"
        );

        // Queued requests stay counted as pending until they are flushed.
        while let Some(request) = self.shared.queue.pop() {
            self.flush(request).await;
        }

        // Requests routed by a writer that has not queued them yet. Writers
        // that queue one after this point flush it themselves.
        let unqueued: Vec<Arc<PendingRequest>> = self
            .shared
            .rows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for request in unqueued {
            self.flush(request).await;
        }

        while let Some(joined) = self.senders.join_next().await {
            log_join(joined);
        }

        self.shared.state.send_replace(WorkerState::Stopped);
        info!("eviction worker stopped");
    }

    async fn flush(&self, request: Arc<PendingRequest>) {
        let _in_flight = InFlight::enter(&self.shared);
        let turn = SendTurn::reserve(&self.shared, request.key());
        self.shared.forget(&request);
        if let Some(effect) = request.seal() {
            self.shared.send(turn, &effect).await;
        }
    }
}

/// Completes once shutdown is requested or the buffer is dropped.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which also stops the worker.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => debug!("flush task completed"),
        Err(err) => error!(error = %err, "flush task failed"),
    }
}
