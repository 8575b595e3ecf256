//! Cache-first slice and metadata lookup.
//!
//! A [`SliceLoader`] sits between UI code and the [`TransportManager`].
//! Reads try the [`SliceCache`] first; misses become `request_slice`
//! messages whose replies are matched back to the waiting callers by
//! `file_id:slice_index`. Concurrent requests for one key share a single
//! network request.
//!
//! Three background tasks run for the loader's lifetime: the event router
//! (fills the cache and answers waiters), the prefetch pump (turns queued
//! [`PrefetchRequest`]s into requests) and, when configured, the L2 purge
//! timer.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{PrefetchRequest, SliceCache, SliceKey};
use crate::config::LoaderConfig;
use crate::error::MdiError;
use crate::protocol::SliceDataPayload;
use crate::protocol::json::{error_message_of, file_id_of, slice_index_of};
use crate::state::{PendingTable, Waiter};
use crate::transport::{TransportEvent, TransportManager};

// ── SliceFetcher ─────────────────────────────────────────────────

/// Out-of-band source used while the transport is not connected,
/// typically the server's HTTP API.
#[async_trait]
pub trait SliceFetcher: Send + Sync {
    async fn fetch_slice(&self, file_id: &str, slice_index: u32) -> Result<SliceDataPayload, MdiError>;

    async fn fetch_metadata(&self, file_id: &str) -> Result<Value, MdiError>;
}

// ── Shared state ─────────────────────────────────────────────────

struct Shared {
    cache: Arc<SliceCache>,
    transport: TransportManager,
    fetcher: Option<Arc<dyn SliceFetcher>>,
    config: LoaderConfig,
    slices: Mutex<PendingTable<SliceKey, SliceDataPayload>>,
    /// Keyed by `file_id`.
    metadata: Mutex<PendingTable<String, Value>>,
    closed: AtomicBool,
}

// ── SliceLoader ──────────────────────────────────────────────────

pub struct SliceLoader {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SliceLoader {
    /// Start the loader over `events`, the stream returned by
    /// [`TransportManager::spawn`].
    ///
    /// Every event is forwarded, after routing, to the returned receiver.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        cache: Arc<SliceCache>,
        transport: TransportManager,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: LoaderConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        Self::with_fetcher(cache, transport, events, config, None)
    }

    /// As [`new`](SliceLoader::new), falling back to `fetcher` while the
    /// transport is down.
    pub fn with_fetcher(
        cache: Arc<SliceCache>,
        transport: TransportManager,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: LoaderConfig,
        fetcher: Option<Arc<dyn SliceFetcher>>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let shared = Arc::new(Shared {
            cache,
            transport,
            fetcher,
            config,
            slices: Mutex::new(PendingTable::new()),
            metadata: Mutex::new(PendingTable::new()),
            closed: AtomicBool::new(false),
        });

        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let mut tasks = vec![
            tokio::spawn(route_events(Arc::clone(&shared), events, forward_tx)),
            tokio::spawn(pump_prefetch(Arc::clone(&shared))),
        ];
        if let Some(every) = shared.cache.config().purge_interval() {
            tasks.push(tokio::spawn(purge_periodically(Arc::clone(&shared), every)));
        }

        (
            Self {
                shared,
                tasks: Mutex::new(tasks),
            },
            forward_rx,
        )
    }

    pub fn cache(&self) -> &Arc<SliceCache> {
        &self.shared.cache
    }

    pub fn transport(&self) -> &TransportManager {
        &self.shared.transport
    }

    /// Fetch one slice: L1, then L2, then the network.
    pub async fn get_slice(&self, file_id: &str, slice_index: u32) -> Result<SliceDataPayload, MdiError> {
        self.shared.ensure_open()?;
        if let Some(slice) = self.shared.cache.get(file_id, slice_index).await? {
            return Ok(slice);
        }

        let key = SliceKey::new(file_id, slice_index);
        if !self.shared.transport.is_connected() {
            if let Some(fetcher) = &self.shared.fetcher {
                debug!(%key, "transport down; using fallback fetcher");
                let slice = fetcher.fetch_slice(file_id, slice_index).await?;
                self.shared.accept_slice(slice.clone()).await;
                return Ok(slice);
            }
        }

        let waiter = self.shared.request_slice(&key).await;
        wait_for(&self.shared.slices, &key, waiter, self.shared.config.request_timeout()).await
    }

    /// Fetch a file's metadata document.
    ///
    /// Replies are matched by their `file_id`; a reply without one answers
    /// the oldest outstanding request.
    pub async fn get_metadata(&self, file_id: &str) -> Result<Value, MdiError> {
        self.shared.ensure_open()?;
        if !self.shared.transport.is_connected() {
            if let Some(fetcher) = &self.shared.fetcher {
                return fetcher.fetch_metadata(file_id).await;
            }
        }

        let key = file_id.to_owned();
        let (waiter, first) = self.shared.metadata.lock().await.register(key.clone());
        if first {
            if let Err(e) = self.shared.transport.request_metadata(file_id).await {
                self.shared.metadata.lock().await.fail(&key, e);
            }
        }
        wait_for(&self.shared.metadata, &key, waiter, self.shared.config.request_timeout()).await
    }

    /// Outstanding slice and metadata requests.
    pub async fn pending(&self) -> usize {
        self.shared.slices.lock().await.len() + self.shared.metadata.lock().await.len()
    }

    /// Stop the background tasks and fail every waiter with
    /// [`MdiError::Terminated`]. Later calls fail the same way.
    ///
    /// The transport is left running; its owner shuts it down.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let failed = self.shared.reject_all(|| MdiError::Terminated).await;
        info!(failed, "slice loader shut down");
    }
}

impl Drop for SliceLoader {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl Shared {
    fn ensure_open(&self) -> Result<(), MdiError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MdiError::Terminated)
        } else {
            Ok(())
        }
    }

    /// Register a waiter for `key`, sending the request if nobody else
    /// already has.
    async fn request_slice(&self, key: &SliceKey) -> Waiter<SliceDataPayload> {
        let (waiter, first) = self.slices.lock().await.register(key.clone());
        if first {
            if let Err(e) = self.transport.request_slice(&key.file_id, key.slice_index).await {
                self.slices.lock().await.fail(key, e);
            }
        }
        waiter
    }

    async fn route(&self, event: &TransportEvent) {
        match event {
            TransportEvent::SliceData { slice, .. } => self.accept_slice(slice.clone()).await,
            TransportEvent::Metadata { metadata, .. } => self.accept_metadata(metadata).await,
            TransportEvent::Error { error, .. } => self.reject_for_error(error).await,
            TransportEvent::ConnectionError(MdiError::ReconnectExhausted(attempts)) => {
                let attempts = *attempts;
                let failed = self.reject_all(|| MdiError::ReconnectExhausted(attempts)).await;
                warn!(failed, "reconnection exhausted; pending requests failed");
            }
            _ => {}
        }
    }

    /// Cache an inbound slice and answer its waiters.
    async fn accept_slice(&self, slice: SliceDataPayload) {
        let key = SliceKey::new(slice.file_id.clone(), slice.slice_index);
        if let Err(e) = self.cache.put(slice.clone()).await {
            warn!(%key, "cache put failed: {e}");
        }
        let resolved = self.slices.lock().await.resolve(&key, slice);
        debug!(%key, resolved, "slice delivered");
    }

    async fn accept_metadata(&self, metadata: &Value) {
        let mut table = self.metadata.lock().await;
        let key = match file_id_of(metadata) {
            Some(id) => Some(id.to_owned()),
            None => table.oldest(),
        };
        match key {
            Some(key) => {
                let resolved = table.resolve(&key, metadata.clone());
                debug!(file_id = %key, resolved, "metadata delivered");
            }
            None => debug!("unsolicited metadata"),
        }
    }

    /// Fail the waiters a server ERROR names. With a `slice_index` only that
    /// slice fails; with just a `file_id` every request for the file does.
    async fn reject_for_error(&self, error: &Value) {
        let message = error_message_of(error);
        let Some(file_id) = file_id_of(error) else {
            warn!(%message, "server error without file_id");
            return;
        };
        let err = || MdiError::Server(message.clone());

        let mut failed = 0;
        match slice_index_of(error) {
            Some(index) => {
                failed += self.slices.lock().await.reject(&SliceKey::new(file_id, index), &err);
            }
            None => {
                let mut slices = self.slices.lock().await;
                while let Some(key) = slices.oldest_where(|k| k.file_id == file_id) {
                    failed += slices.reject(&key, &err);
                }
                drop(slices);
                failed += self.metadata.lock().await.reject(&file_id.to_owned(), &err);
            }
        }
        warn!(file_id, %message, failed, "server error");
    }

    async fn reject_all(&self, err: impl Fn() -> MdiError) -> usize {
        self.slices.lock().await.reject_all(&err) + self.metadata.lock().await.reject_all(&err)
    }

    async fn prefetch(self: &Arc<Self>, request: PrefetchRequest) {
        let PrefetchRequest { key, priority } = request;

        if self.transport.is_connected() {
            let waiter = {
                let mut table = self.slices.lock().await;
                if table.is_pending(&key) {
                    return;
                }
                table.register(key.clone()).0
            };
            if let Err(e) = self.transport.request_slice(&key.file_id, key.slice_index).await {
                self.slices.lock().await.fail(&key, e);
            }
            debug!(%key, priority, "prefetch requested");

            let shared = Arc::clone(self);
            tokio::spawn(async move {
                let timeout = shared.config.request_timeout();
                if let Err(e) = wait_for(&shared.slices, &key, waiter, timeout).await {
                    debug!(%key, "prefetch failed: {e}");
                }
            });
        } else if let Some(fetcher) = &self.fetcher {
            match fetcher.fetch_slice(&key.file_id, key.slice_index).await {
                Ok(slice) => self.accept_slice(slice).await,
                Err(e) => debug!(%key, "prefetch via fallback failed: {e}"),
            }
        } else {
            debug!(%key, priority, "transport down; prefetch dropped");
        }
    }
}

/// Wait on `waiter` for up to `timeout`. On expiry the caller's slot is
/// pruned from `table` and `Timeout` returned.
async fn wait_for<K, T>(
    table: &Mutex<PendingTable<K, T>>,
    key: &K,
    waiter: Waiter<T>,
    timeout: Duration,
) -> Result<T, MdiError>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    match tokio::time::timeout(timeout, waiter).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(MdiError::Terminated),
        Err(_) => {
            table.lock().await.prune(key);
            Err(MdiError::Timeout(timeout))
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

async fn route_events(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    forward: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        shared.route(&event).await;
        let _ = forward.send(event);
    }
    let failed = shared.reject_all(|| MdiError::ChannelClosed).await;
    debug!(failed, "transport event stream ended");
}

async fn pump_prefetch(shared: Arc<Shared>) {
    loop {
        shared.cache.prefetch_ready().await;
        while let Some(request) = shared.cache.next_prefetch().await {
            shared.prefetch(request).await;
        }
    }
}

async fn purge_periodically(shared: Arc<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match shared.cache.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired slices purged"),
            Err(e) => warn!("cache purge failed: {e}"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────
