//! Worker offload: runs frame decoding and pixel transforms on a
//! dedicated thread, with a synchronous fallback.
//!
//! Every call gets an id in a pending table. Requests cross to the thread
//! over a bounded channel; a router task matches replies back to their
//! callers. A per-call timeout clears the entry if the reply never comes.
//!
//! ```text
//!  caller ──Request{id, job}──► mdi-offload thread
//!    ▲                                 │
//!    └── oneshot ◄── router task ◄─────┘ (id, result)
//! ```
//!
//! The thread starts on first use. [`WorkerOffload::terminate`] rejects
//! every pending call and stops it; the next call starts a fresh one. If
//! the thread cannot be started at all the manager drops to synchronous
//! execution for good, or fails with a configuration error when fallback
//! is disabled.

pub mod pixels;
mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::codec::MdiCodec;
use crate::config::WorkerConfig;
use crate::error::MdiError;
use crate::protocol::{DecodedFrame, PixelBuffer};
use crate::state::PendingTable;

pub use pixels::{DEFAULT_BINS, Histogram, MinMax, WindowLevel, histogram, min_max, window_level};
pub use worker::{Job, JobOutput, THREAD_NAME, run_job};

use worker::{Reply, Request};

/// How calls are currently executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadMode {
    /// Background enabled; the thread starts on the next call.
    Idle,
    Background,
    /// The thread could not be started; calls run inline.
    Fallback,
    /// Configured for synchronous execution only.
    Inline,
}

enum Mode {
    Idle,
    Running {
        requests: mpsc::Sender<Request>,
        generation: u64,
    },
    Fallback,
}

struct Inner {
    config: WorkerConfig,
    codec: MdiCodec,
    mode: Mutex<Mode>,
    pending: Mutex<PendingTable<u64, JobOutput>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    #[cfg(test)]
    fail_spawn: std::sync::atomic::AtomicBool,
}

/// Cloneable handle; clones share one thread and one pending table.
#[derive(Clone)]
pub struct WorkerOffload {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkerOffload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOffload")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl WorkerOffload {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                codec: MdiCodec::new(),
                mode: Mutex::new(Mode::Idle),
                pending: Mutex::new(PendingTable::new()),
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                #[cfg(test)]
                fail_spawn: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    // ── Operations ───────────────────────────────────────────────

    pub async fn decode(&self, frame: Bytes) -> Result<DecodedFrame, MdiError> {
        match self.execute(Job::Decode(frame)).await? {
            JobOutput::Decoded(frame) => Ok(frame),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn window_level(&self, pixels: PixelBuffer, params: WindowLevel) -> Result<Vec<u8>, MdiError> {
        match self.execute(Job::WindowLevel { pixels, params }).await? {
            JobOutput::Windowed(out) => Ok(out),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn histogram(&self, pixels: PixelBuffer, bins: usize) -> Result<Histogram, MdiError> {
        match self.execute(Job::Histogram { pixels, bins }).await? {
            JobOutput::Histogram(h) => Ok(h),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn min_max(&self, pixels: PixelBuffer) -> Result<MinMax, MdiError> {
        match self.execute(Job::MinMax(pixels)).await? {
            JobOutput::MinMax(mm) => Ok(mm),
            other => Err(unexpected(&other)),
        }
    }

    /// Run `job` in the background if possible, inline otherwise.
    pub async fn execute(&self, job: Job) -> Result<JobOutput, MdiError> {
        let Some(requests) = self.ensure_worker().await? else {
            return run_job(&self.inner.codec, job);
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, _) = self.inner.pending.lock().await.register(id);

        // The deadline covers waiting for queue space as well as the reply.
        let call = async move {
            if requests.send(Request { id, job }).await.is_err() {
                return Err(MdiError::WorkerFault("offload thread is gone".into()));
            }
            drop(requests);
            waiter.await.unwrap_or(Err(MdiError::Terminated))
        };

        let timeout = self.inner.config.call_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                self.inner.pending.lock().await.remove(&id);
                Err(e)
            }
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                warn!(id, timeout_ms = timeout.as_millis() as u64, "offload call timed out");
                Err(MdiError::Timeout(timeout))
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Reject every pending call with [`MdiError::Terminated`] and stop the
    /// thread. The next call starts a new one.
    pub async fn terminate(&self) {
        let mut mode = self.inner.mode.lock().await;
        if matches!(*mode, Mode::Running { .. }) {
            *mode = Mode::Idle;
        }
        let rejected = self.inner.pending.lock().await.reject_all(|| MdiError::Terminated);
        info!(rejected, "offload terminated");
    }

    pub async fn mode(&self) -> OffloadMode {
        if !self.inner.config.use_background {
            return OffloadMode::Inline;
        }
        match *self.inner.mode.lock().await {
            Mode::Idle => OffloadMode::Idle,
            Mode::Running { .. } => OffloadMode::Background,
            Mode::Fallback => OffloadMode::Fallback,
        }
    }

    /// Calls waiting for a reply.
    pub async fn pending(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    async fn ensure_worker(&self) -> Result<Option<mpsc::Sender<Request>>, MdiError> {
        if !self.inner.config.use_background {
            return Ok(None);
        }
        let mut mode = self.inner.mode.lock().await;
        match &*mode {
            Mode::Running { requests, .. } => return Ok(Some(requests.clone())),
            Mode::Fallback => return Ok(None),
            Mode::Idle => {}
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        match self.spawn_worker(generation) {
            Ok(channels) => {
                let requests = channels.requests.clone();
                tokio::spawn(route_replies(
                    Arc::downgrade(&self.inner),
                    generation,
                    channels.replies,
                ));
                *mode = Mode::Running {
                    requests: channels.requests,
                    generation,
                };
                debug!(generation, "offload thread ready");
                Ok(Some(requests))
            }
            Err(e) if self.inner.config.fallback_to_sync => {
                warn!("offload thread unavailable ({e}); running synchronously");
                *mode = Mode::Fallback;
                Ok(None)
            }
            Err(e) => Err(MdiError::Configuration(format!(
                "offload thread unavailable and synchronous fallback disabled: {e}"
            ))),
        }
    }

    #[cfg(not(test))]
    fn spawn_worker(&self, generation: u64) -> std::io::Result<worker::WorkerChannels> {
        worker::spawn(self.inner.config.queue_depth, generation)
    }

    #[cfg(test)]
    fn spawn_worker(&self, generation: u64) -> std::io::Result<worker::WorkerChannels> {
        if self.inner.fail_spawn.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("spawn disabled"));
        }
        worker::spawn(self.inner.config.queue_depth, generation)
    }
}

/// Forward replies from one thread generation to their callers.
async fn route_replies(inner: Weak<Inner>, generation: u64, mut replies: mpsc::UnboundedReceiver<Reply>) {
    while let Some((id, result)) = replies.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut pending = inner.pending.lock().await;
        match result {
            Ok(output) => pending.resolve(&id, output),
            Err(e) => pending.fail(&id, e),
        };
    }

    // The thread exited. If it is still the current one it died on its own.
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut mode = inner.mode.lock().await;
    if matches!(*mode, Mode::Running { generation: g, .. } if g == generation) {
        *mode = Mode::Idle;
        let rejected = inner
            .pending
            .lock()
            .await
            .reject_all(|| MdiError::WorkerFault("offload thread exited".into()));
        warn!(generation, rejected, "offload thread died; will restart on next call");
    }
}

fn unexpected(output: &JobOutput) -> MdiError {
    MdiError::WorkerFault(format!("unexpected job output: {output:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn background() -> WorkerOffload {
        WorkerOffload::new(WorkerConfig::default())
    }

    #[tokio::test]
    async fn decodes_on_background_thread() {
        let offload = background();
        assert_eq!(offload.mode().await, OffloadMode::Idle);

        let codec = MdiCodec::new();
        let frame = codec.encode_metadata(&json!({"file_id": "v"}), 11).unwrap();
        let decoded = offload.decode(frame).await.unwrap();
        assert_eq!(decoded.sequence, 11);
        assert_eq!(offload.mode().await, OffloadMode::Background);
        assert_eq!(offload.pending().await, 0);
    }

    #[tokio::test]
    async fn transforms_match_inline_results() {
        let offload = background();
        let pixels = PixelBuffer::from_values(&[0i16, -100, 250, 4000]);

        let mm = offload.min_max(pixels.clone()).await.unwrap();
        assert_eq!(mm, min_max(pixels.values()));

        let wl = WindowLevel::new(100.0, 400.0);
        let out = offload.window_level(pixels.clone(), wl).await.unwrap();
        assert_eq!(out, window_level(pixels.values(), &wl));

        let h = offload.histogram(pixels.clone(), 8).await.unwrap();
        assert_eq!(h.total(), 4);
    }

    #[tokio::test]
    async fn protocol_errors_pass_through() {
        let err = background().decode(Bytes::from_static(&[0u8; 8])).await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn inline_mode_never_spawns() {
        let offload = WorkerOffload::new(WorkerConfig::inline());
        let mm = offload.min_max(PixelBuffer::from_values(&[3u8, 9])).await.unwrap();
        assert_eq!((mm.min, mm.max), (3.0, 9.0));
        assert_eq!(offload.mode().await, OffloadMode::Inline);
    }

    #[tokio::test]
    async fn call_timeout_clears_pending_entry() {
        let offload = WorkerOffload::new(WorkerConfig {
            call_timeout_ms: 20,
            ..WorkerConfig::default()
        });
        let err = offload.execute(Job::Sleep(Duration::from_millis(200))).await.unwrap_err();
        assert!(matches!(err, MdiError::Timeout(_)));
        assert_eq!(offload.pending().await, 0);
    }

    #[tokio::test]
    async fn call_timeout_covers_a_full_queue() {
        let offload = WorkerOffload::new(WorkerConfig {
            call_timeout_ms: 50,
            queue_depth: 1,
            ..WorkerConfig::default()
        });
        // One job occupies the thread, the next fills the only queue slot.
        for _ in 0..2 {
            let offload = offload.clone();
            tokio::spawn(async move { offload.execute(Job::Sleep(Duration::from_millis(600))).await });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let err = offload.min_max(PixelBuffer::from_values(&[1u8])).await.unwrap_err();
        assert!(matches!(err, MdiError::Timeout(d) if d == Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(300), "{:?}", started.elapsed());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(offload.pending().await, 0);
    }

    #[tokio::test]
    async fn terminate_rejects_pending_and_restarts() {
        let offload = background();
        let slow = {
            let offload = offload.clone();
            tokio::spawn(async move { offload.execute(Job::Sleep(Duration::from_millis(300))).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(offload.pending().await, 1);

        offload.terminate().await;
        let err = slow.await.unwrap().unwrap_err();
        assert!(matches!(err, MdiError::Terminated));
        assert_eq!(offload.mode().await, OffloadMode::Idle);

        let mm = offload.min_max(PixelBuffer::from_values(&[1u8])).await.unwrap();
        assert_eq!(mm.max, 1.0);
        assert_eq!(offload.mode().await, OffloadMode::Background);
    }

    #[tokio::test]
    async fn runtime_fault_rejects_and_recovers() {
        let offload = background();
        let err = offload.execute(Job::Panic).await.unwrap_err();
        assert!(matches!(err, MdiError::WorkerFault(_)));

        // The router notices the dead thread shortly after the reply.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(offload.mode().await, OffloadMode::Idle);

        let mm = offload.min_max(PixelBuffer::from_values(&[5u8])).await.unwrap();
        assert_eq!(mm.min, 5.0);
    }

    #[tokio::test]
    async fn init_failure_downgrades_to_sync() {
        let offload = background();
        offload.inner.fail_spawn.store(true, Ordering::SeqCst);

        let mm = offload.min_max(PixelBuffer::from_values(&[2u8, 4])).await.unwrap();
        assert_eq!(mm.max, 4.0);
        assert_eq!(offload.mode().await, OffloadMode::Fallback);

        // Permanent, even once spawning would work again.
        offload.inner.fail_spawn.store(false, Ordering::SeqCst);
        offload.min_max(PixelBuffer::from_values(&[1u8])).await.unwrap();
        assert_eq!(offload.mode().await, OffloadMode::Fallback);
    }

    #[tokio::test]
    async fn init_failure_without_fallback_is_configuration_error() {
        let offload = WorkerOffload::new(WorkerConfig {
            fallback_to_sync: false,
            ..WorkerConfig::default()
        });
        offload.inner.fail_spawn.store(true, Ordering::SeqCst);
        let err = offload.min_max(PixelBuffer::from_values(&[1u8])).await.unwrap_err();
        assert!(matches!(err, MdiError::Configuration(_)));
    }
}
