//! The offload thread and the jobs it runs.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::MdiCodec;
use crate::error::MdiError;
use crate::offload::pixels::{self, Histogram, MinMax, WindowLevel};
use crate::protocol::{DecodedFrame, PixelBuffer};

pub const THREAD_NAME: &str = "mdi-offload";

/// A unit of CPU-bound work. Buffers are moved in, not copied.
#[derive(Debug)]
pub enum Job {
    Decode(Bytes),
    WindowLevel {
        pixels: PixelBuffer,
        params: WindowLevel,
    },
    Histogram {
        pixels: PixelBuffer,
        bins: usize,
    },
    MinMax(PixelBuffer),
    #[cfg(test)]
    Panic,
    #[cfg(test)]
    Sleep(std::time::Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Decoded(DecodedFrame),
    Windowed(Vec<u8>),
    Histogram(Histogram),
    MinMax(MinMax),
}

impl Job {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Job::Decode(_) => "decode",
            Job::WindowLevel { .. } => "window_level",
            Job::Histogram { .. } => "histogram",
            Job::MinMax(_) => "min_max",
            #[cfg(test)]
            Job::Panic => "panic",
            #[cfg(test)]
            Job::Sleep(_) => "sleep",
        }
    }
}

/// Execute `job` on the current thread.
pub fn run_job(codec: &MdiCodec, job: Job) -> Result<JobOutput, MdiError> {
    match job {
        Job::Decode(frame) => Ok(JobOutput::Decoded(codec.decode_frame(frame)?)),
        Job::WindowLevel { pixels, params } => Ok(JobOutput::Windowed(pixels::window_level(
            pixels.values(),
            &params,
        ))),
        Job::Histogram { pixels, bins } => Ok(JobOutput::Histogram(pixels::histogram(
            pixels.values(),
            bins,
        ))),
        Job::MinMax(pixels) => Ok(JobOutput::MinMax(pixels::min_max(pixels.values()))),
        #[cfg(test)]
        Job::Panic => panic!("injected worker fault"),
        #[cfg(test)]
        Job::Sleep(d) => {
            thread::sleep(d);
            Ok(JobOutput::MinMax(MinMax::EMPTY))
        }
    }
}

// ── Thread plumbing ──────────────────────────────────────────────

pub(crate) struct Request {
    pub id: u64,
    pub job: Job,
}

pub(crate) type Reply = (u64, Result<JobOutput, MdiError>);

pub(crate) struct WorkerChannels {
    pub requests: mpsc::Sender<Request>,
    pub replies: mpsc::UnboundedReceiver<Reply>,
}

/// Start the offload thread.
///
/// The thread exits when the request sender is dropped, or after the first
/// job that panics. Either way the reply channel closes behind it.
pub(crate) fn spawn(queue_depth: usize, generation: u64) -> std::io::Result<WorkerChannels> {
    let (req_tx, req_rx) = mpsc::channel(queue_depth.max(1));
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    thread::Builder::new()
        .name(THREAD_NAME.into())
        .spawn(move || worker_loop(req_rx, reply_tx, generation))?;

    Ok(WorkerChannels {
        requests: req_tx,
        replies: reply_rx,
    })
}

fn worker_loop(
    mut requests: mpsc::Receiver<Request>,
    replies: mpsc::UnboundedSender<Reply>,
    generation: u64,
) {
    debug!(generation, "offload thread started");
    let codec = MdiCodec::new();

    while let Some(Request { id, job }) = requests.blocking_recv() {
        let kind = job.kind();
        match panic::catch_unwind(AssertUnwindSafe(|| run_job(&codec, job))) {
            Ok(result) => {
                if replies.send((id, result)).is_err() {
                    break;
                }
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!(generation, id, kind, "offload job panicked: {msg}");
                let _ = replies.send((id, Err(MdiError::WorkerFault(msg))));
                break;
            }
        }
    }

    debug!(generation, "offload thread exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_owned()
    }
}
