//! The `fetch` and `inspect` subcommands.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use mdi_core::offload::{MinMax, WindowLevel, min_max, window_level};
use mdi_core::{
    ConnectionState, DecodedFrame, MdiCodec, MdiError, Message, SliceCache, SliceDataPayload,
    SliceLoader, TransportEvent, TransportManager, WorkerOffload,
};

use crate::config::ViewerConfig;

// ── fetch ────────────────────────────────────────────────────────

/// One fetched slice, reduced to what the terminal shows.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceSummary {
    pub file_id: String,
    pub slice_index: u32,
    pub width: u32,
    pub height: u32,
    pub dtype: String,
    pub range: MinMax,
    /// Mean display value after the slice's own window/level.
    pub mean_display: f64,
}

impl SliceSummary {
    pub fn new(slice: &SliceDataPayload, range: MinMax, display: &[u8]) -> Self {
        let mean_display = if display.is_empty() {
            0.0
        } else {
            display.iter().map(|&v| f64::from(v)).sum::<f64>() / display.len() as f64
        };
        Self {
            file_id: slice.file_id.clone(),
            slice_index: slice.slice_index,
            width: slice.width,
            height: slice.height,
            dtype: slice.dtype().to_string(),
            range,
            mean_display,
        }
    }
}

impl std::fmt::Display for SliceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} {}x{} {} range=[{}, {}] mean_display={:.1}",
            self.file_id,
            self.slice_index,
            self.width,
            self.height,
            self.dtype,
            self.range.min,
            self.range.max,
            self.mean_display
        )
    }
}

/// Fetch `start..=end` of `file_id` through the cache-first loader and
/// print a summary line per slice, then the cache statistics.
pub async fn fetch(config: ViewerConfig, file_id: &str, start: u32, end: u32) -> Result<(), MdiError> {
    let offload = config
        .worker
        .use_background
        .then(|| WorkerOffload::new(config.worker.clone()));
    let (transport, events) = TransportManager::spawn_with_offload(config.transport.clone(), offload.clone())?;
    let cache = Arc::new(SliceCache::open(config.cache.clone()).await?);
    let (loader, mut forwarded) = SliceLoader::new(cache, transport.clone(), events, config.loader.clone());

    tokio::spawn(async move {
        while let Some(event) = forwarded.recv().await {
            log_event(&event);
        }
    });

    transport.connect().await?;
    let connected = tokio::time::timeout(
        config.transport.connect_timeout(),
        transport.wait_for_state(|s| s.is_connected() || matches!(s, ConnectionState::Error)),
    )
    .await;
    if !matches!(connected, Ok(Ok(ConnectionState::Connected { .. }))) {
        warn!(url = %config.transport.url, "not connected yet; requests are queued");
    }

    let result = tokio::select! {
        r = fetch_range(&loader, offload.as_ref(), file_id, start, end) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received; stopping");
            Ok(())
        }
    };

    let stats = loader.cache().stats().await;
    println!(
        "cache: overall hit rate {:.2} (L1 {}/{}, L2 {}/{}), {} L2 entries, {} bytes",
        stats.overall.hit_rate(),
        stats.l1.hits,
        stats.l1.accesses(),
        stats.l2.hits,
        stats.l2.accesses(),
        stats.l2_entries,
        stats.l2_bytes
    );

    loader.shutdown().await;
    transport.shutdown().await?;
    if let Some(offload) = offload {
        offload.terminate().await;
    }
    result
}

async fn fetch_range(
    loader: &SliceLoader,
    offload: Option<&WorkerOffload>,
    file_id: &str,
    start: u32,
    end: u32,
) -> Result<(), MdiError> {
    let step: i64 = if end >= start { 1 } else { -1 };
    let mut index = i64::from(start);
    loop {
        let slice_index = index as u32;
        match loader.get_slice(file_id, slice_index).await {
            Ok(slice) => println!("{}", summarize(&slice, offload).await?),
            Err(e @ (MdiError::Timeout(_) | MdiError::Server(_))) => {
                println!("{file_id}:{slice_index} failed: {e}");
            }
            Err(e) => return Err(e),
        }
        if index == i64::from(end) {
            return Ok(());
        }
        index += step;
    }
}

/// Min/max and windowed preview, on the offload thread when there is one.
pub async fn summarize(slice: &SliceDataPayload, offload: Option<&WorkerOffload>) -> Result<SliceSummary, MdiError> {
    let params = WindowLevel::new(f64::from(slice.window_center), f64::from(slice.window_width));
    let (range, display) = match offload {
        Some(offload) => (
            offload.min_max(slice.data.clone()).await?,
            offload.window_level(slice.data.clone(), params).await?,
        ),
        None => (min_max(slice.data.values()), window_level(slice.data.values(), &params)),
    };
    Ok(SliceSummary::new(slice, range, &display))
}

fn log_event(event: &TransportEvent) {
    match event {
        TransportEvent::Open => info!("connected"),
        TransportEvent::Close { code, reason, manual } => info!(?code, %reason, manual, "closed"),
        TransportEvent::Reconnecting { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting")
        }
        TransportEvent::ConnectionError(e) => warn!("connection error: {e}"),
        TransportEvent::ProtocolError(e) => warn!("dropped frame: {e}"),
        TransportEvent::Heartbeat { heartbeat, .. } => {
            debug!(server_load = heartbeat.server_load, "heartbeat")
        }
        other => debug!(?other, "event"),
    }
}

// ── inspect ──────────────────────────────────────────────────────

/// Counts gathered while walking a capture file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frames: usize,
    pub rejected: usize,
    pub by_type: BTreeMap<String, usize>,
}

/// Decode every frame in a capture file of concatenated MDI frames.
///
/// A corrupt frame is reported and skipped; a framing error (bad magic or
/// version, truncated tail) ends the walk with an error.
pub async fn inspect(path: &Path) -> Result<CaptureSummary, MdiError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| MdiError::Other(format!("{}: {e}", path.display())))?;
    let mut frames = FramedRead::new(file, MdiCodec::new());
    let mut summary = CaptureSummary::default();

    while let Some(item) = frames.next().await {
        match item? {
            Ok(frame) => {
                println!("{}", describe(&frame));
                summary.frames += 1;
                *summary
                    .by_type
                    .entry(frame.message.message_type().to_string())
                    .or_default() += 1;
            }
            Err(e) => {
                println!("rejected frame: {e}");
                summary.rejected += 1;
            }
        }
    }
    Ok(summary)
}

pub fn describe(frame: &DecodedFrame) -> String {
    let seq = frame.sequence;
    match &frame.message {
        Message::SliceData(s) => format!(
            "#{seq} SLICE_DATA {}:{} {}x{} {} ({} bytes)",
            s.file_id,
            s.slice_index,
            s.width,
            s.height,
            s.dtype(),
            s.size_bytes()
        ),
        Message::Metadata(v) => format!("#{seq} METADATA {v}"),
        Message::Error(v) => format!("#{seq} ERROR {v}"),
        Message::Heartbeat(h) => format!(
            "#{seq} HEARTBEAT ts={} load={:.2}",
            h.timestamp_ms, h.server_load
        ),
        Message::Ack(p) => format!("#{seq} ACK ({} bytes)", p.len()),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mdi_core::{HeartbeatPayload, PixelBuffer};
    use serde_json::json;

    fn slice() -> SliceDataPayload {
        SliceDataPayload {
            file_id: "ct-chest".into(),
            slice_index: 25,
            width: 2,
            height: 2,
            min_value: 0.0,
            max_value: 4095.0,
            window_center: 400.0,
            window_width: 2000.0,
            data: PixelBuffer::from_values(&[0u16, 400, 1400, 4095]),
        }
    }

    #[tokio::test]
    async fn summary_matches_inline_and_offloaded() {
        let inline = summarize(&slice(), None).await.unwrap();
        assert_eq!(inline.range, MinMax { min: 0.0, max: 4095.0 });
        assert_eq!(inline.dtype, "uint16");
        // Window [-600, 1400]: 0 -> 77, 400 -> 128, 1400 -> 255, 4095 -> 255.
        assert!((inline.mean_display - 178.75).abs() < 1e-9);
        assert!(inline.to_string().starts_with("ct-chest:25 2x2 uint16"));

        let offload = WorkerOffload::new(Default::default());
        let offloaded = summarize(&slice(), Some(&offload)).await.unwrap();
        assert_eq!(offloaded, inline);
        offload.terminate().await;
    }

    #[tokio::test]
    async fn inspect_counts_and_skips_corrupt_frames() {
        let codec = MdiCodec::new();
        let mut capture = Vec::new();
        capture.extend_from_slice(&codec.encode_slice(&slice(), 1).unwrap());
        let mut corrupt = codec.encode_metadata(&json!({ "file_id": "ct-chest" }), 2).unwrap().to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x20;
        capture.extend_from_slice(&corrupt);
        let heartbeat = HeartbeatPayload {
            timestamp_ms: 42,
            server_load: 0.25,
        };
        capture.extend_from_slice(&codec.encode_heartbeat(&heartbeat, 3).unwrap());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.mdi");
        std::fs::write(&path, &capture).unwrap();

        let summary = inspect(&path).await.unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.by_type.get("SLICE_DATA"), Some(&1));
        assert_eq!(summary.by_type.get("HEARTBEAT"), Some(&1));
    }

    #[tokio::test]
    async fn truncated_capture_is_an_error() {
        let bytes = MdiCodec::new().encode_slice(&slice(), 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.mdi");
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        assert!(inspect(&path).await.is_err());
    }

    #[test]
    fn describe_heartbeat() {
        let frame = DecodedFrame {
            sequence: 9,
            message: Message::Heartbeat(HeartbeatPayload {
                timestamp_ms: 1_000,
                server_load: 0.5,
            }),
        };
        assert_eq!(describe(&frame), "#9 HEARTBEAT ts=1000 load=0.50");
    }
}
