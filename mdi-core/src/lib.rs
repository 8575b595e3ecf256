//! # mdi-core
//!
//! Client-side core for streaming volumetric image slices from an MDI
//! server over WebSocket.
//!
//! This crate contains:
//! - **Wire format**: `FrameHeader`, `Packet`, `MessageType`, `CompressionType`, `DType`
//! - **Payloads**: `SliceDataPayload` with zero-copy typed pixel views, heartbeat, JSON shapes
//! - **Codec**: `MdiCodec` for whole-frame decode/encode and framed byte streams via `tokio_util`
//! - **Transport**: `TransportManager`, a reconnecting WebSocket driver with heartbeat liveness
//! - **Cache**: `SliceCache`, an L1 memory / L2 store cache with sequential prefetch
//! - **Offload**: `WorkerOffload` for decode and pixel transforms on a dedicated thread
//! - **Loader**: `SliceLoader`, the cache-first lookup façade
//! - **Error**: `MdiError`, a typed, `thiserror`-based error hierarchy

pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod header;
pub mod loader;
pub mod message;
pub mod offload;
pub mod packet;
pub mod protocol;
pub mod state;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use cache::{CacheStats, DiskStore, MemoryStore, SliceCache, SliceKey, SliceStore, TierStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::MdiCodec;
pub use config::{CacheConfig, LoaderConfig, StorageConfig, TransportConfig, WorkerConfig};
pub use error::{MdiError, ProtocolError, StorageError};
pub use header::{FrameHeader, HEADER_SIZE, MAGIC, PROTOCOL_VERSION};
pub use loader::{SliceFetcher, SliceLoader};
pub use message::{CompressionType, DType, MessageType};
pub use offload::{OffloadMode, WorkerOffload};
pub use packet::{MAX_FRAME_SIZE, Packet};
pub use protocol::{
    ClientRequest, DecodedFrame, HeartbeatPayload, Message, PixelBuffer, ServerText, SliceDataPayload,
};
pub use state::ConnectionState;
pub use transport::{
    Outbound, ReconnectPolicy, TransportEvent, TransportHandler, TransportManager, TransportStats,
};
