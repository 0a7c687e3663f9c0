//! Per-stream control threads
//!
//! One [`ThreadBase`] per hardware stream, specialized by role: playback
//! (mixing loop), record (capture loop), mmap (bookkeeping only).

pub mod base;
pub mod event;
pub mod mmap;
pub mod playback;
pub mod record;
pub mod timestamp;

pub use base::{ServerContext, ThreadBase};
pub use event::{ConfigEvent, ConfigEventKind, EventHandle};
pub use mmap::{MmapThread, MmapTrack};
pub use playback::{CycleOutcome, OutputKind, PlaybackThread};
pub use record::RecordThread;
pub use timestamp::ThreadTimestamp;
