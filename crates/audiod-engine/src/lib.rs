//! audiod-engine - Per-stream real-time I/O thread engine for the audiod audio server
//!
//! Each hardware audio stream (playback or capture) is owned by exactly one
//! control thread built on [`engine::ThreadBase`]. Client streams ("tracks")
//! are multiplexed onto the hardware stream by that thread's loop; the
//! lowest-latency tracks are handed to an optional real-time companion thread
//! through the lock-free [`fast`] bridge.

pub mod config;
pub mod effect;
pub mod engine;
pub mod error;
pub mod fast;
pub mod gc;
pub mod hal;
pub mod mixer;
pub mod power;
pub mod ring;
pub mod track;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use types::*;
