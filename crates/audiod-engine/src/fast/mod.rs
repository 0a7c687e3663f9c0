//! Lock-free bridge to the real-time companion threads

pub mod capture;
pub mod mixer;
pub mod state_queue;

pub use capture::{FastCaptureHandle, FastCaptureState};
pub use mixer::{FastCommand, FastMixerHandle, FastMixerState, FastTrackState};
pub use state_queue::{state_queue, PushMode, StateReader, StateWriter};
