//! Client stream endpoints and their lifecycle state machine

pub mod active;
pub mod playback;
pub mod record;
pub mod state;

pub use active::{ActiveTrack, ActiveTracks};
pub use playback::{FillingStatus, Track};
pub use record::RecordTrack;
pub use state::{TrackEvent, TrackState};
