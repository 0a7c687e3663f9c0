//! Wake-lock capability provider
//!
//! The engine holds a wake lock while any track is active so the device
//! can't suspend mid-stream. The platform integration is injected at thread
//! construction; the engine itself only drives the acquire/release lifecycle
//! and keeps the attributed uid set in sync with ActiveTracks membership.

use std::sync::Mutex;

use crate::types::Uid;

/// Platform wake-lock integration
///
/// Implementations must tolerate redundant calls: the loops call
/// `release` on every standby entry whether or not a lock is held.
pub trait PowerProvider: Send + Sync {
    /// Acquire the wake lock for the named thread
    fn acquire(&self, tag: &str);

    /// Release the wake lock
    fn release(&self, tag: &str);

    /// Replace the set of uids the active wake lock is attributed to
    fn set_uids(&self, tag: &str, uids: &[Uid]);
}

/// No-op provider for hosts without a power manager and for tests
#[derive(Default)]
pub struct NoopPower;

impl PowerProvider for NoopPower {
    fn acquire(&self, _tag: &str) {}
    fn release(&self, _tag: &str) {}
    fn set_uids(&self, _tag: &str, _uids: &[Uid]) {}
}

/// Recording provider used by tests to observe the lifecycle
#[derive(Default)]
pub struct RecordingPower {
    pub events: Mutex<Vec<String>>,
}

impl PowerProvider for RecordingPower {
    fn acquire(&self, tag: &str) {
        self.events.lock().unwrap().push(format!("acquire:{tag}"));
    }

    fn release(&self, tag: &str) {
        self.events.lock().unwrap().push(format!("release:{tag}"));
    }

    fn set_uids(&self, tag: &str, uids: &[Uid]) {
        let mut list: Vec<u32> = uids.iter().map(|u| u.0).collect();
        list.sort_unstable();
        self.events.lock().unwrap().push(format!("uids:{tag}:{list:?}"));
    }
}
