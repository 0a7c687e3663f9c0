//! Capture track - one client input stream endpoint
//!
//! For capture the roles flip: the record thread produces into the ring
//! from its history buffer, the client handle consumes. Each track keeps
//! its own read cursor into the thread's history ring so slow clients
//! lag independently.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use basedrop::Shared;

use crate::gc;
use crate::ring::FrameRing;
use crate::track::active::ActiveTrack;
use crate::track::state::{StateCell, TrackEvent, TrackState};
use crate::types::{PortId, SessionId, StreamFormat, TrackId, Uid};

/// One client capture stream
pub struct RecordTrack {
    id: TrackId,
    session: SessionId,
    port: PortId,
    uid: Uid,
    format: StreamFormat,
    frame_count: usize,
    ring: Shared<FrameRing>,
    state: StateCell,
    retries_left: AtomicU32,
    /// Read position in the owning thread's history ring. Only the record
    /// thread touches this while the track is active.
    history_cursor: AtomicU64,
    /// Latched when a forced cursor advance dropped frames; cleared on the
    /// next successful delivery
    overflowed: AtomicBool,
    terminated: AtomicBool,
    invalid: AtomicBool,
}

impl RecordTrack {
    pub fn new(
        session: SessionId,
        port: PortId,
        uid: Uid,
        format: StreamFormat,
        frame_count: usize,
    ) -> Self {
        let ring = Shared::new(
            &gc::gc_handle(),
            FrameRing::new(frame_count, format.samples_per_frame()),
        );
        Self {
            id: TrackId::next(),
            session,
            port,
            uid,
            format,
            frame_count,
            ring,
            state: StateCell::new(TrackState::Idle),
            retries_left: AtomicU32::new(0),
            history_cursor: AtomicU64::new(0),
            overflowed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> TrackId {
        self.id
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[inline]
    pub fn port(&self) -> PortId {
        self.port
    }

    #[inline]
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[inline]
    pub fn ring(&self) -> &Shared<FrameRing> {
        &self.ring
    }

    #[inline]
    pub fn frames_ready(&self) -> usize {
        self.ring.frames_ready()
    }

    #[inline]
    pub fn state(&self) -> TrackState {
        self.state.get()
    }

    pub fn transition(&self, event: TrackEvent) -> Option<TrackState> {
        let next = self.state.transition(event)?;
        log::debug!("{}: {:?} => {}", self.id, event, next.name());
        Some(next)
    }

    pub fn set_state(&self, state: TrackState) {
        self.state.set(state);
    }

    // ── history cursor ───────────────────────────────────────────────────

    pub fn history_cursor(&self) -> u64 {
        self.history_cursor.load(Ordering::Relaxed)
    }

    pub fn set_history_cursor(&self, cursor: u64) {
        self.history_cursor.store(cursor, Ordering::Relaxed);
    }

    // ── overrun ──────────────────────────────────────────────────────────

    pub fn set_overflowed(&self) {
        if !self.overflowed.swap(true, Ordering::Relaxed) {
            log::warn!("{}: capture overrun, frames dropped", self.id);
        }
    }

    pub fn clear_overflowed(&self) {
        self.overflowed.store(false, Ordering::Relaxed);
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }

    // ── retries ──────────────────────────────────────────────────────────

    pub fn reset_retries(&self, max: u32) {
        self.retries_left.store(max, Ordering::Relaxed);
    }

    pub fn consume_retry(&self) -> u32 {
        let prev = self.retries_left.load(Ordering::Relaxed);
        if prev == 0 {
            return 0;
        }
        self.retries_left.store(prev - 1, Ordering::Relaxed);
        prev - 1
    }

    // ── latches ──────────────────────────────────────────────────────────

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Relaxed);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Relaxed)
    }

    pub fn invalidate(&self) {
        if !self.invalid.swap(true, Ordering::Relaxed) {
            log::info!("{}: invalidated", self.id);
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }
}

impl ActiveTrack for RecordTrack {
    fn uid(&self) -> Uid {
        self.uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFormat, ChannelMask};

    fn track() -> RecordTrack {
        RecordTrack::new(
            SessionId(2),
            PortId(7),
            Uid(1001),
            StreamFormat::new(48000, AudioFormat::PcmF32, ChannelMask::MONO),
            256,
        )
    }

    #[test]
    fn test_capture_start_handshake() {
        let t = track();
        assert_eq!(t.transition(TrackEvent::Start), Some(TrackState::Starting1));
        assert_eq!(t.transition(TrackEvent::Served), Some(TrackState::Starting2));
        assert_eq!(
            t.transition(TrackEvent::DataDelivered),
            Some(TrackState::Active)
        );
    }

    #[test]
    fn test_overflow_latch() {
        let t = track();
        assert!(!t.overflowed());
        t.set_overflowed();
        t.set_overflowed();
        assert!(t.overflowed());
        t.clear_overflowed();
        assert!(!t.overflowed());
    }
}
