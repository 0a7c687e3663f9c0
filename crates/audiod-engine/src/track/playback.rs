//! Playback track - one client output stream endpoint
//!
//! A `Track` is shared between the client-facing handle (which produces
//! frames into the ring) and the owning playback thread (which consumes
//! them). All lifecycle state transitions happen while the thread's mutex
//! is held; the atomics here exist for lock-free reads by diagnostics and
//! by the fast-path thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use basedrop::Shared;

use crate::gc;
use crate::ring::FrameRing;
use crate::track::active::ActiveTrack;
use crate::track::state::{StateCell, TrackEvent, TrackState};
use crate::types::{FastSlot, PortId, SessionId, StreamFormat, TrackId, Uid};

/// Buffer fill progress used by the admission pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FillingStatus {
    /// Client has not yet primed the buffer; underruns don't count
    Filling = 0,
    /// Buffer primed at least once, track not yet mixed
    Filled = 1,
    /// Track has contributed data to the mix
    Active = 2,
}

/// One client playback stream
pub struct Track {
    id: TrackId,
    session: SessionId,
    port: PortId,
    uid: Uid,
    format: StreamFormat,
    frame_count: usize,
    /// Shared ring; held through the RT-safe collector because the fast
    /// mixer may hold the last reference
    ring: Shared<FrameRing>,
    state: StateCell,
    fill: AtomicU32,
    retries_left: AtomicU32,
    /// Fixed bridge slot for fast tracks, assigned at creation
    fast_slot: Option<FastSlot>,
    /// Client must restart after an underrun disable
    disabled: AtomicBool,
    terminated: AtomicBool,
    /// Non-resettable latch: the backing route is gone
    invalid: AtomicBool,
    /// reset() must apply at most once per flush cycle
    reset_done: AtomicBool,
    /// Direct/offload handshakes with the hardware
    pause_hw_pending: AtomicBool,
    flush_hw_pending: AtomicBool,
    /// Pause interrupted an offload drain; resume returns to STOPPING_1
    resume_to_stopping: AtomicBool,
    /// Thread frame position at which presentation is complete (valid in
    /// STOPPING_2)
    presentation_target: AtomicU64,
    underrun_frames: AtomicU64,
    /// Ring consumption seen by the last admission pass (fast tracks)
    fast_consumed_seen: AtomicU64,
    volume_bits: AtomicU32,
}

impl Track {
    pub fn new(
        session: SessionId,
        port: PortId,
        uid: Uid,
        format: StreamFormat,
        frame_count: usize,
        fast_slot: Option<FastSlot>,
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
            fill: AtomicU32::new(FillingStatus::Filling as u32),
            retries_left: AtomicU32::new(0),
            fast_slot,
            disabled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            reset_done: AtomicBool::new(false),
            pause_hw_pending: AtomicBool::new(false),
            flush_hw_pending: AtomicBool::new(false),
            resume_to_stopping: AtomicBool::new(false),
            presentation_target: AtomicU64::new(u64::MAX),
            underrun_frames: AtomicU64::new(0),
            fast_consumed_seen: AtomicU64::new(0),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
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
    pub fn is_fast(&self) -> bool {
        self.fast_slot.is_some()
    }

    #[inline]
    pub fn fast_slot(&self) -> Option<FastSlot> {
        self.fast_slot
    }

    // ── state ────────────────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> TrackState {
        self.state.get()
    }

    /// Apply a lifecycle event. Caller holds the owning thread's mutex.
    pub fn transition(&self, event: TrackEvent) -> Option<TrackState> {
        let next = self.state.transition(event)?;
        log::debug!("{}: {:?} => {}", self.id, event, next.name());
        Some(next)
    }

    /// Force a state without an event; only for admission paths that
    /// restore a pre-rejection state. Caller holds the thread mutex.
    pub fn set_state(&self, state: TrackState) {
        self.state.set(state);
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state(), TrackState::Stopped | TrackState::Flushed)
    }

    pub fn is_stopping(&self) -> bool {
        matches!(self.state(), TrackState::Stopping1 | TrackState::Stopping2)
    }

    // ── data availability ────────────────────────────────────────────────

    #[inline]
    pub fn frames_ready(&self) -> usize {
        self.ring.frames_ready()
    }

    /// Whether the fast mixer consumed frames since the last call. The
    /// admission pass uses consumption, not buffer depth, to judge a fast
    /// track's health.
    pub fn take_fast_progress(&self) -> bool {
        let consumed = self.ring.frames_consumed();
        self.fast_consumed_seen.swap(consumed, Ordering::Relaxed) != consumed
    }

    pub fn filling(&self) -> FillingStatus {
        match self.fill.load(Ordering::Relaxed) {
            0 => FillingStatus::Filling,
            1 => FillingStatus::Filled,
            _ => FillingStatus::Active,
        }
    }

    pub fn set_filling(&self, fill: FillingStatus) {
        self.fill.store(fill as u32, Ordering::Relaxed);
    }

    // ── retries (underrun recovery contract) ─────────────────────────────

    pub fn reset_retries(&self, max: u32) {
        self.retries_left.store(max, Ordering::Relaxed);
    }

    /// Consume one retry; returns the count remaining after consumption.
    pub fn consume_retry(&self) -> u32 {
        let prev = self.retries_left.load(Ordering::Relaxed);
        if prev == 0 {
            return 0;
        }
        self.retries_left.store(prev - 1, Ordering::Relaxed);
        prev - 1
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left.load(Ordering::Relaxed)
    }

    pub fn tally_underrun_frames(&self, frames: usize) {
        self.underrun_frames.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn underrun_frames(&self) -> u64 {
        self.underrun_frames.load(Ordering::Relaxed)
    }

    /// Disable after retry exhaustion; cleared by the client restarting.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn clear_disabled(&self) {
        self.disabled.store(false, Ordering::Relaxed);
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

    // ── flush/pause handshakes ───────────────────────────────────────────

    /// Post-flush reset: force the filling state so no false underrun fires
    /// before the client writes fresh data. Applies at most once until the
    /// next start().
    pub fn reset(&self) {
        if !self.reset_done.swap(true, Ordering::Relaxed) {
            self.set_filling(FillingStatus::Filling);
            if self.state() == TrackState::Flushed {
                self.transition(TrackEvent::Reset);
            }
        }
    }

    pub fn clear_reset_done(&self) {
        self.reset_done.store(false, Ordering::Relaxed);
    }

    pub fn set_pause_hw_pending(&self, pending: bool) {
        self.pause_hw_pending.store(pending, Ordering::Relaxed);
    }

    pub fn pause_hw_pending(&self) -> bool {
        self.pause_hw_pending.load(Ordering::Relaxed)
    }

    pub fn set_flush_hw_pending(&self, pending: bool) {
        self.flush_hw_pending.store(pending, Ordering::Relaxed);
    }

    pub fn flush_hw_pending(&self) -> bool {
        self.flush_hw_pending.load(Ordering::Relaxed)
    }

    pub fn set_resume_to_stopping(&self, v: bool) {
        self.resume_to_stopping.store(v, Ordering::Relaxed);
    }

    pub fn resume_to_stopping(&self) -> bool {
        self.resume_to_stopping.load(Ordering::Relaxed)
    }

    // ── presentation tracking ────────────────────────────────────────────

    /// Arm the presentation-complete target: done when the thread has
    /// written `target` frames to the hardware.
    pub fn set_presentation_target(&self, target: u64) {
        self.presentation_target.store(target, Ordering::Relaxed);
    }

    pub fn presentation_complete(&self, frames_written: u64) -> bool {
        frames_written >= self.presentation_target.load(Ordering::Relaxed)
    }

    // ── volume ───────────────────────────────────────────────────────────

    pub fn set_volume(&self, volume: f32) {
        self.volume_bits.store(volume.clamp(0.0, 2.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }
}

impl ActiveTrack for Track {
    fn uid(&self) -> Uid {
        self.uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFormat, ChannelMask};

    fn track() -> Track {
        Track::new(
            SessionId(1),
            PortId(1),
            Uid(1000),
            StreamFormat::new(48000, AudioFormat::PcmF32, ChannelMask::STEREO),
            512,
            None,
        )
    }

    #[test]
    fn test_retry_contract() {
        let t = track();
        t.reset_retries(3);
        assert_eq!(t.consume_retry(), 2);
        assert_eq!(t.consume_retry(), 1);
        assert_eq!(t.consume_retry(), 0);
        // saturates at zero
        assert_eq!(t.consume_retry(), 0);
        t.reset_retries(3);
        assert_eq!(t.retries_left(), 3);
    }

    #[test]
    fn test_reset_applies_once() {
        let t = track();
        t.set_filling(FillingStatus::Active);
        t.set_state(TrackState::Flushed);
        t.reset();
        assert_eq!(t.state(), TrackState::Idle);
        assert_eq!(t.filling(), FillingStatus::Filling);

        // a second reset without clear_reset_done is a no-op
        t.set_filling(FillingStatus::Active);
        t.reset();
        assert_eq!(t.filling(), FillingStatus::Active);
    }

    #[test]
    fn test_ring_shared_with_client() {
        let t = track();
        let client_ring = t.ring().clone();
        client_ring.write_frames(&[0.5; 64]); // 32 stereo frames
        assert_eq!(t.frames_ready(), 32);
    }

    #[test]
    fn test_volume_clamped() {
        let t = track();
        t.set_volume(5.0);
        assert_eq!(t.volume(), 2.0);
    }
}
