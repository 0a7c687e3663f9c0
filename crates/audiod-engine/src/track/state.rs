//! Track lifecycle state machine
//!
//! One explicit transition table instead of state writes scattered across
//! the client calls and the loop. Client events come from start/stop/pause/
//! flush; loop events are produced by the admission pass as it observes
//! buffer and hardware progress. `apply` returns `None` for any (state,
//! event) pair that is not a transition - callers treat that as a no-op,
//! which is what makes repeated stop()/pause() idempotent.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrackState {
    Idle = 0,
    /// Admitted, first loop pass not yet taken
    Starting1,
    /// Served by the loop, waiting for first data delivery
    Starting2,
    Active,
    /// Pause requested, hardware/loop ack pending
    Pausing,
    Paused,
    /// Resume requested, hardware/loop ack pending
    Resuming,
    /// Stop requested, draining the client's buffered data
    Stopping1,
    /// Buffered data exhausted, waiting for presentation complete
    Stopping2,
    Stopped,
    Flushed,
}

impl TrackState {
    pub const ALL: [TrackState; 11] = [
        TrackState::Idle,
        TrackState::Starting1,
        TrackState::Starting2,
        TrackState::Active,
        TrackState::Pausing,
        TrackState::Paused,
        TrackState::Resuming,
        TrackState::Stopping1,
        TrackState::Stopping2,
        TrackState::Stopped,
        TrackState::Flushed,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TrackState::Idle => "IDLE",
            TrackState::Starting1 => "STARTING_1",
            TrackState::Starting2 => "STARTING_2",
            TrackState::Active => "ACTIVE",
            TrackState::Pausing => "PAUSING",
            TrackState::Paused => "PAUSED",
            TrackState::Resuming => "RESUMING",
            TrackState::Stopping1 => "STOPPING_1",
            TrackState::Stopping2 => "STOPPING_2",
            TrackState::Stopped => "STOPPED",
            TrackState::Flushed => "FLUSHED",
        }
    }

    fn from_u8(v: u8) -> TrackState {
        match v {
            0 => TrackState::Idle,
            1 => TrackState::Starting1,
            2 => TrackState::Starting2,
            3 => TrackState::Active,
            4 => TrackState::Pausing,
            5 => TrackState::Paused,
            6 => TrackState::Resuming,
            7 => TrackState::Stopping1,
            8 => TrackState::Stopping2,
            9 => TrackState::Stopped,
            10 => TrackState::Flushed,
            // the cell only ever stores a TrackState discriminant
            _ => unreachable!("corrupt track state value {v}"),
        }
    }
}

/// Events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackEvent {
    // client calls
    Start,
    Pause,
    Stop,
    Flush,
    // loop-driven progression
    /// First loop pass after admission
    Served,
    /// First data observed in the ring
    DataDelivered,
    /// Hardware/loop acknowledged the pause
    PauseAcked,
    /// Hardware/loop acknowledged the resume
    ResumeAcked,
    /// Client's buffered data exhausted while stopping
    BufferExhausted,
    /// Last frame presented by the hardware
    PresentationComplete,
    /// Post-flush reset applied by the loop
    Reset,
}

impl TrackEvent {
    pub const ALL: [TrackEvent; 11] = [
        TrackEvent::Start,
        TrackEvent::Pause,
        TrackEvent::Stop,
        TrackEvent::Flush,
        TrackEvent::Served,
        TrackEvent::DataDelivered,
        TrackEvent::PauseAcked,
        TrackEvent::ResumeAcked,
        TrackEvent::BufferExhausted,
        TrackEvent::PresentationComplete,
        TrackEvent::Reset,
    ];
}

/// The transition table. `None` means "not a transition" - the event is
/// ignored in that state.
pub fn apply(state: TrackState, event: TrackEvent) -> Option<TrackState> {
    use TrackEvent as E;
    use TrackState as S;

    match (state, event) {
        // start: fresh or restarted tracks enter the startup ramp;
        // paused tracks resume; stopping tracks are "unstopped"
        (S::Idle | S::Stopped | S::Flushed, E::Start) => Some(S::Starting1),
        (S::Paused | S::Pausing, E::Start) => Some(S::Resuming),
        (S::Stopping1 | S::Stopping2, E::Start) => Some(S::Active),

        // startup ramp, driven by the loop
        (S::Starting1, E::Served) => Some(S::Starting2),
        (S::Starting2, E::DataDelivered) => Some(S::Active),

        // pause; also valid mid-drain for offload (resume-to-stopping is a
        // side flag, the state still goes through PAUSING)
        (S::Active | S::Resuming | S::Starting1 | S::Starting2, E::Pause) => Some(S::Pausing),
        (S::Stopping1 | S::Stopping2, E::Pause) => Some(S::Pausing),
        (S::Pausing, E::PauseAcked) => Some(S::Paused),

        (S::Resuming, E::ResumeAcked) => Some(S::Active),

        // stop: everything that might still produce data drains through
        // STOPPING_1/STOPPING_2
        (S::Active | S::Resuming | S::Pausing | S::Paused, E::Stop) => Some(S::Stopping1),
        (S::Starting1 | S::Starting2, E::Stop) => Some(S::Stopping1),
        (S::Stopping1, E::BufferExhausted) => Some(S::Stopping2),
        (S::Stopping2, E::PresentationComplete) => Some(S::Stopped),

        // flush is only meaningful once the track is no longer feeding the
        // mix; an active track must pause or stop first
        (
            S::Idle | S::Pausing | S::Paused | S::Stopping1 | S::Stopping2 | S::Stopped
            | S::Flushed,
            E::Flush,
        ) => Some(S::Flushed),

        (S::Flushed, E::Reset) => Some(S::Idle),

        _ => None,
    }
}

/// Lock-free cell holding a [`TrackState`]
///
/// Mutation is only performed while the owning thread's mutex is held; the
/// atomic exists so diagnostics can read the state without the lock.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: TrackState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn get(&self) -> TrackState {
        TrackState::from_u8(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, state: TrackState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    /// Apply an event through the transition table; returns the new state if
    /// the event was a transition in the current state.
    pub fn transition(&self, event: TrackEvent) -> Option<TrackState> {
        let next = apply(self.get(), event)?;
        self.set(next);
        Some(next)
    }
}
