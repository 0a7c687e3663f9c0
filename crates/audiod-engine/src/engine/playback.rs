//! Output thread family: the mixing loop and the track-preparation pass
//!
//! One `PlaybackThread` per hardware output stream. Clients create tracks
//! and drive start/stop/pause/flush; the loop admits tracks, mixes ready
//! ones, writes to the stream and retires tracks whose lifecycle finished.
//! The loop body is exposed as [`PlaybackThread::cycle`] so tests can step
//! it deterministically; `spawn` runs the same body on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use basedrop::Shared;

use crate::effect::{InsertionPoint, ThreadRole};
use crate::engine::base::{ServerContext, ThreadBase, ThreadState};
use crate::engine::event::ConfigEventKind;
use crate::engine::timestamp::ThreadTimestamp;
use crate::error::{EngineError, EngineResult};
use crate::fast::{FastMixerHandle, FastTrackState};
use crate::gc;
use crate::hal::StreamOut;
use crate::mixer::{MixInput, Mixer, SummingMixer};
use crate::ring::FrameRing;
use crate::track::{ActiveTracks, FillingStatus, Track, TrackEvent, TrackState};
use crate::types::{encode_frames, PortId, SessionId, StreamFormat, Uid};

/// Output thread variants. They share one loop; the kind selects hardware
/// capabilities (pause/flush/drain) and the mixing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Many tracks, software mix, optional fast path
    Mixer,
    /// One track, client format passed through
    Direct,
    /// Direct with compressed content and hardware drain
    Offload,
    /// Mirrors the mix to additional downstream outputs
    Duplicating,
    /// Direct with exclusive, unprocessed delivery
    BitPerfect,
}

impl OutputKind {
    /// Direct-family outputs own the hardware pause/flush handshake.
    pub fn is_direct(self) -> bool {
        matches!(self, OutputKind::Direct | OutputKind::Offload | OutputKind::BitPerfect)
    }
}

/// What the loop decided to do after one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Wrote (or would have written) a buffer; sleep one period
    Ran(Duration),
    /// Nothing to do; sleep until woken or the standby deadline
    Idle(Duration),
    /// Exit protocol finished
    Exited,
}

/// Role-specific half of the guarded state.
struct PlaybackState {
    stream: Arc<dyn StreamOut>,
    /// Every live track created on this thread
    tracks: Vec<Arc<Track>>,
    active: ActiveTracks<Track>,
    timestamp: ThreadTimestamp,
    mixer: Box<dyn Mixer>,
    fast: Option<FastMixerHandle>,
    /// Hands the normal mix to the fast mixer, which owns the stream
    /// whenever it exists
    mix_pipe: Option<Shared<FrameRing>>,
    /// Downstream outputs for the duplicating kind
    extra_outputs: Vec<Arc<dyn StreamOut>>,
    /// Short-write remainder carried into the next cycle
    pending_write: Vec<u8>,
    /// Instant the active set last became empty
    idle_since: Instant,
    hw_paused: bool,
}

pub struct PlaybackThread {
    base: ThreadBase<PlaybackState>,
    kind: OutputKind,
    format: StreamFormat,
    frames_per_cycle: usize,
    join: Mutex<Option<JoinHandle<()>>>,
    /// Loop liveness, observed by shutdown
    running: AtomicBool,
}

impl PlaybackThread {
    pub fn new(
        name: impl Into<String>,
        kind: OutputKind,
        stream: Arc<dyn StreamOut>,
        ctx: Arc<ServerContext>,
    ) -> EngineResult<Arc<Self>> {
        let name = name.into();
        let format = stream.format();
        let frames_per_cycle = stream.frame_count();
        if frames_per_cycle == 0 {
            return Err(EngineError::InvalidArgument(
                "output stream reports zero period".into(),
            ));
        }

        let (fast, mix_pipe) = if kind == OutputKind::Mixer {
            let timeout = Duration::from_millis(ctx.tuning.config_event_timeout_ms);
            let pipe = Shared::new(
                &gc::gc_handle(),
                FrameRing::new(frames_per_cycle * 4, format.samples_per_frame()),
            );
            let handle = FastMixerHandle::spawn(
                &name,
                Arc::clone(&stream),
                Shared::clone(&pipe),
                frames_per_cycle,
                timeout,
            )?;
            (Some(handle), Some(pipe))
        } else {
            (None, None)
        };

        let spec = PlaybackState {
            stream,
            tracks: Vec::new(),
            active: ActiveTracks::new(),
            timestamp: ThreadTimestamp::new(format.sample_rate),
            mixer: Box::new(SummingMixer),
            fast,
            mix_pipe,
            extra_outputs: Vec::new(),
            pending_write: Vec::new(),
            idle_since: Instant::now(),
            hw_paused: false,
        };
        Ok(Arc::new(Self {
            base: ThreadBase::new(name, ThreadRole::Playback, ctx, spec),
            kind,
            format,
            frames_per_cycle,
            join: Mutex::new(None),
            running: AtomicBool::new(false),
        }))
    }

    /// Create the thread and run its loop on a dedicated OS thread.
    pub fn spawn(
        name: impl Into<String>,
        kind: OutputKind,
        stream: Arc<dyn StreamOut>,
        ctx: Arc<ServerContext>,
    ) -> EngineResult<Arc<Self>> {
        let thread = Self::new(name, kind, stream, ctx)?;
        let runner = Arc::clone(&thread);
        let join = std::thread::Builder::new()
            .name(thread.base.name().to_string())
            .spawn(move || runner.run())
            .map_err(|e| EngineError::Hardware(format!("spawn playback thread: {e}")))?;
        if let Ok(mut slot) = thread.join.lock() {
            *slot = Some(join);
        }
        Ok(thread)
    }

    #[inline]
    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.base.name()
    }

    #[inline]
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    #[inline]
    pub fn frames_per_cycle(&self) -> usize {
        self.frames_per_cycle
    }

    pub fn send_config_event(&self, kind: ConfigEventKind) -> EngineResult<()> {
        self.base.send_config_event(kind)
    }

    pub fn create_effect(
        &self,
        session: SessionId,
        point: InsertionPoint,
        desc: crate::effect::EffectDesc,
    ) -> EngineResult<Arc<crate::effect::EffectChain>> {
        self.base.create_effect(session, point, desc)
    }

    pub fn remove_effect(&self, session: SessionId, name: &str) -> EngineResult<()> {
        self.base.remove_effect(session, name)
    }

    pub fn detach_effect_chain(&self, session: SessionId) -> Option<Arc<crate::effect::EffectChain>> {
        self.base.detach_effect_chain(session)
    }

    pub fn attach_effect_chain(&self, chain: Arc<crate::effect::EffectChain>) {
        self.base.attach_effect_chain(chain)
    }

    /// Attach a downstream output for the duplicating kind.
    pub fn add_output(&self, stream: Arc<dyn StreamOut>) -> EngineResult<()> {
        if self.kind != OutputKind::Duplicating {
            return Err(EngineError::NotSupported("secondary outputs"));
        }
        let mut state = self.base.lock();
        state.spec.extra_outputs.push(stream);
        Ok(())
    }

    // ── client surface ───────────────────────────────────────────────────

    /// Admit a new track. `frame_count_hint` of zero selects the thread's
    /// deep default; non-zero hints are raised to at least one mix period.
    pub fn create_track(
        &self,
        session: SessionId,
        port: PortId,
        uid: Uid,
        format: StreamFormat,
        frame_count_hint: usize,
        fast: bool,
    ) -> EngineResult<Arc<Track>> {
        if format.sample_rate != self.format.sample_rate {
            return Err(EngineError::InvalidArgument(format!(
                "sample rate {} does not match output rate {}",
                format.sample_rate, self.format.sample_rate
            )));
        }
        if self.kind.is_direct() && format.channel_mask != self.format.channel_mask {
            return Err(EngineError::InvalidArgument(
                "direct output requires the stream channel mask".into(),
            ));
        }
        if fast && self.kind != OutputKind::Mixer {
            return Err(EngineError::InvalidArgument(
                "fast tracks require a mixer output".into(),
            ));
        }

        let frame_count = if frame_count_hint == 0 {
            self.frames_per_cycle * self.base.tuning().depth_multiplier() as usize
        } else {
            frame_count_hint.max(self.frames_per_cycle)
        };

        let mut state = self.base.lock();
        if state.base.busy || state.base.exiting {
            return Err(EngineError::Dead);
        }
        let slot = if fast {
            let fast_mixer = state
                .spec
                .fast
                .as_mut()
                .ok_or(EngineError::NotSupported("fast path"))?;
            Some(
                fast_mixer
                    .allocate_slot()
                    .ok_or(EngineError::ResourceExhausted("fast track slots"))?,
            )
        } else {
            None
        };

        let track = Arc::new(Track::new(session, port, uid, format, frame_count, slot));
        log::info!(
            "{}: created {} ({} frames{})",
            self.base.name(),
            track.id(),
            frame_count,
            if fast { ", fast" } else { "" }
        );
        if let Some(chain) = state
            .base
            .effect_chains
            .iter()
            .find(|c| c.session() == session)
        {
            chain.inc_track_count();
        }
        state.spec.tracks.push(Arc::clone(&track));
        Ok(track)
    }

    /// Start (or restart) a track. Un-stops a pausing/paused track, revives
    /// a draining one, and re-primes a flushed one.
    pub fn start_track(&self, track: &Arc<Track>) -> EngineResult<()> {
        let mut state = self.base.lock();
        if state.base.busy || state.base.exiting {
            return Err(EngineError::Dead);
        }
        if track.is_terminated() {
            return Err(EngineError::InvalidState("track is terminated"));
        }
        if track.is_invalid() {
            return Err(EngineError::Dead);
        }

        let from = track.state();
        match from {
            TrackState::Active | TrackState::Starting1 | TrackState::Starting2 | TrackState::Resuming => {
                // already playing
            }
            TrackState::Paused | TrackState::Pausing => {
                if track.resume_to_stopping() {
                    // a pause interrupted a drain; resume the drain instead
                    track.set_resume_to_stopping(false);
                    track.set_state(TrackState::Stopping1);
                } else {
                    track.transition(TrackEvent::Start);
                }
                track.set_pause_hw_pending(false);
                if state.spec.hw_paused {
                    if let Err(e) = state.spec.stream.resume() {
                        log::warn!("{}: resume failed: {e}", self.base.name());
                    }
                    state.spec.hw_paused = false;
                }
            }
            TrackState::Flushed => {
                track.clear_reset_done();
                track.reset();
                track.clear_reset_done();
                track.transition(TrackEvent::Start);
            }
            TrackState::Idle | TrackState::Stopped => {
                track.transition(TrackEvent::Start);
            }
            TrackState::Stopping1 | TrackState::Stopping2 => {
                track.transition(TrackEvent::Start);
            }
        }
        track.clear_disabled();
        track.reset_retries(self.base.tuning().max_startup_retries);
        if track.frames_ready() == 0 {
            track.set_filling(FillingStatus::Filling);
        }

        let was_empty = state.spec.active.is_empty();
        if state.spec.active.add(Arc::clone(track)) {
            if let Some(chain) = state
                .base
                .effect_chains
                .iter()
                .find(|c| c.session() == track.session())
            {
                chain.inc_active_track_count();
            }
        }
        if was_empty {
            let base = &mut state.base;
            self.base.acquire_wake_lock(base);
        }
        state
            .spec
            .active
            .update_power(self.base.ctx().power.as_ref(), self.base.name());
        drop(state);
        self.base.wake();
        Ok(())
    }

    /// Begin the stop sequence: the track drains its remaining frames, then
    /// waits out the presentation pipeline before leaving the active set.
    pub fn stop_track(&self, track: &Arc<Track>) -> EngineResult<()> {
        let guard = self.base.lock();
        if track.transition(TrackEvent::Stop).is_none() && track.state() == TrackState::Idle {
            // never started; retire directly
            track.set_state(TrackState::Stopped);
        }
        drop(guard);
        self.base.wake();
        Ok(())
    }

    pub fn pause_track(&self, track: &Arc<Track>) -> EngineResult<()> {
        let state = self.base.lock();
        if track.state() == TrackState::Stopping1 {
            track.set_resume_to_stopping(true);
        }
        if track.transition(TrackEvent::Pause).is_some() && self.can_hw_pause(&state.spec) {
            track.set_pause_hw_pending(true);
        }
        drop(state);
        self.base.wake();
        Ok(())
    }

    /// Discard all queued frames. Only meaningful for inactive lifecycles;
    /// a flush while actively playing is ignored.
    pub fn flush_track(&self, track: &Arc<Track>) -> EngineResult<()> {
        let mut state = self.base.lock();
        if track.transition(TrackEvent::Flush).is_none() {
            log::debug!("{}: flush ignored in {}", self.base.name(), track.state().name());
            return Ok(());
        }
        track.clear_reset_done();
        // the RT loop must have dropped the ring before its cursors move
        if let Some(slot) = track.fast_slot() {
            if let Some(fast) = state.spec.fast.as_mut() {
                if let Err(e) = fast.clear_track(slot) {
                    log::warn!("{}: fast slot clear before flush failed: {e}", self.base.name());
                }
            }
        }
        track.ring().flush();
        if self.kind.is_direct() {
            track.set_flush_hw_pending(true);
        }
        drop(state);
        self.base.wake();
        Ok(())
    }

    /// Client handle dropped; the loop retires the track on its next pass.
    pub fn destroy_track(&self, track: &Arc<Track>) {
        let mut state = self.base.lock();
        track.terminate();
        if !state.spec.active.contains(track) {
            Self::retire_track(&self.base, &mut state, track);
        }
        drop(state);
        self.base.wake();
    }

    pub fn set_track_volume(&self, track: &Arc<Track>, volume: f32) {
        track.set_volume(volume);
        if let Some(slot) = track.fast_slot() {
            let mut state = self.base.lock();
            if let Some(fast) = state.spec.fast.as_mut() {
                if let Err(e) = fast.set_volume(slot, volume) {
                    log::warn!("{}: fast volume update failed: {e}", self.base.name());
                }
            }
        }
        self.base.wake();
    }

    pub fn is_standby(&self) -> bool {
        self.base.lock().base.standby
    }

    pub fn active_count(&self) -> usize {
        self.base.lock().spec.active.len()
    }

    pub fn frames_written(&self) -> u64 {
        self.base.lock().spec.timestamp.server_frames()
    }

    /// Invalidate every track on the given sessions (route went away).
    pub fn invalidate_tracks(&self, sessions: &[SessionId]) {
        let state = self.base.lock();
        for track in &state.spec.tracks {
            if sessions.contains(&track.session()) {
                track.invalidate();
            }
        }
        drop(state);
        self.base.wake();
    }

    fn can_hw_pause(&self, spec: &PlaybackState) -> bool {
        self.kind.is_direct() && spec.stream.supports_pause()
    }

    // ── loop ─────────────────────────────────────────────────────────────

    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        log::info!("{}: loop starting ({:?})", self.base.name(), self.kind);
        loop {
            match self.cycle() {
                CycleOutcome::Exited => break,
                CycleOutcome::Ran(sleep) | CycleOutcome::Idle(sleep) => {
                    let state = self.base.lock();
                    if state.base.exiting || !state.base.config_events.is_empty() {
                        continue;
                    }
                    let _state = self.base.wait_for_work(state, sleep);
                }
            }
        }
        self.running.store(false, Ordering::Release);
        log::info!("{}: loop exited", self.base.name());
    }

    /// One pass of the loop: drain events, prepare tracks, mix, write.
    pub fn cycle(&self) -> CycleOutcome {
        let mut state = self.base.lock();

        self.base.process_config_events(&mut state, |state, kind| {
            Self::handle_event(&self.base, state, kind)
        });

        if state.base.exiting {
            self.base.drain_events_at_exit(&mut state);
            self.teardown(&mut state);
            return CycleOutcome::Exited;
        }

        let period = self.period();
        self.prepare_tracks(&mut state);
        self.sync_fast_bridge(&mut state);

        if state.spec.active.is_empty() {
            let deadline = self.standby_delay();
            if !state.base.standby && state.spec.idle_since.elapsed() >= deadline {
                self.enter_standby(&mut state);
            }
            return CycleOutcome::Idle(deadline.max(period));
        }
        state.spec.idle_since = Instant::now();

        // paused direct output: keep the stream paused, do not write
        if state.spec.hw_paused {
            return CycleOutcome::Idle(period);
        }

        // a carried short write is flushed before any fresh mixing, so the
        // backlog stays bounded at one period
        if !state.spec.pending_write.is_empty() {
            match self.write_out(&mut state, Vec::new()) {
                Ok(()) => {
                    if !state.spec.pending_write.is_empty() {
                        return CycleOutcome::Ran(period);
                    }
                }
                Err(e) => {
                    log::warn!("{}: write failed, forcing standby: {e}", self.base.name());
                    state.spec.pending_write.clear();
                    self.enter_standby(&mut state);
                    return CycleOutcome::Idle(period);
                }
            }
        }

        // the pipe applies the same backpressure the hardware would
        if let Some(pipe) = &state.spec.mix_pipe {
            if pipe.frames_free() < self.frames_per_cycle {
                return CycleOutcome::Ran(period);
            }
        }

        let (buffer, underran) = self.mix(&mut state);
        if buffer.is_empty() && state.spec.pending_write.is_empty() {
            return CycleOutcome::Idle(period);
        }
        state.base.standby = false;
        let outcome = self.write_out(&mut state, buffer);
        match outcome {
            Ok(()) => {
                let sleep = if underran {
                    period / self.base.tuning().underrun_sleep_divisor.max(1)
                } else {
                    period
                };
                CycleOutcome::Ran(sleep)
            }
            Err(e) => {
                log::warn!("{}: write failed, forcing standby: {e}", self.base.name());
                state.spec.pending_write.clear();
                self.enter_standby(&mut state);
                CycleOutcome::Idle(period)
            }
        }
    }

    fn handle_event(
        base: &ThreadBase<PlaybackState>,
        state: &mut ThreadState<PlaybackState>,
        event: &ConfigEventKind,
    ) -> EngineResult<()> {
        match event {
            ConfigEventKind::RoutingChanged => {
                // route moved; positions restart on the new device
                state.spec.timestamp.discontinuity();
                Ok(())
            }
            ConfigEventKind::SetParameters(kv) => {
                if kv.is_empty() {
                    return Err(EngineError::InvalidArgument("empty parameter string".into()));
                }
                log::debug!("{}: set parameters {kv}", base.name());
                Ok(())
            }
            ConfigEventKind::CreatePatch { port } | ConfigEventKind::ReleasePatch { port } => {
                log::debug!("{}: patch event on {port:?}", base.name());
                state.spec.timestamp.discontinuity();
                Ok(())
            }
            ConfigEventKind::RequestPriority { pid, tid, forced } => {
                log::debug!(
                    "{}: priority request for {pid}/{tid} (forced {forced})",
                    base.name()
                );
                Ok(())
            }
            ConfigEventKind::ResizeBuffer { .. } => {
                Err(EngineError::NotSupported("buffer resize on an output thread"))
            }
            ConfigEventKind::UpdateLatencyMode(mode) => {
                state.base.latency_mode = *mode;
                Ok(())
            }
        }
    }

    /// The admission/retirement pass. Walks the active set, runs the
    /// lifecycle handshakes and removes finished or starved tracks.
    fn prepare_tracks(&self, state: &mut ThreadState<PlaybackState>) {
        let tuning = self.base.tuning();
        let max_retries = tuning.max_track_retries;
        let frames_per_cycle = self.frames_per_cycle;
        let mut removed: Vec<Arc<Track>> = Vec::new();

        for track in state.spec.active.snapshot() {
            if track.is_terminated() || track.is_invalid() {
                removed.push(track);
                continue;
            }

            // direct-family hardware handshakes run before data decisions
            if track.flush_hw_pending() {
                self.service_hw_flush(&mut state.spec, &track);
            }
            if track.pause_hw_pending() {
                self.service_hw_pause(&mut state.spec, &track);
            }

            match track.state() {
                TrackState::Starting1 => {
                    track.transition(TrackEvent::Served);
                }
                TrackState::Flushed => {
                    track.reset();
                    removed.push(track);
                }
                TrackState::Pausing | TrackState::Paused => {
                    // stays active so resume is cheap, contributes silence
                    if track.state() == TrackState::Pausing && !track.pause_hw_pending() {
                        track.transition(TrackEvent::PauseAcked);
                    }
                }
                TrackState::Stopping1 => {
                    if track.frames_ready() == 0 {
                        track.transition(TrackEvent::BufferExhausted);
                        let latency = state.spec.stream.latency_frames() as u64;
                        track.set_presentation_target(
                            state.spec.timestamp.server_frames() + latency,
                        );
                        if self.kind == OutputKind::Offload {
                            if let Err(e) = state.spec.stream.drain(false) {
                                log::warn!("{}: drain failed: {e}", self.base.name());
                            }
                        }
                    }
                }
                TrackState::Stopping2 => {
                    if track.presentation_complete(state.spec.timestamp.server_frames()) {
                        track.transition(TrackEvent::PresentationComplete);
                        removed.push(track);
                    }
                }
                TrackState::Stopped => {
                    removed.push(track);
                }
                TrackState::Active | TrackState::Resuming | TrackState::Starting2 => {
                    if track.state() == TrackState::Resuming {
                        track.transition(TrackEvent::ResumeAcked);
                    }
                    if track.is_fast() {
                        // the RT loop drains the ring between passes, so a
                        // healthy fast track shows consumption, not a full
                        // buffer
                        let progressed = track.take_fast_progress();
                        if progressed {
                            if track.state() == TrackState::Starting2 {
                                track.transition(TrackEvent::DataDelivered);
                            }
                            track.set_filling(FillingStatus::Active);
                        }
                        if progressed || track.frames_ready() > 0 {
                            track.reset_retries(max_retries);
                            if track.filling() == FillingStatus::Filling {
                                track.set_filling(FillingStatus::Filled);
                            }
                        } else {
                            track.tally_underrun_frames(frames_per_cycle);
                            if track.consume_retry() == 0 {
                                log::warn!(
                                    "{}: {} starved out, removing",
                                    self.base.name(),
                                    track.id()
                                );
                                track.disable();
                                track.set_state(TrackState::Stopped);
                                removed.push(track);
                            }
                        }
                        continue;
                    }
                    let min_frames = if track.filling() == FillingStatus::Filling {
                        track.frame_count()
                    } else {
                        frames_per_cycle
                    };
                    if track.frames_ready() >= min_frames {
                        track.reset_retries(max_retries);
                        if track.filling() == FillingStatus::Filling {
                            track.set_filling(FillingStatus::Filled);
                        }
                    } else {
                        track.tally_underrun_frames(min_frames - track.frames_ready());
                        if track.consume_retry() == 0 {
                            log::warn!(
                                "{}: {} starved out, removing",
                                self.base.name(),
                                track.id()
                            );
                            track.disable();
                            track.set_state(TrackState::Stopped);
                            removed.push(track);
                        }
                    }
                }
                TrackState::Idle => unreachable!("idle track in the active set"),
            }
        }

        if removed.is_empty() {
            return;
        }
        for track in removed {
            if state.spec.active.remove(&track) {
                if let Some(chain) = state
                    .base
                    .effect_chains
                    .iter()
                    .find(|c| c.session() == track.session())
                {
                    chain.dec_active_track_count();
                }
            }
            if track.is_terminated() {
                Self::retire_track(&self.base, state, &track);
            }
        }
        if state.spec.active.is_empty() {
            state.spec.idle_since = Instant::now();
        }
        state
            .spec
            .active
            .update_power(self.base.ctx().power.as_ref(), self.base.name());
    }

    fn service_hw_flush(&self, spec: &mut PlaybackState, track: &Arc<Track>) {
        // a pending flush forces the preceding pause out first
        if track.pause_hw_pending() {
            self.service_hw_pause(spec, track);
        }
        if let Err(e) = spec.stream.flush() {
            log::warn!("{}: hardware flush failed: {e}", self.base.name());
        }
        spec.hw_paused = false;
        spec.timestamp.discontinuity();
        track.set_flush_hw_pending(false);
    }

    fn service_hw_pause(&self, spec: &mut PlaybackState, track: &Arc<Track>) {
        if !spec.hw_paused {
            match spec.stream.pause() {
                Ok(()) => spec.hw_paused = true,
                Err(e) => log::warn!("{}: hardware pause failed: {e}", self.base.name()),
            }
        }
        track.set_pause_hw_pending(false);
        track.transition(TrackEvent::PauseAcked);
    }

    /// Mix one period of every ready, audible track. Returns the interleaved
    /// output and whether any mixed track underran.
    fn mix(&self, state: &mut ThreadState<PlaybackState>) -> (Vec<f32>, bool) {
        let spf = self.format.samples_per_frame();
        let samples = self.frames_per_cycle * spf;
        let mut scratches: Vec<(Vec<f32>, f32)> = Vec::new();
        let mut underran = false;
        let mut any_audible = false;
        let mut any_draining = false;

        for track in state.spec.active.snapshot() {
            if track.is_fast() {
                continue; // served by the fast mixer
            }
            if track.state() == TrackState::Stopping2 {
                any_draining = true;
                continue;
            }
            let audible = matches!(
                track.state(),
                TrackState::Active
                    | TrackState::Starting2
                    | TrackState::Resuming
                    | TrackState::Stopping1
            );
            // a draining track bypasses the priming gate
            if !audible
                || (track.filling() == FillingStatus::Filling
                    && track.state() != TrackState::Stopping1)
            {
                continue;
            }
            any_audible = true;
            let mut scratch = vec![0.0f32; samples];
            let got = track.ring().read_frames(&mut scratch);
            if got > 0 {
                if track.state() == TrackState::Starting2 {
                    track.transition(TrackEvent::DataDelivered);
                }
                track.set_filling(FillingStatus::Active);
            }
            if got < self.frames_per_cycle && track.state() != TrackState::Stopping1 {
                underran = true;
            }
            // bit-perfect delivery carries client samples unscaled
            let volume = if self.kind == OutputKind::BitPerfect {
                1.0
            } else {
                track.volume()
            };
            scratches.push((scratch, volume));
        }

        if !any_audible {
            // drained tracks still need the presentation clock to advance
            if any_draining {
                return (vec![0.0f32; samples], false);
            }
            return (Vec::new(), false);
        }

        let mut out = vec![0.0f32; samples];
        let inputs: Vec<MixInput<'_>> = scratches
            .iter()
            .map(|(scratch, volume)| MixInput {
                samples: scratch.as_slice(),
                volume: *volume,
            })
            .collect();
        state.spec.mixer.mix(&inputs, &mut out);

        for chain in &state.base.effect_chains {
            if chain.insertion_point() != InsertionPoint::PreMix {
                chain.process(&mut out);
            }
        }
        (out, underran)
    }

    /// Write with short-write carry. Any error forces standby upstream.
    ///
    /// With a fast mixer present the stream has one writer, the RT loop;
    /// the normal mix goes through the pipe instead.
    fn write_out(
        &self,
        state: &mut ThreadState<PlaybackState>,
        buffer: Vec<f32>,
    ) -> EngineResult<()> {
        if let Some(pipe) = state.spec.mix_pipe.clone() {
            if buffer.is_empty() {
                return Ok(());
            }
            let frames = pipe.write_frames(&buffer);
            state.spec.timestamp.advance_server(frames as u64);
            if let Ok(pos) = state.spec.stream.presentation_position() {
                state.spec.timestamp.update_kernel(pos);
            }
            if let Some(fast) = state.spec.fast.as_mut() {
                fast.set_pipe_active(true)?;
            }
            return Ok(());
        }

        let mut bytes = std::mem::take(&mut state.spec.pending_write);
        encode_frames(self.format, &buffer, &mut bytes);
        if bytes.is_empty() {
            return Ok(());
        }

        let written = state.spec.stream.write(&bytes)?;
        let frame_size = self.format.frame_size();
        if written < bytes.len() {
            state.spec.pending_write = bytes.split_off(written);
        }
        state.spec.timestamp.advance_server((written / frame_size) as u64);
        if let Ok(pos) = state.spec.stream.presentation_position() {
            state.spec.timestamp.update_kernel(pos);
        }

        for extra in &state.spec.extra_outputs {
            if let Err(e) = extra.write(&bytes[..written]) {
                log::warn!("{}: duplicated output write failed: {e}", self.base.name());
            }
        }
        Ok(())
    }

    /// Keep the fast mixer's slots in step with the active set.
    fn sync_fast_bridge(&self, state: &mut ThreadState<PlaybackState>) {
        if state.spec.fast.is_none() || !state.spec.active.read_and_clear_has_changed() {
            return;
        }
        let active = state.spec.active.snapshot();
        let spec = &mut state.spec;
        let Some(fast) = spec.fast.as_mut() else {
            return;
        };
        for track in &spec.tracks {
            let Some(slot) = track.fast_slot() else {
                continue;
            };
            let serving = active.iter().any(|a| Arc::ptr_eq(a, track))
                && matches!(
                    track.state(),
                    TrackState::Active
                        | TrackState::Starting2
                        | TrackState::Resuming
                        | TrackState::Stopping1
                );
            let result = if serving {
                fast.set_track(
                    slot,
                    FastTrackState {
                        track_id: track.id(),
                        ring: track.ring().clone(),
                        volume: track.volume(),
                    },
                )
            } else {
                fast.clear_track(slot)
            };
            if let Err(e) = result {
                log::warn!("{}: fast bridge sync failed: {e}", self.base.name());
            }
        }
    }

    fn enter_standby(&self, state: &mut ThreadState<PlaybackState>) {
        if state.base.standby {
            return;
        }
        log::info!("{}: entering standby", self.base.name());
        if let Some(fast) = state.spec.fast.as_mut() {
            if let Err(e) = fast.set_pipe_active(false) {
                log::warn!("{}: fast pipe deactivation failed: {e}", self.base.name());
            }
        }
        if let Err(e) = state.spec.stream.standby() {
            log::warn!("{}: standby failed: {e}", self.base.name());
        }
        state.spec.timestamp.discontinuity();
        state.spec.hw_paused = false;
        state.base.standby = true;
        let base = &mut state.base;
        self.base.release_wake_lock(base);
    }

    fn teardown(&self, state: &mut ThreadState<PlaybackState>) {
        for track in state.spec.active.clear() {
            track.invalidate();
            if let Some(chain) = state
                .base
                .effect_chains
                .iter()
                .find(|c| c.session() == track.session())
            {
                chain.dec_active_track_count();
            }
            if let Some(slot) = track.fast_slot() {
                if let Some(fast) = state.spec.fast.as_mut() {
                    let _ = fast.clear_track(slot);
                    fast.free_slot(slot);
                }
            }
        }
        if let Some(mut fast) = state.spec.fast.take() {
            fast.shutdown();
        }
        self.enter_standby(state);
        for track in state.spec.tracks.drain(..) {
            if let Some(chain) = state
                .base
                .effect_chains
                .iter()
                .find(|c| c.session() == track.session())
            {
                chain.dec_track_count();
            }
        }
    }

    /// Remove a retired track from the live list and release its slot.
    fn retire_track(
        base: &ThreadBase<PlaybackState>,
        state: &mut ThreadState<PlaybackState>,
        track: &Arc<Track>,
    ) {
        if let Some(slot) = track.fast_slot() {
            if let Some(fast) = state.spec.fast.as_mut() {
                if let Err(e) = fast.clear_track(slot) {
                    log::warn!("{}: fast slot release not acked: {e}", base.name());
                }
                fast.free_slot(slot);
            }
        }
        if let Some(chain) = state
            .base
            .effect_chains
            .iter()
            .find(|c| c.session() == track.session())
        {
            chain.dec_track_count();
        }
        state.spec.tracks.retain(|t| !Arc::ptr_eq(t, track));
        log::debug!("{}: retired {}", base.name(), track.id());
    }

    fn period(&self) -> Duration {
        Duration::from_micros(
            self.frames_per_cycle as u64 * 1_000_000 / self.format.sample_rate.max(1) as u64,
        )
    }

    fn standby_delay(&self) -> Duration {
        self.period() * self.base.tuning().standby_delay_periods
    }

    /// Begin the exit protocol and join the loop thread.
    pub fn shutdown(&self) {
        self.base.exit();
        let join = match self.join.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(join) = join {
            if join.join().is_err() {
                log::error!("{}: loop panicked", self.base.name());
            }
        } else if self.running.load(Ordering::Acquire) {
            log::warn!("{}: loop not owned here, exit flagged only", self.base.name());
        } else {
            // never spawned; run teardown inline
            let _ = self.cycle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimOutputStream;
    use crate::types::{AudioFormat, ChannelMask};

    fn stereo() -> StreamFormat {
        StreamFormat::new(48000, AudioFormat::PcmF32, ChannelMask::STEREO)
    }

    fn thread(kind: OutputKind, stream: Arc<SimOutputStream>) -> Arc<PlaybackThread> {
        PlaybackThread::new("out_test", kind, stream, ServerContext::with_defaults()).unwrap()
    }

    #[test]
    fn test_create_track_resolves_zero_hint() {
        let stream = Arc::new(SimOutputStream::new(256));
        let t = thread(OutputKind::Direct, stream);
        let track = t
            .create_track(SessionId(1), PortId(1), Uid(1), stereo(), 0, false)
            .unwrap();
        // deep default: period times the configured depth multiplier
        assert_eq!(track.frame_count(), 512);

        let track = t
            .create_track(SessionId(1), PortId(1), Uid(1), stereo(), 100, false)
            .unwrap();
        // short hints are raised to one period
        assert_eq!(track.frame_count(), 256);
        t.shutdown();
    }

    #[test]
    fn test_create_track_rejects_rate_mismatch() {
        let stream = Arc::new(SimOutputStream::new(256));
        let t = thread(OutputKind::Direct, stream);
        let format = StreamFormat::new(44100, AudioFormat::PcmF32, ChannelMask::STEREO);
        assert!(matches!(
            t.create_track(SessionId(1), PortId(1), Uid(1), format, 0, false),
            Err(EngineError::InvalidArgument(_))
        ));
        t.shutdown();
    }

    #[test]
    fn test_fast_slots_exhaust() {
        let stream = Arc::new(SimOutputStream::new(256));
        let t = thread(OutputKind::Mixer, stream);
        for _ in 0..crate::types::FAST_TRACK_SLOTS {
            t.create_track(SessionId(1), PortId(1), Uid(1), stereo(), 0, true)
                .unwrap();
        }
        assert!(matches!(
            t.create_track(SessionId(1), PortId(1), Uid(1), stereo(), 0, true),
            Err(EngineError::ResourceExhausted(_))
        ));
        t.shutdown();
    }

    #[test]
    fn test_started_track_plays_through_cycle() {
        let stream = Arc::new(SimOutputStream::new(64));
        let t = thread(OutputKind::Direct, Arc::clone(&stream));
        let track = t
            .create_track(SessionId(1), PortId(1), Uid(1), stereo(), 0, false)
            .unwrap();
        track.ring().write_frames(&vec![0.5f32; 128 * 2]);
        t.start_track(&track).unwrap();
        assert_eq!(track.state(), TrackState::Starting1);

        // cycle 1: admission serves the start handshake
        t.cycle();
        // cycle 2: data flows, track goes active
        t.cycle();
        assert_eq!(track.state(), TrackState::Active);
        assert!(stream.write_count() > 0);
        assert!(t.frames_written() > 0);
        t.shutdown();
    }

    #[test]
    fn test_stop_drains_then_retires() {
        let stream = Arc::new(SimOutputStream::new(64));
        let t = thread(OutputKind::Direct, Arc::clone(&stream));
        let track = t
            .create_track(SessionId(1), PortId(1), Uid(1), stereo(), 0, false)
            .unwrap();
        track.ring().write_frames(&vec![0.25f32; 64 * 2]);
        t.start_track(&track).unwrap();
        t.cycle();
        t.cycle();

        t.stop_track(&track).unwrap();
        assert_eq!(track.state(), TrackState::Stopping1);
        // remaining data is consumed, then the exhaustion transition fires
        for _ in 0..4 {
            t.cycle();
        }
        assert!(matches!(
            track.state(),
            TrackState::Stopping2 | TrackState::Stopped
        ));
        // keep writing until presentation completes
        for _ in 0..64 {
            if track.state() == TrackState::Stopped {
                break;
            }
            t.cycle();
        }
        assert_eq!(track.state(), TrackState::Stopped);
        assert_eq!(t.active_count(), 0);
        t.shutdown();
    }
}
