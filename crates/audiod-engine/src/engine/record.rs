//! Input thread: the capture loop and per-track fan-out
//!
//! The loop reads one period from the hardware stream into a history ring,
//! then copies from the history to every active track's transfer ring at
//! that track's own cursor. A slow client lags independently; when its
//! cursor falls off the history tail the copy jumps forward and the track
//! is flagged overrun. With the fast path enabled a real-time companion
//! does the hardware reads instead and the loop drains its transfer ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use basedrop::Shared;

use crate::effect::ThreadRole;
use crate::engine::base::{ServerContext, ThreadBase, ThreadState};
use crate::engine::event::ConfigEventKind;
use crate::engine::playback::CycleOutcome;
use crate::error::{EngineError, EngineResult};
use crate::fast::FastCaptureHandle;
use crate::gc;
use crate::hal::StreamIn;
use crate::ring::{FrameRing, HistoryRing};
use crate::track::{ActiveTracks, RecordTrack, TrackEvent, TrackState};
use crate::types::{decode_frames, PortId, SessionId, StreamFormat, Uid};

/// History sized in periods; must cover the slowest tolerated client.
const HISTORY_PERIODS: usize = 4;

struct RecordState {
    stream: Arc<dyn StreamIn>,
    tracks: Vec<Arc<RecordTrack>>,
    active: ActiveTracks<RecordTrack>,
    history: HistoryRing,
    fast: Option<FastCaptureHandle>,
    /// Transfer ring from the fast capture loop, present while capturing
    fast_ring: Option<Shared<FrameRing>>,
    idle_since: Instant,
}

pub struct RecordThread {
    base: ThreadBase<RecordState>,
    format: StreamFormat,
    frames_per_cycle: usize,
    use_fast: bool,
    join: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl RecordThread {
    pub fn new(
        name: impl Into<String>,
        stream: Arc<dyn StreamIn>,
        use_fast: bool,
        ctx: Arc<ServerContext>,
    ) -> EngineResult<Arc<Self>> {
        let name = name.into();
        let format = stream.format();
        let frames_per_cycle = stream.frame_count();
        if frames_per_cycle == 0 {
            return Err(EngineError::InvalidArgument(
                "input stream reports zero period".into(),
            ));
        }

        let fast = if use_fast {
            let timeout = Duration::from_millis(ctx.tuning.config_event_timeout_ms);
            Some(FastCaptureHandle::spawn(
                &name,
                Arc::clone(&stream),
                frames_per_cycle,
                timeout,
            )?)
        } else {
            None
        };

        let spec = RecordState {
            stream,
            tracks: Vec::new(),
            active: ActiveTracks::new(),
            history: HistoryRing::new(
                frames_per_cycle * HISTORY_PERIODS,
                format.samples_per_frame(),
            ),
            fast,
            fast_ring: None,
            idle_since: Instant::now(),
        };
        Ok(Arc::new(Self {
            base: ThreadBase::new(name, ThreadRole::Record, ctx, spec),
            format,
            frames_per_cycle,
            use_fast,
            join: Mutex::new(None),
            running: AtomicBool::new(false),
        }))
    }

    pub fn spawn(
        name: impl Into<String>,
        stream: Arc<dyn StreamIn>,
        use_fast: bool,
        ctx: Arc<ServerContext>,
    ) -> EngineResult<Arc<Self>> {
        let thread = Self::new(name, stream, use_fast, ctx)?;
        let runner = Arc::clone(&thread);
        let join = std::thread::Builder::new()
            .name(thread.base.name().to_string())
            .spawn(move || runner.run())
            .map_err(|e| EngineError::Hardware(format!("spawn record thread: {e}")))?;
        if let Ok(mut slot) = thread.join.lock() {
            *slot = Some(join);
        }
        Ok(thread)
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
        point: crate::effect::InsertionPoint,
        desc: crate::effect::EffectDesc,
    ) -> EngineResult<Arc<crate::effect::EffectChain>> {
        self.base.create_effect(session, point, desc)
    }

    // ── client surface ───────────────────────────────────────────────────

    pub fn create_track(
        &self,
        session: SessionId,
        port: PortId,
        uid: Uid,
        format: StreamFormat,
        frame_count_hint: usize,
    ) -> EngineResult<Arc<RecordTrack>> {
        if format.sample_rate != self.format.sample_rate {
            return Err(EngineError::InvalidArgument(format!(
                "sample rate {} does not match capture rate {}",
                format.sample_rate, self.format.sample_rate
            )));
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
        let track = Arc::new(RecordTrack::new(session, port, uid, format, frame_count));
        log::info!(
            "{}: created {} ({frame_count} frames)",
            self.base.name(),
            track.id()
        );
        state.spec.tracks.push(Arc::clone(&track));
        Ok(track)
    }

    /// Start capturing into the track. The handshake completes over the
    /// next two cycles: served by the loop, then first data delivered.
    pub fn start_track(&self, track: &Arc<RecordTrack>) -> EngineResult<()> {
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
        match track.state() {
            TrackState::Active | TrackState::Starting1 | TrackState::Starting2 => {}
            _ => {
                if track.transition(TrackEvent::Start).is_none() {
                    return Err(EngineError::InvalidState("start not legal here"));
                }
            }
        }
        // new tracks read from "now", not from history
        track.set_history_cursor(state.spec.history.new_cursor());
        track.reset_retries(self.base.tuning().max_record_retries);
        track.clear_overflowed();

        let was_empty = state.spec.active.is_empty();
        state.spec.active.add(Arc::clone(track));
        if was_empty {
            let base = &mut state.base;
            self.base.acquire_wake_lock(base);
            self.start_fast_capture(&mut state.spec);
        }
        state
            .spec
            .active
            .update_power(self.base.ctx().power.as_ref(), self.base.name());
        drop(state);
        self.base.wake();
        Ok(())
    }

    pub fn stop_track(&self, track: &Arc<RecordTrack>) -> EngineResult<()> {
        let guard = self.base.lock();
        if track.transition(TrackEvent::Stop).is_none() && track.state() == TrackState::Idle {
            track.set_state(TrackState::Stopped);
        }
        drop(guard);
        self.base.wake();
        Ok(())
    }

    pub fn destroy_track(&self, track: &Arc<RecordTrack>) {
        let mut state = self.base.lock();
        track.terminate();
        if !state.spec.active.contains(track) {
            state.spec.tracks.retain(|t| !Arc::ptr_eq(t, track));
        }
        drop(state);
        self.base.wake();
    }

    pub fn is_standby(&self) -> bool {
        self.base.lock().base.standby
    }

    pub fn active_count(&self) -> usize {
        self.base.lock().spec.active.len()
    }

    // ── loop ─────────────────────────────────────────────────────────────

    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        log::info!("{}: capture loop starting", self.base.name());
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
        log::info!("{}: capture loop exited", self.base.name());
    }

    /// One pass: drain events, read a period, fan out, retire tracks.
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
        if state.spec.active.is_empty() {
            let deadline = self.standby_delay();
            if !state.base.standby && state.spec.idle_since.elapsed() >= deadline {
                self.enter_standby(&mut state);
            }
            return CycleOutcome::Idle(deadline.max(period));
        }
        state.spec.idle_since = Instant::now();
        state.base.standby = false;

        if let Err(e) = self.capture_period(&mut state.spec) {
            log::warn!("{}: read failed, forcing standby: {e}", self.base.name());
            self.enter_standby(&mut state);
            return CycleOutcome::Idle(period);
        }
        self.deliver(&mut state);
        CycleOutcome::Ran(period)
    }

    fn handle_event(
        base: &ThreadBase<RecordState>,
        state: &mut ThreadState<RecordState>,
        event: &ConfigEventKind,
    ) -> EngineResult<()> {
        match event {
            ConfigEventKind::RoutingChanged => Ok(()),
            ConfigEventKind::SetParameters(kv) => {
                if kv.is_empty() {
                    return Err(EngineError::InvalidArgument("empty parameter string".into()));
                }
                log::debug!("{}: set parameters {kv}", base.name());
                Ok(())
            }
            ConfigEventKind::CreatePatch { port } | ConfigEventKind::ReleasePatch { port } => {
                log::debug!("{}: patch event on {port:?}", base.name());
                Ok(())
            }
            ConfigEventKind::RequestPriority { pid, tid, forced } => {
                log::debug!(
                    "{}: priority request for {pid}/{tid} (forced {forced})",
                    base.name()
                );
                Ok(())
            }
            ConfigEventKind::ResizeBuffer { frames } => {
                if *frames == 0 {
                    return Err(EngineError::InvalidArgument("resize to zero frames".into()));
                }
                // grow-only: shrinking would drop history under live cursors
                if *frames > state.spec.history.capacity() {
                    state.spec.history.resize(*frames);
                }
                Ok(())
            }
            ConfigEventKind::UpdateLatencyMode(_) => {
                Err(EngineError::NotSupported("latency mode on a record thread"))
            }
        }
    }

    /// Pull one period of input into the history ring.
    fn capture_period(&self, spec: &mut RecordState) -> EngineResult<()> {
        let spf = self.format.samples_per_frame();
        let samples = self.frames_per_cycle * spf;
        let mut scratch = vec![0.0f32; samples];

        let frames = if let Some(ring) = &spec.fast_ring {
            // fast path: the companion already read the hardware
            ring.read_frames(&mut scratch)
        } else {
            let mut raw = vec![0u8; self.frames_per_cycle * self.format.frame_size()];
            let bytes = spec.stream.read(&mut raw)?;
            decode_frames(self.format, &raw[..bytes], &mut scratch)
        };
        if frames > 0 {
            spec.history.append(&scratch[..frames * spf]);
        }
        Ok(())
    }

    /// Fan captured frames out to every active track and run lifecycles.
    fn deliver(&self, state: &mut ThreadState<RecordState>) {
        let spf = self.format.samples_per_frame();
        let max_retries = self.base.tuning().max_record_retries;
        let mut removed: Vec<Arc<RecordTrack>> = Vec::new();
        let mut scratch = vec![0.0f32; self.frames_per_cycle * spf * HISTORY_PERIODS];

        for track in state.spec.active.snapshot() {
            if track.is_terminated() || track.is_invalid() {
                removed.push(track);
                continue;
            }
            match track.state() {
                TrackState::Starting1 => {
                    track.transition(TrackEvent::Served);
                    continue;
                }
                TrackState::Stopping1 => {
                    // capture has no drain: retire immediately
                    track.transition(TrackEvent::BufferExhausted);
                    track.transition(TrackEvent::PresentationComplete);
                    removed.push(track);
                    continue;
                }
                TrackState::Starting2 | TrackState::Active => {}
                other => {
                    log::warn!(
                        "{}: {} unexpected capture state {}",
                        self.base.name(),
                        track.id(),
                        other.name()
                    );
                    removed.push(track);
                    continue;
                }
            }

            let mut cursor = track.history_cursor();
            let want = track
                .ring()
                .frames_free()
                .min(scratch.len() / spf);
            if want == 0 {
                // client is not draining its ring
                if track.consume_retry() == 0 {
                    log::warn!("{}: {} buffer timeout, removing", self.base.name(), track.id());
                    track.set_overflowed();
                    track.set_state(TrackState::Stopped);
                    removed.push(track);
                }
                continue;
            }
            let copy = state
                .spec
                .history
                .copy_to(&mut cursor, &mut scratch[..want * spf]);
            track.set_history_cursor(cursor);
            if copy.overrun {
                // cursor fell off the history tail; it was advanced past
                // the dropped frames
                track.set_overflowed();
            }
            if copy.frames > 0 {
                track.ring().write_frames(&scratch[..copy.frames * spf]);
                track.reset_retries(max_retries);
                if track.state() == TrackState::Starting2 {
                    track.transition(TrackEvent::DataDelivered);
                }
                // any clean delivery clears the latch, not just the first
                if !copy.overrun {
                    track.clear_overflowed();
                }
            }
        }

        if removed.is_empty() {
            return;
        }
        for track in removed {
            state.spec.active.remove(&track);
            if track.is_terminated() {
                state.spec.tracks.retain(|t| !Arc::ptr_eq(t, &track));
            }
        }
        if state.spec.active.is_empty() {
            state.spec.idle_since = Instant::now();
            self.stop_fast_capture(&mut state.spec);
        }
        state
            .spec
            .active
            .update_power(self.base.ctx().power.as_ref(), self.base.name());
    }

    fn start_fast_capture(&self, spec: &mut RecordState) {
        if !self.use_fast || spec.fast_ring.is_some() {
            return;
        }
        let ring = Shared::new(
            &gc::gc_handle(),
            FrameRing::new(
                self.frames_per_cycle * HISTORY_PERIODS,
                self.format.samples_per_frame(),
            ),
        );
        if let Some(fast) = spec.fast.as_mut() {
            match fast.start(Shared::clone(&ring)) {
                Ok(()) => spec.fast_ring = Some(ring),
                Err(e) => log::warn!("{}: fast capture start failed: {e}", self.base.name()),
            }
        }
    }

    fn stop_fast_capture(&self, spec: &mut RecordState) {
        if spec.fast_ring.take().is_some() {
            if let Some(fast) = spec.fast.as_mut() {
                if let Err(e) = fast.stop() {
                    log::warn!("{}: fast capture stop not acked: {e}", self.base.name());
                }
            }
        }
    }

    fn enter_standby(&self, state: &mut ThreadState<RecordState>) {
        if state.base.standby {
            return;
        }
        log::info!("{}: entering standby", self.base.name());
        self.stop_fast_capture(&mut state.spec);
        if let Err(e) = state.spec.stream.standby() {
            log::warn!("{}: standby failed: {e}", self.base.name());
        }
        state.base.standby = true;
        let base = &mut state.base;
        self.base.release_wake_lock(base);
    }

    fn teardown(&self, state: &mut ThreadState<RecordState>) {
        for track in state.spec.active.clear() {
            track.invalidate();
        }
        self.stop_fast_capture(&mut state.spec);
        if let Some(mut fast) = state.spec.fast.take() {
            fast.shutdown();
        }
        self.enter_standby(state);
        state.spec.tracks.clear();
    }

    fn period(&self) -> Duration {
        Duration::from_micros(
            self.frames_per_cycle as u64 * 1_000_000 / self.format.sample_rate.max(1) as u64,
        )
    }

    fn standby_delay(&self) -> Duration {
        self.period() * self.base.tuning().standby_delay_periods
    }

    pub fn shutdown(&self) {
        self.base.exit();
        let join = match self.join.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(join) = join {
            if join.join().is_err() {
                log::error!("{}: capture loop panicked", self.base.name());
            }
        } else if !self.running.load(Ordering::Acquire) {
            let _ = self.cycle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimInputStream;
    use crate::types::{AudioFormat, ChannelMask};

    fn stereo() -> StreamFormat {
        StreamFormat::new(48000, AudioFormat::PcmF32, ChannelMask::STEREO)
    }

    fn thread(stream: Arc<SimInputStream>) -> Arc<RecordThread> {
        RecordThread::new("in_test", stream, false, ServerContext::with_defaults()).unwrap()
    }

    #[test]
    fn test_start_handshake_delivers_data() {
        let stream = Arc::new(SimInputStream::new(64));
        let t = thread(stream);
        let track = t
            .create_track(SessionId(1), PortId(1), Uid(1), stereo(), 0)
            .unwrap();
        t.start_track(&track).unwrap();
        assert_eq!(track.state(), TrackState::Starting1);

        t.cycle(); // served
        assert_eq!(track.state(), TrackState::Starting2);
        t.cycle(); // first data
        assert_eq!(track.state(), TrackState::Active);
        assert!(track.frames_ready() > 0);
        t.shutdown();
    }

    #[test]
    fn test_stalled_client_removed_after_retries() {
        let stream = Arc::new(SimInputStream::new(64));
        let t = thread(stream);
        let track = t
            .create_track(SessionId(1), PortId(1), Uid(1), stereo(), 0)
            .unwrap();
        t.start_track(&track).unwrap();

        // never drain the client ring; it fills, then retries run out
        let retries = t.base.tuning().max_record_retries as usize;
        for _ in 0..(retries + 8) {
            t.cycle();
        }
        assert_eq!(track.state(), TrackState::Stopped);
        assert!(track.overflowed());
        assert_eq!(t.active_count(), 0);
        t.shutdown();
    }

    #[test]
    fn test_resize_buffer_validated_by_loop() {
        let stream = Arc::new(SimInputStream::new(64));
        let t = RecordThread::spawn("in_test", stream, false, ServerContext::with_defaults())
            .unwrap();
        t.send_config_event(ConfigEventKind::ResizeBuffer { frames: 1024 })
            .unwrap();
        assert!(matches!(
            t.send_config_event(ConfigEventKind::ResizeBuffer { frames: 0 }),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            t.send_config_event(ConfigEventKind::UpdateLatencyMode(
                crate::types::LatencyMode::Low
            )),
            Err(EngineError::NotSupported(_))
        ));
        t.shutdown();
    }
}
