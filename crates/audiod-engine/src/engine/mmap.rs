//! Memory-mapped thread: client and hardware share the buffer directly
//!
//! No mixing or capture loop runs here. After the start handshake maps the
//! hardware buffer into the client, the loop only services config events,
//! keeps volume bookkeeping, and checks liveness: a track whose backing
//! route changed underneath it is invalidated so the client reopens.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::effect::ThreadRole;
use crate::engine::base::{ServerContext, ThreadBase, ThreadState};
use crate::engine::event::ConfigEventKind;
use crate::engine::playback::CycleOutcome;
use crate::error::{EngineError, EngineResult};
use crate::hal::MmapStream;
use crate::track::active::ActiveTrack;
use crate::track::state::{StateCell, TrackEvent, TrackState};
use crate::types::{PortId, SessionId, StreamFormat, TrackId, Uid};

/// One client endpoint on a memory-mapped stream.
pub struct MmapTrack {
    id: TrackId,
    session: SessionId,
    port: PortId,
    uid: Uid,
    format: StreamFormat,
    state: StateCell,
    /// Route identity captured at start; a mismatch later means the route
    /// was silently rebuilt
    route_token: std::sync::atomic::AtomicU64,
    invalid: AtomicBool,
    volume_bits: AtomicU32,
}

impl MmapTrack {
    fn new(session: SessionId, port: PortId, uid: Uid, format: StreamFormat) -> Self {
        Self {
            id: TrackId::next(),
            session,
            port,
            uid,
            format,
            state: StateCell::new(TrackState::Idle),
            route_token: std::sync::atomic::AtomicU64::new(0),
            invalid: AtomicBool::new(false),
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
    pub fn state(&self) -> TrackState {
        self.state.get()
    }

    pub fn invalidate(&self) {
        if !self.invalid.swap(true, Ordering::Relaxed) {
            log::info!("{}: invalidated", self.id);
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 2.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    fn route_token(&self) -> u64 {
        self.route_token.load(Ordering::Relaxed)
    }

    fn set_route_token(&self, token: u64) {
        self.route_token.store(token, Ordering::Relaxed);
    }
}

impl ActiveTrack for MmapTrack {
    fn uid(&self) -> Uid {
        self.uid
    }
}

struct MmapState {
    stream: Arc<dyn MmapStream>,
    tracks: Vec<Arc<MmapTrack>>,
    active: crate::track::ActiveTracks<MmapTrack>,
    /// Hardware buffer size granted by the map call, zero until mapped
    mapped_frames: usize,
    hw_running: bool,
}

pub struct MmapThread {
    base: ThreadBase<MmapState>,
    format: StreamFormat,
    join: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MmapThread {
    pub fn new(
        name: impl Into<String>,
        stream: Arc<dyn MmapStream>,
        ctx: Arc<ServerContext>,
    ) -> Arc<Self> {
        let format = stream.format();
        let spec = MmapState {
            stream,
            tracks: Vec::new(),
            active: crate::track::ActiveTracks::new(),
            mapped_frames: 0,
            hw_running: false,
        };
        Arc::new(Self {
            base: ThreadBase::new(name, ThreadRole::Mmap, ctx, spec),
            format,
            join: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn spawn(
        name: impl Into<String>,
        stream: Arc<dyn MmapStream>,
        ctx: Arc<ServerContext>,
    ) -> EngineResult<Arc<Self>> {
        let thread = Self::new(name, stream, ctx);
        let runner = Arc::clone(&thread);
        let join = std::thread::Builder::new()
            .name(thread.base.name().to_string())
            .spawn(move || runner.run())
            .map_err(|e| EngineError::Hardware(format!("spawn mmap thread: {e}")))?;
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

    pub fn send_config_event(&self, kind: ConfigEventKind) -> EngineResult<()> {
        self.base.send_config_event(kind)
    }

    // ── client surface ───────────────────────────────────────────────────

    /// Map the hardware buffer and admit a track onto it. The first call
    /// performs the map; later tracks share it.
    pub fn create_track(
        &self,
        session: SessionId,
        port: PortId,
        uid: Uid,
        min_frames: usize,
    ) -> EngineResult<(Arc<MmapTrack>, usize)> {
        let mut state = self.base.lock();
        if state.base.busy || state.base.exiting {
            return Err(EngineError::Dead);
        }
        if state.spec.mapped_frames == 0 {
            state.spec.mapped_frames = state.spec.stream.create_mmap_buffer(min_frames)?;
            log::info!(
                "{}: mapped {} hardware frames",
                self.base.name(),
                state.spec.mapped_frames
            );
        } else if min_frames > state.spec.mapped_frames {
            return Err(EngineError::InvalidArgument(format!(
                "requested {min_frames} frames exceeds the mapped {}",
                state.spec.mapped_frames
            )));
        }
        let track = Arc::new(MmapTrack::new(session, port, uid, self.format));
        state.spec.tracks.push(Arc::clone(&track));
        Ok((track, state.spec.mapped_frames))
    }

    /// Start the hardware on the first active track. The lifecycle
    /// handshake completes synchronously: the hardware owns the transport,
    /// so there is no serve/deliver wait.
    pub fn start_track(&self, track: &Arc<MmapTrack>) -> EngineResult<()> {
        let mut state = self.base.lock();
        if state.base.busy || state.base.exiting {
            return Err(EngineError::Dead);
        }
        if track.is_invalid() {
            return Err(EngineError::Dead);
        }
        if state.spec.mapped_frames == 0 {
            return Err(EngineError::InvalidState("stream not mapped"));
        }
        if track.state() != TrackState::Active {
            track.state.transition(TrackEvent::Start);
            track.state.transition(TrackEvent::Served);
            track.state.transition(TrackEvent::DataDelivered);
        }
        if !state.spec.hw_running {
            state.spec.stream.start()?;
            state.spec.hw_running = true;
            state.base.standby = false;
        }
        track.set_route_token(state.spec.stream.route_token());

        let was_empty = state.spec.active.is_empty();
        state.spec.active.add(Arc::clone(track));
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

    /// Stop the hardware when the last active track leaves.
    pub fn stop_track(&self, track: &Arc<MmapTrack>) -> EngineResult<()> {
        let mut state = self.base.lock();
        if track.state() == TrackState::Active {
            track.state.transition(TrackEvent::Stop);
            track.state.transition(TrackEvent::BufferExhausted);
            track.state.transition(TrackEvent::PresentationComplete);
        }
        state.spec.active.remove(track);
        if state.spec.active.is_empty() {
            if state.spec.hw_running {
                if let Err(e) = state.spec.stream.stop() {
                    log::warn!("{}: hardware stop failed: {e}", self.base.name());
                }
                state.spec.hw_running = false;
            }
            state.base.standby = true;
            let base = &mut state.base;
            self.base.release_wake_lock(base);
        }
        state
            .spec
            .active
            .update_power(self.base.ctx().power.as_ref(), self.base.name());
        drop(state);
        self.base.wake();
        Ok(())
    }

    pub fn destroy_track(&self, track: &Arc<MmapTrack>) {
        let _ = self.stop_track(track);
        let mut state = self.base.lock();
        state.spec.tracks.retain(|t| !Arc::ptr_eq(t, track));
    }

    pub fn set_track_volume(&self, track: &Arc<MmapTrack>, volume: f32) {
        track.set_volume(volume);
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
        log::info!("{}: mmap loop starting", self.base.name());
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
        log::info!("{}: mmap loop exited", self.base.name());
    }

    /// One pass: events, then the liveness sweep.
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

        self.check_liveness(&mut state);

        if state.spec.active.is_empty() {
            CycleOutcome::Idle(Duration::from_millis(100))
        } else {
            CycleOutcome::Ran(Duration::from_millis(100))
        }
    }

    fn handle_event(
        base: &ThreadBase<MmapState>,
        state: &mut ThreadState<MmapState>,
        event: &ConfigEventKind,
    ) -> EngineResult<()> {
        match event {
            ConfigEventKind::RoutingChanged => {
                // the sweep picks up the token change on this same pass
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
                Err(EngineError::NotSupported("buffer resize on an mmap thread"))
            }
            ConfigEventKind::UpdateLatencyMode(mode) => {
                state.base.latency_mode = *mode;
                Ok(())
            }
        }
    }

    /// Invalidate tracks whose backing route changed since they started.
    fn check_liveness(&self, state: &mut ThreadState<MmapState>) {
        if state.spec.active.is_empty() {
            return;
        }
        let current = state.spec.stream.route_token();
        let stale: Vec<Arc<MmapTrack>> = state
            .spec
            .active
            .iter()
            .filter(|t| t.route_token() != current)
            .cloned()
            .collect();
        for track in stale {
            log::warn!(
                "{}: {} route changed underneath, invalidating",
                self.base.name(),
                track.id()
            );
            track.invalidate();
            state.spec.active.remove(&track);
        }
        if state.spec.active.is_empty() && state.spec.hw_running {
            if let Err(e) = state.spec.stream.stop() {
                log::warn!("{}: hardware stop failed: {e}", self.base.name());
            }
            state.spec.hw_running = false;
            state.base.standby = true;
            let base = &mut state.base;
            self.base.release_wake_lock(base);
        }
    }

    fn teardown(&self, state: &mut ThreadState<MmapState>) {
        for track in state.spec.active.clear() {
            track.invalidate();
        }
        if state.spec.hw_running {
            if let Err(e) = state.spec.stream.stop() {
                log::warn!("{}: hardware stop failed: {e}", self.base.name());
            }
            state.spec.hw_running = false;
        }
        state.base.standby = true;
        let base = &mut state.base;
        self.base.release_wake_lock(base);
        state.spec.tracks.clear();
    }

    pub fn shutdown(&self) {
        self.base.exit();
        let join = match self.join.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(join) = join {
            if join.join().is_err() {
                log::error!("{}: mmap loop panicked", self.base.name());
            }
        } else if !self.running.load(Ordering::Acquire) {
            let _ = self.cycle();
        }
    }
}
