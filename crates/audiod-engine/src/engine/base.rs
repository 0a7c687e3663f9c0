//! Common engine shared by every per-stream control thread
//!
//! [`ThreadBase`] owns the mutex/condvar pair that serializes all mutation
//! of thread-local state, the config-event mailbox, the effect-chain list
//! and the wake-lock lifecycle. Role-specific loops keep their own state in
//! the `S` parameter so one lock covers both halves.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::EngineTuning;
use crate::effect::{take_chain, EffectChain, EffectDesc, InsertionPoint, ThreadRole};
use crate::engine::event::{ConfigEvent, ConfigEventKind, EventHandle};
use crate::error::{EngineError, EngineResult};
use crate::power::{NoopPower, PowerProvider};
use crate::types::{LatencyMode, SessionId};

/// Process-wide capabilities injected into every thread at construction.
pub struct ServerContext {
    pub tuning: EngineTuning,
    pub power: Arc<dyn PowerProvider>,
    /// Taken before any individual thread mutex when an operation spans two
    /// threads (effect-chain handoff); never taken while a thread mutex is
    /// already held.
    pub global_lock: Mutex<()>,
}

impl ServerContext {
    pub fn new(tuning: EngineTuning, power: Arc<dyn PowerProvider>) -> Arc<Self> {
        Arc::new(Self {
            tuning,
            power,
            global_lock: Mutex::new(()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(EngineTuning::default(), Arc::new(NoopPower))
    }
}

/// State guarded by the thread mutex: the common half plus the role half.
pub struct ThreadState<S> {
    pub base: BaseState,
    pub spec: S,
}

/// The common half of every thread's guarded state.
pub struct BaseState {
    pub config_events: VecDeque<ConfigEvent>,
    /// Set once by `exit()`; the loop drains and leaves
    pub exiting: bool,
    /// Set during exit before the final drain; admission paths reject
    pub busy: bool,
    /// Hardware stream is not being driven
    pub standby: bool,
    pub effect_chains: Vec<Arc<EffectChain>>,
    pub wake_lock_held: bool,
    pub latency_mode: LatencyMode,
}

impl BaseState {
    fn new() -> Self {
        Self {
            config_events: VecDeque::new(),
            exiting: false,
            busy: false,
            standby: true,
            effect_chains: Vec::new(),
            wake_lock_held: false,
            latency_mode: LatencyMode::Free,
        }
    }
}

pub struct ThreadBase<S> {
    name: String,
    role: ThreadRole,
    ctx: Arc<ServerContext>,
    state: Mutex<ThreadState<S>>,
    cond: Condvar,
}

impl<S> ThreadBase<S> {
    pub fn new(name: impl Into<String>, role: ThreadRole, ctx: Arc<ServerContext>, spec: S) -> Self {
        Self {
            name: name.into(),
            role,
            ctx,
            state: Mutex::new(ThreadState {
                base: BaseState::new(),
                spec,
            }),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> ThreadRole {
        self.role
    }

    #[inline]
    pub fn ctx(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    #[inline]
    pub fn tuning(&self) -> &EngineTuning {
        &self.ctx.tuning
    }

    /// Take the thread mutex. A poisoned lock means a loop panicked, which
    /// is an invariant violation already underway; keep going so teardown
    /// paths can still run.
    pub fn lock(&self) -> MutexGuard<'_, ThreadState<S>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wake the loop from any suspension point.
    pub fn wake(&self) {
        self.cond.notify_all();
    }

    /// Suspend until woken or `timeout` elapses. Returns the reacquired
    /// guard; the caller re-checks its predicate either way.
    pub fn wait_for_work<'a>(
        &self,
        guard: MutexGuard<'a, ThreadState<S>>,
        timeout: Duration,
    ) -> MutexGuard<'a, ThreadState<S>> {
        match self.cond.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    // ── config events ────────────────────────────────────────────────────

    /// Enqueue a control request and, for synchronous kinds, block until
    /// the loop has processed it or the bounded wait expires.
    pub fn send_config_event(&self, kind: ConfigEventKind) -> EngineResult<()> {
        let timeout = if matches!(kind, ConfigEventKind::CreatePatch { .. }) {
            Duration::from_millis(self.ctx.tuning.patch_event_timeout_ms)
        } else {
            Duration::from_millis(self.ctx.tuning.config_event_timeout_ms)
        };
        let handle = self.post_event(kind)?;
        match handle {
            Some(handle) => handle.wait(timeout),
            None => Ok(()),
        }
    }

    /// Enqueue without waiting. Returns the completion handle for
    /// synchronous kinds.
    pub fn post_event(&self, kind: ConfigEventKind) -> EngineResult<Option<EventHandle>> {
        let mut state = self.lock();
        if state.base.exiting {
            return Err(EngineError::Dead);
        }
        log::debug!("{}: queue config event {}", self.name, kind.name());
        let (event, handle) = ConfigEvent::new(kind);
        state.base.config_events.push_back(event);
        drop(state);
        self.wake();
        Ok(handle)
    }

    /// Drain the mailbox in FIFO order, running `handler` for each event
    /// and completing its waiter. Returns true if anything was processed.
    ///
    /// The mutex stays held across every handler; only priority requests
    /// are fire-and-forget and those carry no waiter to stall.
    pub fn process_config_events<F>(&self, state: &mut ThreadState<S>, mut handler: F) -> bool
    where
        F: FnMut(&mut ThreadState<S>, &ConfigEventKind) -> EngineResult<()>,
    {
        let mut processed = false;
        while let Some(event) = state.base.config_events.pop_front() {
            processed = true;
            let result = handler(state, &event.kind);
            if let Err(e) = &result {
                log::warn!("{}: config event {} failed: {e}", self.name, event.kind.name());
            }
            if let Some(handle) = event.handle {
                handle.complete(result);
            }
        }
        processed
    }

    /// Fail every queued event at exit. A silently dropped event would
    /// strand its waiter until timeout; log each one instead.
    pub fn drain_events_at_exit(&self, state: &mut ThreadState<S>) {
        while let Some(event) = state.base.config_events.pop_front() {
            log::warn!(
                "{}: dropping config event {} at exit",
                self.name,
                event.kind.name()
            );
            if let Some(handle) = event.handle {
                handle.complete(Err(EngineError::Dead));
            }
        }
    }

    /// Begin the exit protocol: reject new admission, wake the loop. The
    /// loop observes `exiting`, finishes in-flight work, drains the mailbox
    /// and returns.
    pub fn exit(&self) {
        {
            let mut state = self.lock();
            state.base.busy = true;
            state.base.exiting = true;
        }
        self.wake();
    }

    pub fn is_exiting(&self) -> bool {
        self.lock().base.exiting
    }

    // ── effect chains ────────────────────────────────────────────────────

    /// Attach an effect, creating the session's chain on first use.
    pub fn create_effect(
        &self,
        session: SessionId,
        point: InsertionPoint,
        desc: EffectDesc,
    ) -> EngineResult<Arc<EffectChain>> {
        let mut state = self.lock();
        if state.base.exiting {
            return Err(EngineError::Dead);
        }
        let chain = match state
            .base
            .effect_chains
            .iter()
            .find(|c| c.session() == session)
        {
            Some(chain) => Arc::clone(chain),
            None => {
                let chain = Arc::new(EffectChain::new(session, point));
                state.base.effect_chains.push(Arc::clone(&chain));
                chain
            }
        };
        chain.add_effect(desc, self.role)?;
        Ok(chain)
    }

    pub fn remove_effect(&self, session: SessionId, name: &str) -> EngineResult<()> {
        let state = self.lock();
        let chain = state
            .base
            .effect_chains
            .iter()
            .find(|c| c.session() == session)
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("no effect chain on session {session:?}"))
            })?;
        chain.remove_effect(name)
    }

    /// Detach a session's chain for handoff to another thread. The caller
    /// holds `ServerContext::global_lock` across the detach/attach pair.
    pub fn detach_effect_chain(&self, session: SessionId) -> Option<Arc<EffectChain>> {
        let mut state = self.lock();
        take_chain(&mut state.base.effect_chains, session)
    }

    pub fn attach_effect_chain(&self, chain: Arc<EffectChain>) {
        let mut state = self.lock();
        state.base.effect_chains.push(chain);
    }

    pub fn effect_chain_for(&self, session: SessionId) -> Option<Arc<EffectChain>> {
        let state = self.lock();
        state
            .base
            .effect_chains
            .iter()
            .find(|c| c.session() == session)
            .cloned()
    }

    // ── wake lock ────────────────────────────────────────────────────────

    /// Acquire on the empty-to-nonempty active transition.
    pub fn acquire_wake_lock(&self, base: &mut BaseState) {
        if !base.wake_lock_held {
            self.ctx.power.acquire(&self.name);
            base.wake_lock_held = true;
        }
    }

    /// Release on standby entry with no active tracks.
    pub fn release_wake_lock(&self, base: &mut BaseState) {
        if base.wake_lock_held {
            self.ctx.power.release(&self.name);
            base.wake_lock_held = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectRole;
    use crate::power::RecordingPower;
    use std::thread;

    fn base() -> ThreadBase<()> {
        ThreadBase::new("test_out", ThreadRole::Playback, ServerContext::with_defaults(), ())
    }

    #[test]
    fn test_event_roundtrip_with_loop_thread() {
        let tb = Arc::new(base());
        let looper = {
            let tb = Arc::clone(&tb);
            thread::spawn(move || {
                loop {
                    let mut state = tb.lock();
                    tb.process_config_events(&mut state, |_, kind| {
                        match kind {
                            ConfigEventKind::SetParameters(kv) if kv == "bad" => {
                                Err(EngineError::InvalidArgument("bad".into()))
                            }
                            _ => Ok(()),
                        }
                    });
                    if state.base.exiting {
                        tb.drain_events_at_exit(&mut state);
                        return;
                    }
                    let _state = tb.wait_for_work(state, Duration::from_millis(50));
                }
            })
        };

        assert!(tb
            .send_config_event(ConfigEventKind::SetParameters("a=b".into()))
            .is_ok());
        assert!(matches!(
            tb.send_config_event(ConfigEventKind::SetParameters("bad".into())),
            Err(EngineError::InvalidArgument(_))
        ));

        tb.exit();
        looper.join().unwrap();
        assert!(matches!(
            tb.send_config_event(ConfigEventKind::RoutingChanged),
            Err(EngineError::Dead)
        ));
    }

    #[test]
    fn test_exit_fails_queued_waiters() {
        let tb = Arc::new(base());
        // no loop running; queue an event, then drain at exit
        let handle = tb
            .post_event(ConfigEventKind::RoutingChanged)
            .unwrap()
            .unwrap();
        {
            let mut state = tb.lock();
            tb.drain_events_at_exit(&mut state);
        }
        assert!(matches!(
            handle.wait(Duration::from_secs(1)),
            Err(EngineError::Dead)
        ));
    }

    #[test]
    fn test_effect_chain_created_on_first_use() {
        let tb = base();
        let desc = EffectDesc { name: "eq".into(), role: EffectRole::Insert };
        let chain = tb
            .create_effect(SessionId(3), InsertionPoint::PostMix, desc)
            .unwrap();
        assert_eq!(chain.effect_count(), 1);
        assert!(tb.effect_chain_for(SessionId(3)).is_some());

        // role gate applies at the attach call
        let pre = EffectDesc { name: "aec".into(), role: EffectRole::PreProcessing };
        assert!(tb.create_effect(SessionId(3), InsertionPoint::PostMix, pre).is_err());
        assert_eq!(chain.effect_count(), 1);
    }

    #[test]
    fn test_chain_handoff_between_threads() {
        let ctx = ServerContext::with_defaults();
        let a: ThreadBase<()> = ThreadBase::new("out_a", ThreadRole::Playback, Arc::clone(&ctx), ());
        let b: ThreadBase<()> = ThreadBase::new("out_b", ThreadRole::Playback, Arc::clone(&ctx), ());
        let desc = EffectDesc { name: "reverb".into(), role: EffectRole::Insert };
        a.create_effect(SessionId(5), InsertionPoint::PreMix, desc).unwrap();

        let _global = ctx.global_lock.lock().unwrap();
        let chain = a.detach_effect_chain(SessionId(5)).unwrap();
        b.attach_effect_chain(chain);
        assert!(a.effect_chain_for(SessionId(5)).is_none());
        assert!(b.effect_chain_for(SessionId(5)).is_some());
    }

    #[test]
    fn test_wake_lock_idempotent() {
        let power = Arc::new(RecordingPower::default());
        let ctx = ServerContext::new(EngineTuning::default(), power.clone());
        let tb: ThreadBase<()> = ThreadBase::new("out", ThreadRole::Playback, ctx, ());
        {
            let mut state = tb.lock();
            tb.acquire_wake_lock(&mut state.base);
            tb.acquire_wake_lock(&mut state.base);
            tb.release_wake_lock(&mut state.base);
            tb.release_wake_lock(&mut state.base);
        }
        assert_eq!(
            *power.events.lock().unwrap(),
            vec!["acquire:out".to_string(), "release:out".to_string()]
        );
    }
}
