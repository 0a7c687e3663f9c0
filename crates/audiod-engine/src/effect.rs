//! Effect chain attachment surface
//!
//! Effect processing itself is an external collaborator; the engine only
//! manages attachment/detachment, buffer insertion points, and per-session
//! track accounting. Chains are owned by the thread that created them but
//! can be reassigned to another thread as devices change; that handoff is
//! serialized by the server-global lock so two thread mutexes are never
//! held at once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, EngineResult};
use crate::types::SessionId;

/// Where in the I/O path a chain's buffers are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionPoint {
    /// Per-session, before the mix (track scratch buffers)
    PreMix,
    /// After the mix, before the hardware write
    PostMix,
    /// Device-global output stage
    DeviceGlobal,
}

/// Effect role, used for thread-role compatibility checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectRole {
    /// Capture pre-processing (AEC, noise suppression); record threads only
    PreProcessing,
    /// Insert effect on the playback path
    Insert,
    /// Output-stage post-processing; playback threads only
    PostProcessing,
}

/// Role of the thread attempting to host an effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Playback,
    Record,
    Mmap,
}

/// Description of one effect requested into a chain
#[derive(Debug, Clone)]
pub struct EffectDesc {
    pub name: String,
    pub role: EffectRole,
}

/// Ordered per-session effect pipeline attached to a thread
pub struct EffectChain {
    session: SessionId,
    point: InsertionPoint,
    effects: Mutex<Vec<EffectDesc>>,
    /// Tracks on this session attached to the owning thread
    track_count: AtomicU32,
    /// Of those, tracks currently in ActiveTracks
    active_track_count: AtomicU32,
    /// Buffers processed through this chain (observability for tests)
    process_count: AtomicU32,
}

impl EffectChain {
    pub fn new(session: SessionId, point: InsertionPoint) -> Self {
        Self {
            session,
            point,
            effects: Mutex::new(Vec::new()),
            track_count: AtomicU32::new(0),
            active_track_count: AtomicU32::new(0),
            process_count: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[inline]
    pub fn insertion_point(&self) -> InsertionPoint {
        self.point
    }

    /// Validate and append an effect. The thread role gate is the caller's
    /// role, not the chain's: pre-processing is rejected on playback
    /// threads, post-processing on record threads.
    pub fn add_effect(&self, desc: EffectDesc, thread_role: ThreadRole) -> EngineResult<()> {
        match (desc.role, thread_role) {
            (EffectRole::PreProcessing, ThreadRole::Playback | ThreadRole::Mmap) => {
                return Err(EngineError::InvalidArgument(format!(
                    "pre-processing effect {} rejected on playback thread",
                    desc.name
                )));
            }
            (EffectRole::PostProcessing, ThreadRole::Record) => {
                return Err(EngineError::InvalidArgument(format!(
                    "post-processing effect {} rejected on record thread",
                    desc.name
                )));
            }
            _ => {}
        }
        self.lock_effects().push(desc);
        Ok(())
    }

    pub fn remove_effect(&self, name: &str) -> EngineResult<()> {
        let mut effects = self.lock_effects();
        let idx = effects
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| EngineError::InvalidArgument(format!("no effect named {name}")))?;
        effects.remove(idx);
        Ok(())
    }

    pub fn effect_count(&self) -> usize {
        self.lock_effects().len()
    }

    fn lock_effects(&self) -> std::sync::MutexGuard<'_, Vec<EffectDesc>> {
        match self.effects.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn inc_track_count(&self) {
        self.track_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_track_count(&self) {
        let prev = self.track_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "effect chain track count underflow");
    }

    pub fn inc_active_track_count(&self) {
        self.active_track_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_track_count(&self) {
        let prev = self.active_track_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "effect chain active track count underflow");
    }

    pub fn track_count(&self) -> u32 {
        self.track_count.load(Ordering::Relaxed)
    }

    pub fn active_track_count(&self) -> u32 {
        self.active_track_count.load(Ordering::Relaxed)
    }

    /// Run the chain over a buffer. Processing is delegated to the external
    /// effect host; here the chain only accounts for the invocation.
    pub fn process(&self, _buffer: &mut [f32]) {
        self.process_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn process_count(&self) -> u32 {
        self.process_count.load(Ordering::Relaxed)
    }
}

/// Move a chain between thread-owned chain lists.
///
/// Must be called with the server-global lock held (see
/// `ServerContext::global_lock`); the caller locks each thread's own mutex
/// one at a time to detach and attach.
pub fn take_chain(chains: &mut Vec<Arc<EffectChain>>, session: SessionId) -> Option<Arc<EffectChain>> {
    let idx = chains.iter().position(|c| c.session() == session)?;
    Some(chains.remove(idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocessing_rejected_on_playback() {
        let chain = EffectChain::new(SessionId(7), InsertionPoint::PreMix);
        let desc = EffectDesc { name: "aec".into(), role: EffectRole::PreProcessing };
        assert!(matches!(
            chain.add_effect(desc, ThreadRole::Playback),
            Err(EngineError::InvalidArgument(_))
        ));
        assert_eq!(chain.effect_count(), 0);
    }

    #[test]
    fn test_insert_accepted_both_roles() {
        let chain = EffectChain::new(SessionId(7), InsertionPoint::PostMix);
        let desc = EffectDesc { name: "eq".into(), role: EffectRole::Insert };
        chain.add_effect(desc.clone(), ThreadRole::Playback).unwrap();
        chain.add_effect(desc, ThreadRole::Record).unwrap();
        assert_eq!(chain.effect_count(), 2);
    }

    #[test]
    fn test_track_counts() {
        let chain = EffectChain::new(SessionId(1), InsertionPoint::PreMix);
        chain.inc_track_count();
        chain.inc_active_track_count();
        assert_eq!(chain.track_count(), 1);
        assert_eq!(chain.active_track_count(), 1);
        chain.dec_active_track_count();
        chain.dec_track_count();
        assert_eq!(chain.track_count(), 0);
    }

    #[test]
    fn test_take_chain() {
        let mut chains = vec![
            Arc::new(EffectChain::new(SessionId(1), InsertionPoint::PreMix)),
            Arc::new(EffectChain::new(SessionId(2), InsertionPoint::PostMix)),
        ];
        let taken = take_chain(&mut chains, SessionId(2)).unwrap();
        assert_eq!(taken.session(), SessionId(2));
        assert_eq!(chains.len(), 1);
        assert!(take_chain(&mut chains, SessionId(9)).is_none());
    }
}
