//! ActiveTracks - the generation-counted set of tracks being processed
//!
//! Membership means the track has passed admission (playback) or completed
//! its start transition (record). The generation counter is bumped on every
//! add/remove so downstream caches - most importantly the fast-path bridge
//! state - know to resynchronize, and the dirty flag batches metadata
//! re-publication.

use std::sync::Arc;

use crate::power::PowerProvider;
use crate::types::Uid;

/// A track that can live in an [`ActiveTracks`] set
pub trait ActiveTrack {
    fn uid(&self) -> Uid;
}

/// Insertion-ordered set of currently active tracks
pub struct ActiveTracks<T> {
    tracks: Vec<Arc<T>>,
    /// Most recently added track (kept across removal of others)
    latest: Option<Arc<T>>,
    generation: u32,
    has_changed: bool,
}

impl<T> Default for ActiveTracks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ActiveTracks<T> {
    pub fn new() -> Self {
        Self { tracks: Vec::new(), latest: None, generation: 0, has_changed: false }
    }

    /// Add a track; returns false if it was already a member.
    pub fn add(&mut self, track: Arc<T>) -> bool {
        if self.tracks.iter().any(|t| Arc::ptr_eq(t, &track)) {
            return false;
        }
        self.latest = Some(track.clone());
        self.tracks.push(track);
        self.generation = self.generation.wrapping_add(1);
        self.has_changed = true;
        true
    }

    /// Remove a track; returns false if it was not a member.
    pub fn remove(&mut self, track: &Arc<T>) -> bool {
        let Some(idx) = self.tracks.iter().position(|t| Arc::ptr_eq(t, track)) else {
            return false;
        };
        self.tracks.remove(idx);
        self.generation = self.generation.wrapping_add(1);
        self.has_changed = true;
        true
    }

    /// Remove everything, returning the former members for cleanup.
    pub fn clear(&mut self) -> Vec<Arc<T>> {
        if !self.tracks.is_empty() {
            self.generation = self.generation.wrapping_add(1);
            self.has_changed = true;
        }
        self.latest = None;
        std::mem::take(&mut self.tracks)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn contains(&self, track: &Arc<T>) -> bool {
        self.tracks.iter().any(|t| Arc::ptr_eq(t, track))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<T>> {
        self.tracks.iter()
    }

    /// Snapshot of the membership in insertion order
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.tracks.clone()
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn latest(&self) -> Option<&Arc<T>> {
        self.latest.as_ref()
    }

    /// Dirty flag for metadata re-publication; reading clears it.
    pub fn read_and_clear_has_changed(&mut self) -> bool {
        std::mem::take(&mut self.has_changed)
    }

    pub fn set_has_changed(&mut self) {
        self.has_changed = true;
    }
}

impl<T: ActiveTrack> ActiveTracks<T> {
    /// Push the current member uid set to the wake-lock provider.
    ///
    /// Invariant from the wake-lock lifecycle: the lock's attributed uids
    /// always mirror ActiveTracks membership.
    pub fn update_power(&self, power: &dyn PowerProvider, tag: &str) {
        let mut uids: Vec<Uid> = self.tracks.iter().map(|t| t.uid()).collect();
        uids.sort_unstable();
        uids.dedup();
        power.set_uids(tag, &uids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::RecordingPower;

    struct Fake(Uid);
    impl ActiveTrack for Fake {
        fn uid(&self) -> Uid {
            self.0
        }
    }

    #[test]
    fn test_generation_bumps_on_membership_change() {
        let mut set: ActiveTracks<Fake> = ActiveTracks::new();
        let a = Arc::new(Fake(Uid(1)));
        let gen0 = set.generation();

        assert!(set.add(a.clone()));
        assert_ne!(set.generation(), gen0);
        let gen1 = set.generation();

        // double add is rejected and doesn't bump
        assert!(!set.add(a.clone()));
        assert_eq!(set.generation(), gen1);

        assert!(set.remove(&a));
        assert_ne!(set.generation(), gen1);
        assert!(!set.remove(&a));
    }

    #[test]
    fn test_latest_survives_other_removal() {
        let mut set: ActiveTracks<Fake> = ActiveTracks::new();
        let a = Arc::new(Fake(Uid(1)));
        let b = Arc::new(Fake(Uid(2)));
        set.add(a.clone());
        set.add(b.clone());
        set.remove(&a);
        assert!(Arc::ptr_eq(set.latest().unwrap(), &b));
    }

    #[test]
    fn test_dirty_flag() {
        let mut set: ActiveTracks<Fake> = ActiveTracks::new();
        assert!(!set.read_and_clear_has_changed());
        set.add(Arc::new(Fake(Uid(1))));
        assert!(set.read_and_clear_has_changed());
        assert!(!set.read_and_clear_has_changed());
    }

    #[test]
    fn test_power_uid_sync() {
        let mut set: ActiveTracks<Fake> = ActiveTracks::new();
        set.add(Arc::new(Fake(Uid(10))));
        set.add(Arc::new(Fake(Uid(5))));
        set.add(Arc::new(Fake(Uid(10))));

        let power = RecordingPower::default();
        set.update_power(&power, "out");
        let events = power.events.lock().unwrap();
        assert_eq!(events.as_slice(), ["uids:out:[5, 10]"]);
    }
}
