//! Engine tuning configuration
//!
//! Every empirically tuned policy value of the thread loops lives here:
//! retry counts, standby delay, sleep granularity, config-event deadlines.
//! The values are bounded small multiples of a buffer period on the hardware
//! they were tuned for; treat them as policy, not invariants. A
//! [`EngineTuning`] is injected into each thread at construction - the engine
//! never reads process-global state.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Tuning policy for the thread loops
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    /// Consecutive starved cycles before an active playback track is
    /// disabled and moved to the removal set
    pub max_track_retries: u32,

    /// Starved cycles tolerated while a track is still filling after start
    /// (clients legitimately take a while to prime the buffer)
    pub max_startup_retries: u32,

    /// Extra drain cycles granted to an offloaded track after stop()
    pub max_stop_retries_offload: u32,

    /// Consecutive overrun cycles before a record track is removed
    /// ("BUFFER TIMEOUT")
    pub max_record_retries: u32,

    /// Idle mix periods with no active track before entering standby
    pub standby_delay_periods: u32,

    /// Sleep while underrunning, as a fraction of the mix period
    /// (denominator: sleep = period / underrun_sleep_divisor)
    pub underrun_sleep_divisor: u32,

    /// Bounded wait for a generic blocking config event, in milliseconds
    pub config_event_timeout_ms: u64,

    /// Bounded wait for patch create/release events, in milliseconds
    /// (patch creation talks to the HAL and is allowed to be slow)
    pub patch_event_timeout_ms: u64,

    /// Client buffer depth multiplier applied when a track creation passes
    /// a frame-count hint of zero; clamped to 1..=2
    pub track_depth_multiplier: u32,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            max_track_retries: 8,
            max_startup_retries: 16,
            max_stop_retries_offload: 60,
            max_record_retries: 4,
            standby_delay_periods: 4,
            underrun_sleep_divisor: 2,
            config_event_timeout_ms: 1_000,
            patch_event_timeout_ms: 5_000,
            track_depth_multiplier: 2,
        }
    }
}

impl EngineTuning {
    /// Depth multiplier with the documented clamp applied
    pub fn depth_multiplier(&self) -> u32 {
        self.track_depth_multiplier.clamp(1, 2)
    }
}

/// Load tuning from a YAML file
///
/// Missing or unparsable files fall back to defaults with a warning; a bad
/// config file must never keep the audio server from starting.
pub fn load_tuning(path: &Path) -> EngineTuning {
    load_yaml(path)
}

/// Save tuning to a YAML file, creating parent directories as needed
pub fn save_tuning(tuning: &EngineTuning, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serde_yaml::to_string(tuning)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, yaml)
}

/// Default tuning file location: `~/.config/audiod/engine-tuning.yaml`
pub fn default_tuning_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("audiod")
        .join("engine-tuning.yaml")
}

fn load_yaml<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("load_tuning: {:?} doesn't exist, using defaults", path);
        return T::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<T>(&contents) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("load_tuning: failed to parse {:?}: {}, using defaults", path, e);
                T::default()
            }
        },
        Err(e) => {
            log::warn!("load_tuning: failed to read {:?}: {}, using defaults", path, e);
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_nonexistent_returns_default() {
        let tuning = load_tuning(Path::new("/nonexistent/engine-tuning.yaml"));
        assert_eq!(tuning.max_track_retries, EngineTuning::default().max_track_retries);
    }

    #[test]
    fn test_roundtrip() {
        let dir = std::env::temp_dir().join("audiod-engine-test-config");
        let path = dir.join("engine-tuning.yaml");

        let tuning = EngineTuning { max_track_retries: 3, ..Default::default() };
        save_tuning(&tuning, &path).unwrap();
        let loaded = load_tuning(&path);
        assert_eq!(loaded.max_track_retries, 3);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_depth_multiplier_clamped() {
        let tuning = EngineTuning { track_depth_multiplier: 7, ..Default::default() };
        assert_eq!(tuning.depth_multiplier(), 2);
        let tuning = EngineTuning { track_depth_multiplier: 0, ..Default::default() };
        assert_eq!(tuning.depth_multiplier(), 1);
    }

    #[test]
    fn test_default_path_under_audiod() {
        assert!(default_tuning_path().ends_with("audiod/engine-tuning.yaml"));
    }
}
