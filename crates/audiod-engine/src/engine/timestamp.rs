//! Server/kernel frame-time mapping with jitter and discontinuity tracking

use std::time::Instant;

use crate::hal::PresentationPosition;

/// Tolerated deviation between observed and nominal rate before a sample
/// is rejected as jitter (fraction of nominal).
const JITTER_TOLERANCE: f64 = 0.1;

/// Maps hardware ("kernel") frame position/time to the loop's own
/// ("server") frame position/time.
///
/// Positions are monotonic except across an explicit `discontinuity()`,
/// recorded at standby entry and flush.
pub struct ThreadTimestamp {
    sample_rate: u32,
    /// Frames handed to the hardware stream by the loop
    server_frames: u64,
    /// Last accepted hardware presentation sample
    kernel: Option<PresentationPosition>,
    /// Offset added to raw kernel positions so they stay monotonic across
    /// discontinuities
    kernel_base: u64,
    /// Raw kernel position at the last discontinuity
    kernel_raw_at_reset: u64,
    pending_discontinuity: bool,
    rejected: u64,
}

impl ThreadTimestamp {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            server_frames: 0,
            kernel: None,
            kernel_base: 0,
            kernel_raw_at_reset: 0,
            pending_discontinuity: false,
            rejected: 0,
        }
    }

    #[inline]
    pub fn server_frames(&self) -> u64 {
        self.server_frames
    }

    pub fn advance_server(&mut self, frames: u64) {
        self.server_frames += frames;
    }

    /// Mark a position break (standby entry, flush). The next kernel sample
    /// re-bases instead of being jitter-checked against the previous one.
    pub fn discontinuity(&mut self) {
        self.pending_discontinuity = true;
    }

    /// Feed a hardware presentation sample. Returns false when the sample
    /// was rejected (non-monotonic raw position or rate jitter).
    pub fn update_kernel(&mut self, raw: PresentationPosition) -> bool {
        if self.pending_discontinuity {
            // hardware may have reset its counter; re-base so the corrected
            // position stays monotonic
            if let Some(prev) = &self.kernel {
                self.kernel_base = prev.frames;
            }
            self.kernel_raw_at_reset = raw.frames;
            self.pending_discontinuity = false;
            self.kernel = Some(PresentationPosition {
                frames: self.kernel_base,
                at: raw.at,
            });
            return true;
        }

        let corrected = match raw.frames.checked_sub(self.kernel_raw_at_reset) {
            Some(delta) => self.kernel_base + delta,
            None => {
                self.rejected += 1;
                return false;
            }
        };

        if let Some(prev) = &self.kernel {
            if corrected < prev.frames || raw.at < prev.at {
                self.rejected += 1;
                return false;
            }
            let elapsed = raw.at.duration_since(prev.at).as_secs_f64();
            if elapsed > 0.0 {
                let observed = (corrected - prev.frames) as f64 / elapsed;
                let nominal = self.sample_rate as f64;
                if (observed - nominal).abs() > nominal * JITTER_TOLERANCE {
                    self.rejected += 1;
                    return false;
                }
            }
        }
        self.kernel = Some(PresentationPosition {
            frames: corrected,
            at: raw.at,
        });
        true
    }

    /// Corrected kernel frame position, if any sample has been accepted.
    pub fn kernel_frames(&self) -> Option<u64> {
        self.kernel.as_ref().map(|k| k.frames)
    }

    pub fn kernel_time(&self) -> Option<Instant> {
        self.kernel.as_ref().map(|k| k.at)
    }

    /// Frames written but not yet presented; the pipeline depth estimate.
    pub fn pending_frames(&self) -> u64 {
        match self.kernel_frames() {
            Some(k) => self.server_frames.saturating_sub(k),
            None => self.server_frames,
        }
    }

    pub fn rejected_samples(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pos(frames: u64, at: Instant) -> PresentationPosition {
        PresentationPosition { frames, at }
    }

    #[test]
    fn test_monotonic_accept() {
        let mut ts = ThreadTimestamp::new(48000);
        let t0 = Instant::now();
        ts.discontinuity();
        assert!(ts.update_kernel(pos(0, t0)));
        assert!(ts.update_kernel(pos(4800, t0 + Duration::from_millis(100))));
        assert_eq!(ts.kernel_frames(), Some(4800));
        assert_eq!(ts.rejected_samples(), 0);
    }

    #[test]
    fn test_jitter_rejected() {
        let mut ts = ThreadTimestamp::new(48000);
        let t0 = Instant::now();
        ts.discontinuity();
        assert!(ts.update_kernel(pos(0, t0)));
        // 48000 frames in 100ms is 10x nominal
        assert!(!ts.update_kernel(pos(48000, t0 + Duration::from_millis(100))));
        assert_eq!(ts.kernel_frames(), Some(0));
        assert_eq!(ts.rejected_samples(), 1);
    }

    #[test]
    fn test_discontinuity_rebases_counter_reset() {
        let mut ts = ThreadTimestamp::new(48000);
        let t0 = Instant::now();
        ts.discontinuity();
        assert!(ts.update_kernel(pos(1000, t0)));
        assert!(ts.update_kernel(pos(5800, t0 + Duration::from_millis(100))));
        assert_eq!(ts.kernel_frames(), Some(4800));

        // hardware resets its counter across standby
        ts.discontinuity();
        assert!(ts.update_kernel(pos(0, t0 + Duration::from_millis(500))));
        // corrected position did not go backwards
        assert_eq!(ts.kernel_frames(), Some(4800));
        assert!(ts.update_kernel(pos(480, t0 + Duration::from_millis(510))));
        assert_eq!(ts.kernel_frames(), Some(5280));
    }

    #[test]
    fn test_pending_frames() {
        let mut ts = ThreadTimestamp::new(48000);
        let t0 = Instant::now();
        ts.advance_server(2048);
        assert_eq!(ts.pending_frames(), 2048);
        ts.discontinuity();
        assert!(ts.update_kernel(pos(1024, t0)));
        // first post-discontinuity sample re-bases to the previous corrected
        // position (zero here)
        ts.advance_server(0);
        assert!(ts.update_kernel(pos(1536, t0 + Duration::from_millis(10))));
        assert_eq!(ts.pending_frames(), 2048 - 512);
    }
}
