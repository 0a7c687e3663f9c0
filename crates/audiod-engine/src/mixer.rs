//! Mixer collaborator seam
//!
//! The DSP mixing algorithm (summation, resampling, gain curves) is not part
//! of the thread engine; the playback loop hands the ready tracks' frames to
//! a [`Mixer`] implementation supplied at thread construction.
//! [`SummingMixer`] is the minimal implementation used by default and by the
//! engine tests.

/// One ready track's contribution for a mix cycle
pub struct MixInput<'a> {
    /// Frames pulled from the track ring this cycle (may be shorter than the
    /// mix period on partial underrun; the tail is treated as silence)
    pub samples: &'a [f32],
    /// Linear gain applied by the mixer
    pub volume: f32,
}

/// External mixing collaborator invoked once per loop iteration
pub trait Mixer: Send {
    /// Mix `inputs` into `out`. `out` arrives zeroed; an empty input set
    /// must leave it silent.
    fn mix(&mut self, inputs: &[MixInput<'_>], out: &mut [f32]);
}

/// Plain summing mixer with per-track gain
#[derive(Default)]
pub struct SummingMixer;

impl Mixer for SummingMixer {
    fn mix(&mut self, inputs: &[MixInput<'_>], out: &mut [f32]) {
        for input in inputs {
            for (dst, &src) in out.iter_mut().zip(input.samples.iter()) {
                *dst += src * input.volume;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summing_mixer() {
        let mut mixer = SummingMixer;
        let a = [1.0f32, 1.0, 1.0, 1.0];
        let b = [0.5f32, 0.5];
        let mut out = [0.0f32; 4];
        mixer.mix(
            &[
                MixInput { samples: &a, volume: 1.0 },
                MixInput { samples: &b, volume: 2.0 },
            ],
            &mut out,
        );
        assert_eq!(out, [2.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_empty_mix_is_silent() {
        let mut mixer = SummingMixer;
        let mut out = [0.0f32; 8];
        mixer.mix(&[], &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }
}
