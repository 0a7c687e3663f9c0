//! Common types for the audiod thread engine
//!
//! Fundamental identifiers and stream geometry shared by every thread
//! family: track/session/port ids, sample formats, and channel masks.

use std::sync::atomic::{AtomicU32, Ordering};

/// Default sample rate (48kHz - standard rate for system audio paths)
/// This is the default; the actual rate comes from the hardware stream.
pub const SAMPLE_RATE: u32 = 48000;

/// Audio sample type used on the mix path (hardware formats are converted at
/// the HAL boundary)
pub type Sample = f32;

/// Number of fast-track slots in the fast-path bridge state.
///
/// One slot is a fixed index into the bridge's track table; a fast track
/// occupies exactly one slot for its whole active life.
pub const FAST_TRACK_SLOTS: usize = 8;

/// Sample formats understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    /// 16-bit signed PCM
    Pcm16,
    /// 24-bit signed PCM packed in 32 bits
    Pcm24In32,
    /// 32-bit float PCM (native mix format)
    PcmF32,
}

impl AudioFormat {
    /// Bytes per sample for one channel
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioFormat::Pcm16 => 2,
            AudioFormat::Pcm24In32 | AudioFormat::PcmF32 => 4,
        }
    }

    /// Whether the format is linear PCM (everything the mix loop handles is;
    /// compressed offload formats are opaque to the engine)
    pub fn is_linear_pcm(&self) -> bool {
        true
    }
}

/// Channel mask, reduced to a validated channel count
///
/// The engine never inspects individual channel positions; it only needs the
/// count for frame-size arithmetic, so the mask collapses to a count here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelMask(u32);

impl ChannelMask {
    pub const MONO: ChannelMask = ChannelMask(1);
    pub const STEREO: ChannelMask = ChannelMask(2);

    /// Build a mask from a raw channel count (1..=8)
    pub fn from_count(count: u32) -> Option<Self> {
        (1..=8).contains(&count).then_some(ChannelMask(count))
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.0
    }
}

/// Geometry of one PCM stream: rate, format, channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channel_mask: ChannelMask,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, format: AudioFormat, channel_mask: ChannelMask) -> Self {
        Self { sample_rate, format, channel_mask }
    }

    /// Size of one frame in bytes (all channels of one sample instant)
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channel_mask.count() as usize
    }

    /// Size of one mix-path frame in f32 samples
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channel_mask.count() as usize
    }
}

/// Unique track id, allocated process-wide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl TrackId {
    /// Allocate the next track id
    pub fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        TrackId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// Audio session id grouping tracks and effect chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub i32);

/// Audio-policy port handle for a track endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub i32);

impl PortId {
    pub const NONE: PortId = PortId(0);
}

/// Index of a fast-track slot in the bridge state table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FastSlot(pub usize);

/// Client uid, tracked for wake-lock attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u32);

/// Output latency mode requested through the config-event surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMode {
    Free,
    Low,
}

/// Interleaved f32 samples to a stream's wire format, appended to `out`.
pub fn encode_frames(format: StreamFormat, samples: &[f32], out: &mut Vec<u8>) {
    match format.format {
        AudioFormat::PcmF32 => {
            out.extend_from_slice(bytemuck::cast_slice(samples));
        }
        AudioFormat::Pcm16 => {
            for s in samples {
                let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        AudioFormat::Pcm24In32 => {
            for s in samples {
                let v = (s.clamp(-1.0, 1.0) * 8_388_607.0) as i32;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}

/// Wire-format bytes to interleaved f32 samples. Returns the frames
/// decoded. Byte slices carry no alignment guarantee, so every sample goes
/// through a fixed-size copy.
pub fn decode_frames(format: StreamFormat, bytes: &[u8], out: &mut [f32]) -> usize {
    let spf = format.samples_per_frame();
    let written = match format.format {
        AudioFormat::PcmF32 => {
            let n = (bytes.len() / 4).min(out.len());
            for (sample, raw) in out.iter_mut().zip(bytes.chunks_exact(4)).take(n) {
                *sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            }
            n
        }
        AudioFormat::Pcm16 => {
            let n = (bytes.len() / 2).min(out.len());
            for (sample, raw) in out.iter_mut().zip(bytes.chunks_exact(2)).take(n) {
                *sample = i16::from_le_bytes([raw[0], raw[1]]) as f32 / i16::MAX as f32;
            }
            n
        }
        AudioFormat::Pcm24In32 => {
            let n = (bytes.len() / 4).min(out.len());
            for (sample, raw) in out.iter_mut().zip(bytes.chunks_exact(4)).take(n) {
                *sample =
                    i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f32 / 8_388_607.0;
            }
            n
        }
    };
    written / spf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let fmt = StreamFormat::new(48000, AudioFormat::Pcm16, ChannelMask::STEREO);
        assert_eq!(fmt.frame_size(), 4);

        let fmt = StreamFormat::new(48000, AudioFormat::PcmF32, ChannelMask::STEREO);
        assert_eq!(fmt.frame_size(), 8);
    }

    #[test]
    fn test_channel_mask_bounds() {
        assert!(ChannelMask::from_count(0).is_none());
        assert!(ChannelMask::from_count(9).is_none());
        assert_eq!(ChannelMask::from_count(2), Some(ChannelMask::STEREO));
    }

    #[test]
    fn test_track_ids_unique() {
        let a = TrackId::next();
        let b = TrackId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_pcm16_wire_format() {
        let fmt = StreamFormat::new(48000, AudioFormat::Pcm16, ChannelMask::STEREO);
        let mut bytes = Vec::new();
        encode_frames(fmt, &[1.0, -1.0, 0.0, 0.5], &mut bytes);
        // two bytes per sample on the wire, not four
        assert_eq!(bytes.len(), 8);

        let mut back = [0.0f32; 4];
        assert_eq!(decode_frames(fmt, &bytes, &mut back), 2);
        assert!((back[0] - 1.0).abs() < 1e-3);
        assert!((back[1] + 1.0).abs() < 1e-3);
        assert!((back[3] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_decode_tolerates_unaligned_bytes() {
        let fmt = StreamFormat::new(48000, AudioFormat::PcmF32, ChannelMask::MONO);
        let mut bytes = vec![0u8];
        encode_frames(fmt, &[0.75, -0.25], &mut bytes);
        let mut back = [0.0f32; 2];
        // decoding from an odd offset must not assume f32 alignment
        assert_eq!(decode_frames(fmt, &bytes[1..], &mut back), 2);
        assert_eq!(back, [0.75, -0.25]);
    }
}
