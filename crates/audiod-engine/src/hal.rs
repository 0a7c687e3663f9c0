//! Hardware stream interface
//!
//! The HAL is an external collaborator: the engine drives these traits and
//! treats any `Err` as a hard I/O error (forces standby) and any short `Ok`
//! count as partial progress to be retried with the remaining bytes on the
//! next cycle.
//!
//! `sim` provides in-process simulated streams used by the integration
//! tests to observe exactly what the thread loops do to the hardware.

use std::time::Instant;

use crate::error::{EngineError, EngineResult};
use crate::types::StreamFormat;

/// Hardware frame position and the time it was sampled
#[derive(Debug, Clone, Copy)]
pub struct PresentationPosition {
    /// Frames presented by the DAC / captured by the ADC since the stream
    /// left standby
    pub frames: u64,
    /// When the position was observed
    pub at: Instant,
}

/// One hardware output stream
pub trait StreamOut: Send + Sync {
    fn format(&self) -> StreamFormat;

    /// Hardware period in frames; one loop iteration produces this much
    fn frame_count(&self) -> usize;

    /// Write bytes; a short count is partial progress, not an error
    fn write(&self, data: &[u8]) -> EngineResult<usize>;

    /// Stop driving the hardware; next write implicitly restarts it
    fn standby(&self) -> EngineResult<()>;

    /// Ask the hardware to drain buffered data. `early` requests a partial
    /// drain that leaves room for a low-latency resume.
    fn drain(&self, _early: bool) -> EngineResult<()> {
        Err(EngineError::NotSupported("drain"))
    }

    fn pause(&self) -> EngineResult<()> {
        Err(EngineError::NotSupported("pause"))
    }

    fn resume(&self) -> EngineResult<()> {
        Err(EngineError::NotSupported("resume"))
    }

    /// Discard everything buffered in hardware
    fn flush(&self) -> EngineResult<()> {
        Err(EngineError::NotSupported("flush"))
    }

    /// Whether pause/resume/flush are real operations on this stream
    fn supports_pause(&self) -> bool {
        false
    }

    /// One-way output latency in frames
    fn latency_frames(&self) -> u32;

    fn presentation_position(&self) -> EngineResult<PresentationPosition>;
}

/// One hardware input stream
pub trait StreamIn: Send + Sync {
    fn format(&self) -> StreamFormat;

    /// Hardware period in frames; one loop iteration consumes this much
    fn frame_count(&self) -> usize;

    /// Read bytes; a short count is partial progress, not an error
    fn read(&self, data: &mut [u8]) -> EngineResult<usize>;

    fn standby(&self) -> EngineResult<()>;

    /// Capture-side position (frames captured since leaving standby)
    fn capture_position(&self) -> EngineResult<PresentationPosition>;
}

/// A stream whose buffer is mapped directly into the client
///
/// Mmap threads bypass the mix loop: after `create_mmap_buffer` the
/// hardware buffer is the only buffer, and the engine thread only does
/// bookkeeping.
pub trait MmapStream: Send + Sync {
    fn format(&self) -> StreamFormat;

    /// Allocate/describe the shared region; returns the actual frame count
    fn create_mmap_buffer(&self, min_frames: usize) -> EngineResult<usize>;

    fn start(&self) -> EngineResult<()>;

    fn stop(&self) -> EngineResult<()>;

    /// Opaque token identifying the current backing route; a change means
    /// existing mmap tracks are silently broken and must be invalidated
    fn route_token(&self) -> u64;
}

pub mod sim {
    //! Simulated streams for tests
    //!
    //! Every hardware call is counted so tests can assert loop behavior:
    //! writes per cycle, standby entries, pause/flush ordering.

    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    use super::{MmapStream, PresentationPosition, StreamIn, StreamOut};
    use crate::error::{EngineError, EngineResult};
    use crate::types::{AudioFormat, ChannelMask, StreamFormat};

    /// Simulated output stream
    pub struct SimOutputStream {
        format: StreamFormat,
        frame_count: usize,
        supports_pause: bool,
        /// Total frames "presented"
        presented: AtomicU64,
        /// Write sizes in bytes, in call order
        pub writes: Mutex<Vec<usize>>,
        /// Accepted payload of the most recent non-silent write
        pub last_write: Mutex<Vec<u8>>,
        /// Writes whose payload was entirely zero
        pub silent_writes: AtomicU32,
        pub standby_calls: AtomicU32,
        pub pause_calls: AtomicU32,
        pub resume_calls: AtomicU32,
        pub flush_calls: AtomicU32,
        pub drain_calls: AtomicU32,
        /// Hardware op order, for pause-before-flush assertions
        pub ops: Mutex<Vec<&'static str>>,
        /// Fail the next N writes with a hardware error
        pub fail_writes: AtomicU32,
        /// If nonzero, accept at most this many bytes per write
        pub short_write_bytes: AtomicUsize,
        /// Set while the stream is in standby
        in_standby: AtomicBool,
    }

    impl SimOutputStream {
        pub fn new(frame_count: usize) -> Self {
            Self {
                format: StreamFormat::new(48000, AudioFormat::PcmF32, ChannelMask::STEREO),
                frame_count,
                supports_pause: false,
                presented: AtomicU64::new(0),
                writes: Mutex::new(Vec::new()),
                last_write: Mutex::new(Vec::new()),
                silent_writes: AtomicU32::new(0),
                standby_calls: AtomicU32::new(0),
                pause_calls: AtomicU32::new(0),
                resume_calls: AtomicU32::new(0),
                flush_calls: AtomicU32::new(0),
                drain_calls: AtomicU32::new(0),
                ops: Mutex::new(Vec::new()),
                fail_writes: AtomicU32::new(0),
                short_write_bytes: AtomicUsize::new(0),
                in_standby: AtomicBool::new(true),
            }
        }

        /// Direct/offload flavored stream with pause/resume/flush support
        pub fn with_pause_support(frame_count: usize) -> Self {
            Self { supports_pause: true, ..Self::new(frame_count) }
        }

        pub fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        pub fn in_standby(&self) -> bool {
            self.in_standby.load(Ordering::Relaxed)
        }
    }

    impl StreamOut for SimOutputStream {
        fn format(&self) -> StreamFormat {
            self.format
        }

        fn frame_count(&self) -> usize {
            self.frame_count
        }

        fn write(&self, data: &[u8]) -> EngineResult<usize> {
            if self.fail_writes.load(Ordering::Relaxed) > 0 {
                self.fail_writes.fetch_sub(1, Ordering::Relaxed);
                return Err(EngineError::Hardware("simulated write failure".into()));
            }
            self.in_standby.store(false, Ordering::Relaxed);

            let mut accepted = data.len();
            let cap = self.short_write_bytes.load(Ordering::Relaxed);
            if cap != 0 {
                accepted = accepted.min(cap);
            }

            if data[..accepted].iter().all(|&b| b == 0) {
                self.silent_writes.fetch_add(1, Ordering::Relaxed);
            } else {
                *self.last_write.lock().unwrap() = data[..accepted].to_vec();
            }
            self.writes.lock().unwrap().push(accepted);
            self.ops.lock().unwrap().push("write");
            self.presented
                .fetch_add((accepted / self.format.frame_size()) as u64, Ordering::Relaxed);
            Ok(accepted)
        }

        fn standby(&self) -> EngineResult<()> {
            self.in_standby.store(true, Ordering::Relaxed);
            self.standby_calls.fetch_add(1, Ordering::Relaxed);
            self.ops.lock().unwrap().push("standby");
            Ok(())
        }

        fn drain(&self, _early: bool) -> EngineResult<()> {
            if !self.supports_pause {
                return Err(EngineError::NotSupported("drain"));
            }
            self.drain_calls.fetch_add(1, Ordering::Relaxed);
            self.ops.lock().unwrap().push("drain");
            Ok(())
        }

        fn pause(&self) -> EngineResult<()> {
            if !self.supports_pause {
                return Err(EngineError::NotSupported("pause"));
            }
            self.pause_calls.fetch_add(1, Ordering::Relaxed);
            self.ops.lock().unwrap().push("pause");
            Ok(())
        }

        fn resume(&self) -> EngineResult<()> {
            if !self.supports_pause {
                return Err(EngineError::NotSupported("resume"));
            }
            self.resume_calls.fetch_add(1, Ordering::Relaxed);
            self.ops.lock().unwrap().push("resume");
            Ok(())
        }

        fn flush(&self) -> EngineResult<()> {
            if !self.supports_pause {
                return Err(EngineError::NotSupported("flush"));
            }
            self.flush_calls.fetch_add(1, Ordering::Relaxed);
            self.ops.lock().unwrap().push("flush");
            Ok(())
        }

        fn supports_pause(&self) -> bool {
            self.supports_pause
        }

        fn latency_frames(&self) -> u32 {
            (self.frame_count * 2) as u32
        }

        fn presentation_position(&self) -> EngineResult<PresentationPosition> {
            Ok(PresentationPosition {
                frames: self.presented.load(Ordering::Relaxed),
                at: Instant::now(),
            })
        }
    }

    /// Simulated input stream producing a repeating ramp
    pub struct SimInputStream {
        format: StreamFormat,
        frame_count: usize,
        captured: AtomicU64,
        pub read_calls: AtomicU32,
        pub standby_calls: AtomicU32,
        in_standby: AtomicBool,
    }

    impl SimInputStream {
        pub fn new(frame_count: usize) -> Self {
            Self {
                format: StreamFormat::new(48000, AudioFormat::PcmF32, ChannelMask::STEREO),
                frame_count,
                captured: AtomicU64::new(0),
                read_calls: AtomicU32::new(0),
                standby_calls: AtomicU32::new(0),
                in_standby: AtomicBool::new(true),
            }
        }

        pub fn read_count(&self) -> u32 {
            self.read_calls.load(Ordering::Relaxed)
        }

        pub fn in_standby(&self) -> bool {
            self.in_standby.load(Ordering::Relaxed)
        }
    }

    impl StreamIn for SimInputStream {
        fn format(&self) -> StreamFormat {
            self.format
        }

        fn frame_count(&self) -> usize {
            self.frame_count
        }

        fn read(&self, data: &mut [u8]) -> EngineResult<usize> {
            self.in_standby.store(false, Ordering::Relaxed);
            self.read_calls.fetch_add(1, Ordering::Relaxed);

            let base = self.captured.load(Ordering::Relaxed);
            for (i, chunk) in data.chunks_exact_mut(4).enumerate() {
                // ramp keyed on absolute frame index so tests can check
                // continuity across reads; byte-wise so the caller may
                // hand over an unaligned buffer
                let s = ((base as usize + i) % 997) as f32 / 997.0;
                chunk.copy_from_slice(&s.to_le_bytes());
            }
            self.captured
                .fetch_add((data.len() / self.format.frame_size()) as u64, Ordering::Relaxed);
            Ok(data.len())
        }

        fn standby(&self) -> EngineResult<()> {
            self.in_standby.store(true, Ordering::Relaxed);
            self.standby_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn capture_position(&self) -> EngineResult<PresentationPosition> {
            Ok(PresentationPosition {
                frames: self.captured.load(Ordering::Relaxed),
                at: Instant::now(),
            })
        }
    }

    /// Simulated memory-mapped stream
    pub struct SimMmapStream {
        format: StreamFormat,
        hw_frames: usize,
        mapped: AtomicBool,
        running: AtomicBool,
        route: AtomicU64,
        pub start_calls: AtomicU32,
        pub stop_calls: AtomicU32,
    }

    impl SimMmapStream {
        pub fn new(hw_frames: usize) -> Self {
            Self {
                format: StreamFormat::new(48000, AudioFormat::PcmF32, ChannelMask::STEREO),
                hw_frames,
                mapped: AtomicBool::new(false),
                running: AtomicBool::new(false),
                route: AtomicU64::new(1),
                start_calls: AtomicU32::new(0),
                stop_calls: AtomicU32::new(0),
            }
        }

        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::Relaxed)
        }

        /// Simulate the platform silently rebuilding the route.
        pub fn rotate_route(&self) {
            self.route.fetch_add(1, Ordering::Relaxed);
        }
    }

    impl MmapStream for SimMmapStream {
        fn format(&self) -> StreamFormat {
            self.format
        }

        fn create_mmap_buffer(&self, min_frames: usize) -> EngineResult<usize> {
            if min_frames > self.hw_frames {
                return Err(EngineError::InvalidArgument(format!(
                    "requested {min_frames} frames, hardware has {}",
                    self.hw_frames
                )));
            }
            self.mapped.store(true, Ordering::Relaxed);
            Ok(self.hw_frames)
        }

        fn start(&self) -> EngineResult<()> {
            if !self.mapped.load(Ordering::Relaxed) {
                return Err(EngineError::Hardware("start before map".into()));
            }
            self.running.store(true, Ordering::Relaxed);
            self.start_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn stop(&self) -> EngineResult<()> {
            self.running.store(false, Ordering::Relaxed);
            self.stop_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn route_token(&self) -> u64 {
            self.route.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::*;
    use super::*;

    #[test]
    fn test_sim_output_counts_writes() {
        let out = SimOutputStream::new(256);
        let bytes = vec![0u8; 256 * out.format().frame_size()];
        assert_eq!(out.write(&bytes).unwrap(), bytes.len());
        assert_eq!(out.write_count(), 1);
        assert_eq!(out.silent_writes.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(!out.in_standby());
        out.standby().unwrap();
        assert!(out.in_standby());
    }

    #[test]
    fn test_sim_output_short_write() {
        let out = SimOutputStream::new(256);
        out.short_write_bytes.store(64, std::sync::atomic::Ordering::Relaxed);
        let bytes = vec![1u8; 512];
        assert_eq!(out.write(&bytes).unwrap(), 64);
    }

    #[test]
    fn test_sim_input_advances_position() {
        let input = SimInputStream::new(128);
        let mut buf = vec![0u8; 128 * input.format().frame_size()];
        input.read(&mut buf).unwrap();
        input.read(&mut buf).unwrap();
        assert_eq!(input.capture_position().unwrap().frames, 256);
    }
}
