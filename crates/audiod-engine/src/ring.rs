//! Shared frame rings
//!
//! [`FrameRing`] is the client/server track buffer: a single producer and a
//! single consumer on different threads, linked by atomic frame cursors.
//! Which side produces depends on the stream direction (client writes for
//! playback, the engine writes for capture); the consumer role can migrate
//! between the control thread and the fast-path thread, but the protocol
//! guarantees only one consumer touches the ring at a time (fast-track
//! removal blocks until the bridge acks).
//!
//! [`HistoryRing`] is the capture thread's hardware-side ring: written only
//! by the record loop, read through per-track cursors that the loop itself
//! advances. A cursor that falls more than one capacity behind is clamped
//! forward - the slow client loses its oldest unread frames ("overrun")
//! while other cursors into the same ring are unaffected.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// SPSC ring of audio frames with absolute (never wrapping) cursors
///
/// `rear` counts frames ever written, `front` frames ever consumed;
/// `front <= rear <= front + capacity` always holds.
pub struct FrameRing {
    frames: usize,
    samples_per_frame: usize,
    data: UnsafeCell<Box<[f32]>>,
    rear: AtomicU64,
    front: AtomicU64,
}

// Safety: the producer only writes sample indices derived from
// [rear, front + capacity) and the consumer only reads from [front, rear);
// cursor publication uses Release stores matched by Acquire loads, so the
// regions never overlap between threads.
unsafe impl Sync for FrameRing {}
unsafe impl Send for FrameRing {}

impl FrameRing {
    pub fn new(frames: usize, samples_per_frame: usize) -> Self {
        assert!(frames > 0 && samples_per_frame > 0);
        Self {
            frames,
            samples_per_frame,
            data: UnsafeCell::new(vec![0.0; frames * samples_per_frame].into_boxed_slice()),
            rear: AtomicU64::new(0),
            front: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Frames available to the consumer
    #[inline]
    pub fn frames_ready(&self) -> usize {
        let rear = self.rear.load(Ordering::Acquire);
        let front = self.front.load(Ordering::Acquire);
        (rear - front) as usize
    }

    /// Frames the producer may still write
    #[inline]
    pub fn frames_free(&self) -> usize {
        self.frames - self.frames_ready()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn samples(&self) -> &mut [f32] {
        &mut *self.data.get()
    }

    /// Producer side: append frames, returning how many were accepted
    pub fn write_frames(&self, input: &[f32]) -> usize {
        let want = input.len() / self.samples_per_frame;
        let n = want.min(self.frames_free());
        if n == 0 {
            return 0;
        }
        let rear = self.rear.load(Ordering::Relaxed);
        self.copy_in(rear, &input[..n * self.samples_per_frame]);
        self.rear.store(rear + n as u64, Ordering::Release);
        n
    }

    /// Consumer side: pop up to `out.len() / samples_per_frame` frames
    pub fn read_frames(&self, out: &mut [f32]) -> usize {
        let want = out.len() / self.samples_per_frame;
        let n = want.min(self.frames_ready());
        if n == 0 {
            return 0;
        }
        let front = self.front.load(Ordering::Relaxed);
        self.copy_out(front, &mut out[..n * self.samples_per_frame]);
        self.front.store(front + n as u64, Ordering::Release);
        n
    }

    /// Consumer side: discard everything currently buffered
    pub fn flush(&self) {
        let rear = self.rear.load(Ordering::Acquire);
        self.front.store(rear, Ordering::Release);
    }

    /// Total frames ever consumed (for frame-position mapping)
    #[inline]
    pub fn frames_consumed(&self) -> u64 {
        self.front.load(Ordering::Acquire)
    }

    /// Total frames ever written
    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.rear.load(Ordering::Acquire)
    }

    fn copy_in(&self, abs_frame: u64, input: &[f32]) {
        let spf = self.samples_per_frame;
        let cap = self.frames;
        // Safety: region [abs_frame, abs_frame + input frames) is owned by
        // the producer per the cursor invariant.
        let data = unsafe { self.samples() };
        let start = (abs_frame as usize % cap) * spf;
        let first = (cap * spf - start).min(input.len());
        data[start..start + first].copy_from_slice(&input[..first]);
        if first < input.len() {
            data[..input.len() - first].copy_from_slice(&input[first..]);
        }
    }

    fn copy_out(&self, abs_frame: u64, out: &mut [f32]) {
        let spf = self.samples_per_frame;
        let cap = self.frames;
        // Safety: region [abs_frame, abs_frame + out frames) is owned by the
        // consumer per the cursor invariant.
        let data = unsafe { self.samples() };
        let start = (abs_frame as usize % cap) * spf;
        let first = (cap * spf - start).min(out.len());
        out[..first].copy_from_slice(&data[start..start + first]);
        if first < out.len() {
            let rest = out.len() - first;
            out[first..].copy_from_slice(&data[..rest]);
        }
    }
}

/// Result of copying out of a [`HistoryRing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCopy {
    /// Frames copied into the destination
    pub frames: usize,
    /// The cursor had fallen behind and was clamped forward
    pub overrun: bool,
}

/// Single-threaded capture history ring with external read cursors
pub struct HistoryRing {
    frames: usize,
    samples_per_frame: usize,
    data: Vec<f32>,
    /// Absolute frames ever appended
    rear: u64,
}

impl HistoryRing {
    pub fn new(frames: usize, samples_per_frame: usize) -> Self {
        assert!(frames > 0 && samples_per_frame > 0);
        Self {
            frames,
            samples_per_frame,
            data: vec![0.0; frames * samples_per_frame],
            rear: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn rear(&self) -> u64 {
        self.rear
    }

    /// A fresh cursor starts at the current rear (no history replay)
    pub fn new_cursor(&self) -> u64 {
        self.rear
    }

    /// Append frames, unconditionally overwriting the oldest data
    pub fn append(&mut self, input: &[f32]) {
        let spf = self.samples_per_frame;
        let n = input.len() / spf;
        // appending more than a full capacity in one call only keeps the tail
        let (skip, n) = if n > self.frames { (n - self.frames, self.frames) } else { (0, n) };
        let input = &input[skip * spf..(skip + n) * spf];
        let mut abs = self.rear + skip as u64;
        for frame in input.chunks_exact(spf) {
            let start = (abs as usize % self.frames) * spf;
            self.data[start..start + spf].copy_from_slice(frame);
            abs += 1;
        }
        self.rear += (skip + n) as u64;
    }

    /// Copy frames from `cursor` toward `rear`, advancing the cursor.
    ///
    /// If the cursor lags by more than the capacity it is clamped to the
    /// oldest valid frame first; the caller sees `overrun == true` and the
    /// frames between the old and clamped cursor are lost.
    pub fn copy_to(&self, cursor: &mut u64, out: &mut [f32]) -> HistoryCopy {
        let spf = self.samples_per_frame;
        let mut overrun = false;

        let oldest = self.rear.saturating_sub(self.frames as u64);
        if *cursor < oldest {
            *cursor = oldest;
            overrun = true;
        }

        let available = (self.rear - *cursor) as usize;
        let n = (out.len() / spf).min(available);
        for i in 0..n {
            let abs = *cursor + i as u64;
            let start = (abs as usize % self.frames) * spf;
            out[i * spf..(i + 1) * spf].copy_from_slice(&self.data[start..start + spf]);
        }
        *cursor += n as u64;
        HistoryCopy { frames: n, overrun }
    }

    /// Grow (or shrink) the history, keeping the newest frames.
    ///
    /// Serves the buffer-resize config event that extends capture history.
    pub fn resize(&mut self, frames: usize) {
        assert!(frames > 0);
        let spf = self.samples_per_frame;
        let keep = self.frames.min(frames).min(self.rear as usize);
        let mut fresh = vec![0.0; frames * spf];
        for i in 0..keep {
            let abs = self.rear - keep as u64 + i as u64;
            let src = (abs as usize % self.frames) * spf;
            let dst = (abs as usize % frames) * spf;
            fresh[dst..dst + spf].copy_from_slice(&self.data[src..src + spf]);
        }
        self.data = fresh;
        self.frames = frames;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_ring_roundtrip() {
        let ring = FrameRing::new(8, 2);
        let input: Vec<f32> = (0..12).map(|i| i as f32).collect(); // 6 frames
        assert_eq!(ring.write_frames(&input), 6);
        assert_eq!(ring.frames_ready(), 6);

        let mut out = vec![0.0; 8];
        assert_eq!(ring.read_frames(&mut out), 4);
        assert_eq!(&out[..4], &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(ring.frames_ready(), 2);
    }

    #[test]
    fn test_frame_ring_wraparound() {
        let ring = FrameRing::new(4, 1);
        let mut out = vec![0.0; 4];
        // fill, drain, fill again so the cursors wrap
        assert_eq!(ring.write_frames(&[1.0, 2.0, 3.0]), 3);
        assert_eq!(ring.read_frames(&mut out[..3]), 3);
        assert_eq!(ring.write_frames(&[4.0, 5.0, 6.0]), 3);
        assert_eq!(ring.read_frames(&mut out[..3]), 3);
        assert_eq!(&out[..3], &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_frame_ring_never_overwrites() {
        let ring = FrameRing::new(2, 1);
        assert_eq!(ring.write_frames(&[1.0, 2.0, 3.0]), 2);
        assert_eq!(ring.write_frames(&[9.0]), 0);
        let mut out = [0.0; 2];
        ring.read_frames(&mut out);
        assert_eq!(out, [1.0, 2.0]);
    }

    #[test]
    fn test_frame_ring_flush() {
        let ring = FrameRing::new(4, 1);
        ring.write_frames(&[1.0, 2.0]);
        ring.flush();
        assert_eq!(ring.frames_ready(), 0);
        assert_eq!(ring.frames_consumed(), 2);
    }

    #[test]
    fn test_history_overrun_clamps_cursor() {
        let mut ring = HistoryRing::new(4, 1);
        let mut cursor = ring.new_cursor();

        ring.append(&[1.0, 2.0, 3.0, 4.0]);
        ring.append(&[5.0, 6.0]); // pushes cursor 2 frames out of window

        let mut out = [0.0; 4];
        let result = ring.copy_to(&mut cursor, &mut out);
        assert!(result.overrun);
        assert_eq!(result.frames, 4);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_history_independent_cursors() {
        let mut ring = HistoryRing::new(8, 1);
        let mut slow = ring.new_cursor();
        let mut fast = ring.new_cursor();

        ring.append(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = [0.0; 4];
        assert_eq!(ring.copy_to(&mut fast, &mut out).frames, 4);

        ring.append(&[5.0, 6.0]);
        // slow consumer still sees everything - nothing lost yet
        let mut big = [0.0; 6];
        let result = ring.copy_to(&mut slow, &mut big);
        assert!(!result.overrun);
        assert_eq!(result.frames, 6);
    }

    #[test]
    fn test_history_resize_keeps_newest() {
        let mut ring = HistoryRing::new(4, 1);
        let mut cursor = ring.new_cursor();
        ring.append(&[1.0, 2.0, 3.0, 4.0]);
        ring.resize(8);
        let mut out = [0.0; 4];
        let result = ring.copy_to(&mut cursor, &mut out);
        assert_eq!(result.frames, 4);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_frame_ring_cross_thread() {
        use std::sync::Arc;
        let ring = Arc::new(FrameRing::new(64, 1));
        let producer = ring.clone();
        let t = std::thread::spawn(move || {
            let mut written = 0u32;
            while written < 1000 {
                let chunk: Vec<f32> = (written..written + 10).map(|i| i as f32).collect();
                let n = producer.write_frames(&chunk);
                written += n as u32;
                if n < 10 {
                    std::thread::yield_now();
                }
            }
        });

        let mut seen = 0u32;
        let mut buf = [0.0f32; 16];
        while seen < 1000 {
            let n = ring.read_frames(&mut buf);
            for &v in &buf[..n] {
                assert_eq!(v, seen as f32);
                seen += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }
        t.join().unwrap();
    }
}
