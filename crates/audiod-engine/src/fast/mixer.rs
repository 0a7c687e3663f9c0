//! Real-time fast mixer
//!
//! Serves up to [`FAST_TRACK_SLOTS`] low-latency tracks directly from their
//! rings to the hardware stream, outside the control thread's mutex. State
//! arrives exclusively through the snapshot bridge; the loop never
//! allocates and never frees (snapshot drops go through the collector).
//!
//! The hardware stream has exactly one writer. Once a playback thread
//! spawns a fast mixer, the RT loop owns the stream; the control thread's
//! normal mix reaches the hardware through the mix pipe, summed here like
//! another track.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use basedrop::Shared;
use thread_priority::{set_current_thread_priority, ThreadPriority};

use crate::error::{EngineError, EngineResult};
use crate::fast::state_queue::{state_queue, PushMode, StateReader, StateWriter};
use crate::hal::StreamOut;
use crate::ring::FrameRing;
use crate::types::{encode_frames, FastSlot, TrackId, FAST_TRACK_SLOTS};

/// How long the loop parks per cold-idle wait before re-polling.
const COLD_IDLE_PARK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastCommand {
    /// Nothing to serve; park until the next publication
    ColdIdle,
    /// Serve the active slots each cycle
    Mix,
    /// Leave the loop
    Exit,
}

/// Per-slot state handed across the bridge.
#[derive(Clone)]
pub struct FastTrackState {
    pub track_id: TrackId,
    pub ring: Shared<FrameRing>,
    pub volume: f32,
}

/// Complete mixer state snapshot. Immutable once published.
#[derive(Clone)]
pub struct FastMixerState {
    pub command: FastCommand,
    pub tracks: [Option<FastTrackState>; FAST_TRACK_SLOTS],
    /// Normal-mix feed from the control loop, pre-attenuated
    pub mix_pipe: Shared<FrameRing>,
    pub frames_per_cycle: usize,
}

/// Control-side handle: slot allocator plus the publication channel.
///
/// Owned by the playback thread; all methods are called with that thread's
/// mutex held, preserving the single-producer discipline.
pub struct FastMixerHandle {
    writer: StateWriter<FastMixerState>,
    /// Control-side copy of the last published state
    state: FastMixerState,
    slot_used: [bool; FAST_TRACK_SLOTS],
    pipe_active: bool,
    join: Option<JoinHandle<()>>,
}

impl FastMixerHandle {
    /// Spawn the real-time loop against `stream` and return the handle.
    /// `mix_pipe` carries the control thread's normal mix; the loop sums it
    /// with the fast slots so the stream keeps a single writer.
    pub fn spawn(
        thread_name: &str,
        stream: Arc<dyn StreamOut>,
        mix_pipe: Shared<FrameRing>,
        frames_per_cycle: usize,
        ack_timeout: Duration,
    ) -> EngineResult<Self> {
        let (writer, reader) = state_queue::<FastMixerState>(ack_timeout);
        let name = format!("{thread_name}_fast");
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_fast_mixer(reader, stream))
            .map_err(|e| EngineError::Hardware(format!("spawn {name}: {e}")))?;
        Ok(Self {
            writer,
            state: FastMixerState {
                command: FastCommand::ColdIdle,
                tracks: Default::default(),
                mix_pipe,
                frames_per_cycle,
            },
            slot_used: [false; FAST_TRACK_SLOTS],
            pipe_active: false,
            join: Some(join),
        })
    }

    pub fn allocate_slot(&mut self) -> Option<FastSlot> {
        let idx = self.slot_used.iter().position(|used| !used)?;
        self.slot_used[idx] = true;
        Some(FastSlot(idx))
    }

    pub fn free_slot(&mut self, slot: FastSlot) {
        debug_assert!(self.slot_used[slot.0]);
        self.slot_used[slot.0] = false;
    }

    /// Recompute the command from what the loop has to serve, then publish.
    fn publish(&mut self, mode: PushMode) -> EngineResult<()> {
        let serving = self.pipe_active || self.state.tracks.iter().any(Option::is_some);
        self.state.command = if serving {
            FastCommand::Mix
        } else {
            FastCommand::ColdIdle
        };
        self.writer.push(self.state.clone(), mode)?;
        Ok(())
    }

    /// Install a track into its slot and publish. Fire-and-forget: the
    /// track only becomes audible, nothing is recycled.
    pub fn set_track(&mut self, slot: FastSlot, track: FastTrackState) -> EngineResult<()> {
        self.state.tracks[slot.0] = Some(track);
        self.publish(PushMode::FireAndForget)
    }

    /// Remove a track from its slot and block until the loop has observed
    /// the removal, so the caller may release the track's resources.
    pub fn clear_track(&mut self, slot: FastSlot) -> EngineResult<()> {
        self.state.tracks[slot.0] = None;
        self.publish(PushMode::BlockUntilAcked)
    }

    pub fn set_volume(&mut self, slot: FastSlot, volume: f32) -> EngineResult<()> {
        if let Some(track) = &mut self.state.tracks[slot.0] {
            track.volume = volume;
            self.publish(PushMode::FireAndForget)?;
        }
        Ok(())
    }

    /// Tell the loop whether the control thread is feeding the mix pipe.
    pub fn set_pipe_active(&mut self, active: bool) -> EngineResult<()> {
        if self.pipe_active == active {
            return Ok(());
        }
        self.pipe_active = active;
        self.publish(PushMode::FireAndForget)
    }

    pub fn active_slots(&self) -> usize {
        self.state.tracks.iter().filter(|t| t.is_some()).count()
    }

    /// Publish Exit, wait for the ack and join the loop.
    pub fn shutdown(&mut self) {
        self.state.command = FastCommand::Exit;
        self.state.tracks = Default::default();
        if let Err(e) = self
            .writer
            .push(self.state.clone(), PushMode::BlockUntilAcked)
        {
            log::warn!("fast mixer exit not acked: {e}");
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("fast mixer loop panicked");
            }
        }
    }
}

impl Drop for FastMixerHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.shutdown();
        }
    }
}

fn run_fast_mixer(mut reader: StateReader<FastMixerState>, stream: Arc<dyn StreamOut>) {
    reader.register_reader_thread();
    if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
        log::warn!("fast mixer priority elevation failed: {e:?}");
    }

    let format = stream.format();
    let samples_per_frame = format.samples_per_frame();
    let mut mix = Vec::new();
    let mut scratch = Vec::new();
    let mut wire = Vec::new();

    loop {
        let Some(state) = reader.poll() else {
            reader.park(COLD_IDLE_PARK);
            continue;
        };
        match state.command {
            FastCommand::Exit => return,
            FastCommand::ColdIdle => {
                reader.park(COLD_IDLE_PARK);
                continue;
            }
            FastCommand::Mix => {}
        }

        let samples = state.frames_per_cycle * samples_per_frame;
        mix.clear();
        mix.resize(samples, 0.0f32);
        scratch.resize(samples, 0.0f32);

        for track in state.tracks.iter().flatten() {
            let got = track.ring.read_frames(&mut scratch);
            let volume = track.volume;
            for (acc, sample) in mix.iter_mut().zip(&scratch[..got * samples_per_frame]) {
                *acc += sample * volume;
            }
        }

        // normal mix joins through the pipe, already attenuated by the
        // control thread
        let got = state.mix_pipe.read_frames(&mut scratch);
        for (acc, sample) in mix.iter_mut().zip(&scratch[..got * samples_per_frame]) {
            *acc += *sample;
        }

        // a starved slot contributes silence; the control loop owns the
        // underrun retry accounting from the ring's cursor positions
        wire.clear();
        encode_frames(format, &mix, &mut wire);
        if let Err(e) = stream.write(&wire) {
            log::warn!("fast mixer write failed: {e}");
            std::thread::sleep(cycle_period(state.frames_per_cycle, format.sample_rate));
            continue;
        }
        std::thread::sleep(cycle_period(state.frames_per_cycle, format.sample_rate));
    }
}

fn cycle_period(frames: usize, sample_rate: u32) -> Duration {
    Duration::from_micros(frames as u64 * 1_000_000 / sample_rate.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc;
    use crate::hal::sim::SimOutputStream;
    use crate::ring::FrameRing;
    use crate::types::decode_frames;

    fn handle(stream: Arc<SimOutputStream>) -> FastMixerHandle {
        let pipe = Shared::new(&gc::gc_handle(), FrameRing::new(256, 2));
        FastMixerHandle::spawn("test_out", stream, pipe, 64, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_slot_allocation_exhausts() {
        let stream = Arc::new(SimOutputStream::new(256));
        let mut h = handle(stream);
        let mut slots = Vec::new();
        while let Some(slot) = h.allocate_slot() {
            slots.push(slot);
        }
        assert_eq!(slots.len(), FAST_TRACK_SLOTS);
        h.free_slot(slots[3]);
        assert_eq!(h.allocate_slot(), Some(FastSlot(3)));
        h.shutdown();
    }

    #[test]
    fn test_fast_track_audible_and_teardown_acked() {
        let stream = Arc::new(SimOutputStream::new(256));
        let mut h = handle(Arc::clone(&stream));
        let slot = h.allocate_slot().unwrap();

        let ring = Shared::new(&gc::gc_handle(), FrameRing::new(1024, 2));
        ring.write_frames(&[0.25f32; 2048]);
        h.set_track(
            slot,
            FastTrackState {
                track_id: TrackId::next(),
                ring: Shared::clone(&ring),
                volume: 1.0,
            },
        )
        .unwrap();

        // wait for the loop to consume something
        let start = std::time::Instant::now();
        while ring.frames_ready() == 1024 {
            assert!(start.elapsed() < Duration::from_secs(5), "loop never mixed");
            std::thread::sleep(Duration::from_millis(5));
        }

        // blocking removal: once it returns, the loop no longer references
        // the slot
        h.clear_track(slot).unwrap();
        h.free_slot(slot);
        assert!(stream.write_count() > 0);
        h.shutdown();
    }

    #[test]
    fn test_normal_mix_pipe_summed_with_fast_slots() {
        let stream = Arc::new(SimOutputStream::new(64));
        let pipe = Shared::new(&gc::gc_handle(), FrameRing::new(1024, 2));
        let mut h = FastMixerHandle::spawn(
            "test_out",
            Arc::clone(&stream) as Arc<dyn StreamOut>,
            Shared::clone(&pipe),
            64,
            Duration::from_secs(2),
        )
        .unwrap();

        // both feeds are primed before the loop starts mixing, so every
        // audible cycle carries the sum
        pipe.write_frames(&[0.5f32; 2048]);
        let ring = Shared::new(&gc::gc_handle(), FrameRing::new(1024, 2));
        ring.write_frames(&[0.25f32; 2048]);

        let slot = h.allocate_slot().unwrap();
        h.set_track(
            slot,
            FastTrackState {
                track_id: TrackId::next(),
                ring: Shared::clone(&ring),
                volume: 1.0,
            },
        )
        .unwrap();

        let start = std::time::Instant::now();
        loop {
            assert!(start.elapsed() < Duration::from_secs(5), "loop never mixed");
            let bytes = stream.last_write.lock().unwrap().clone();
            if !bytes.is_empty() {
                let mut samples = vec![0.0f32; bytes.len() / 4];
                assert!(decode_frames(stream.format(), &bytes, &mut samples) > 0);
                for s in &samples {
                    assert!((s - 0.75).abs() < 1e-6, "expected summed mix, got {s}");
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        h.shutdown();
    }
}
