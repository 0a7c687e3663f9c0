//! Real-time fast capture
//!
//! Mirror of the fast mixer for input: reads from the hardware stream each
//! cycle and fans the frames into a single transfer ring the record thread
//! drains. State changes arrive through the same snapshot bridge.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use basedrop::Shared;
use thread_priority::{set_current_thread_priority, ThreadPriority};

use crate::error::{EngineError, EngineResult};
use crate::fast::mixer::FastCommand;
use crate::fast::state_queue::{state_queue, PushMode, StateReader, StateWriter};
use crate::hal::StreamIn;
use crate::ring::FrameRing;
use crate::types::decode_frames;

const COLD_IDLE_PARK: Duration = Duration::from_millis(100);

/// Capture state snapshot. Immutable once published.
#[derive(Clone)]
pub struct FastCaptureState {
    pub command: FastCommand,
    /// Transfer ring toward the record thread; absent while idle
    pub ring: Option<Shared<FrameRing>>,
    pub frames_per_cycle: usize,
}

/// Control-side handle owned by the record thread.
pub struct FastCaptureHandle {
    writer: StateWriter<FastCaptureState>,
    state: FastCaptureState,
    join: Option<JoinHandle<()>>,
}

impl FastCaptureHandle {
    pub fn spawn(
        thread_name: &str,
        stream: Arc<dyn StreamIn>,
        frames_per_cycle: usize,
        ack_timeout: Duration,
    ) -> EngineResult<Self> {
        let (writer, reader) = state_queue::<FastCaptureState>(ack_timeout);
        let name = format!("{thread_name}_fast");
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_fast_capture(reader, stream))
            .map_err(|e| EngineError::Hardware(format!("spawn {name}: {e}")))?;
        Ok(Self {
            writer,
            state: FastCaptureState {
                command: FastCommand::ColdIdle,
                ring: None,
                frames_per_cycle,
            },
            join: Some(join),
        })
    }

    /// Begin capturing into `ring`.
    pub fn start(&mut self, ring: Shared<FrameRing>) -> EngineResult<()> {
        self.state.ring = Some(ring);
        self.state.command = FastCommand::Mix;
        self.writer
            .push(self.state.clone(), PushMode::FireAndForget)?;
        Ok(())
    }

    /// Stop capturing; blocks until the loop has dropped its ring
    /// reference.
    pub fn stop(&mut self) -> EngineResult<()> {
        self.state.ring = None;
        self.state.command = FastCommand::ColdIdle;
        self.writer
            .push(self.state.clone(), PushMode::BlockUntilAcked)?;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.state.command = FastCommand::Exit;
        self.state.ring = None;
        if let Err(e) = self
            .writer
            .push(self.state.clone(), PushMode::BlockUntilAcked)
        {
            log::warn!("fast capture exit not acked: {e}");
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("fast capture loop panicked");
            }
        }
    }
}

impl Drop for FastCaptureHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.shutdown();
        }
    }
}

fn run_fast_capture(mut reader: StateReader<FastCaptureState>, stream: Arc<dyn StreamIn>) {
    reader.register_reader_thread();
    if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
        log::warn!("fast capture priority elevation failed: {e:?}");
    }

    let format = stream.format();
    let samples_per_frame = format.samples_per_frame();
    let mut scratch: Vec<f32> = Vec::new();
    let mut raw: Vec<u8> = Vec::new();

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
        scratch.resize(samples, 0.0f32);
        raw.resize(state.frames_per_cycle * format.frame_size(), 0u8);
        match stream.read(&mut raw) {
            Ok(bytes) => {
                let got = decode_frames(format, &raw[..bytes], &mut scratch);
                if let Some(ring) = &state.ring {
                    // a full transfer ring drops the oldest pending frames
                    // by advancing nothing here; the record thread detects
                    // the gap from the cursor positions
                    ring.write_frames(&scratch[..got * samples_per_frame]);
                }
            }
            Err(e) => {
                log::warn!("fast capture read failed: {e}");
            }
        }
        std::thread::sleep(Duration::from_micros(
            state.frames_per_cycle as u64 * 1_000_000 / format.sample_rate.max(1) as u64,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc;
    use crate::hal::sim::SimInputStream;

    #[test]
    fn test_capture_fills_ring_and_stop_acks() {
        let stream = Arc::new(SimInputStream::new(256));
        let mut h =
            FastCaptureHandle::spawn("test_in", stream, 64, Duration::from_secs(2)).unwrap();

        let ring = Shared::new(&gc::gc_handle(), FrameRing::new(4096, 2));
        h.start(Shared::clone(&ring)).unwrap();

        let start = std::time::Instant::now();
        while ring.frames_ready() == 0 {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "loop never captured"
            );
            std::thread::sleep(Duration::from_millis(5));
        }

        h.stop().unwrap();
        h.shutdown();
    }
}
