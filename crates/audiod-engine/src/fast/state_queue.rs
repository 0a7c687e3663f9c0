//! Single-producer single-consumer snapshot queue to a real-time thread
//!
//! The control thread publishes immutable state snapshots; the real-time
//! side never takes a lock for them. Each snapshot carries a generation;
//! the reader stores the generation of the newest snapshot it observed so
//! the writer can block until a publication has been seen. Park/unpark is
//! the wake side channel in both directions, with `park_timeout` bounding
//! every wait so a missed unpark degrades to a poll instead of a hang.
//!
//! Snapshots travel as collector-backed shared pointers, so the real-time
//! side dropping the last reference never frees memory inline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::Thread;
use std::time::{Duration, Instant};

use basedrop::Shared;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::error::{EngineError, EngineResult};
use crate::gc;

/// How long either side parks before re-polling on its own.
const PARK_GRANULARITY: Duration = Duration::from_millis(10);

/// Publication semantics for [`StateWriter::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Return as soon as the snapshot is queued. Used for periodic state
    /// refreshes where the next cycle supersedes this one anyway.
    FireAndForget,
    /// Block until the real-time side has observed this snapshot (or a
    /// newer one). Used for track teardown and exit, where the control
    /// thread must not recycle resources the old state still references.
    BlockUntilAcked,
}

struct Sequenced<T> {
    generation: u32,
    state: Shared<T>,
}

struct QueueShared {
    /// Generation of the newest snapshot the reader has observed
    acked: AtomicU32,
    writer: Mutex<Option<Thread>>,
    reader: Mutex<Option<Thread>>,
}

impl QueueShared {
    /// Unpark the other side if its handle is registered. `try_lock` only:
    /// the real-time side must never block on this mutex.
    fn unpark(slot: &Mutex<Option<Thread>>) {
        if let Ok(guard) = slot.try_lock() {
            if let Some(thread) = guard.as_ref() {
                thread.unpark();
            }
        }
    }
}

/// Control-thread side of the bridge.
pub struct StateWriter<T> {
    producer: Producer<Sequenced<T>>,
    shared: Arc<QueueShared>,
    next_generation: u32,
    ack_timeout: Duration,
}

impl<T: Send + Sync + 'static> StateWriter<T> {
    /// Publish a snapshot. Returns its generation.
    pub fn push(&mut self, state: T, mode: PushMode) -> EngineResult<u32> {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        let snapshot = Sequenced {
            generation,
            state: Shared::new(&gc::gc_handle(), state),
        };

        let mut pending = snapshot;
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            match self.producer.push(pending) {
                Ok(()) => break,
                Err(rtrb::PushError::Full(back)) => {
                    // reader is behind; it drains to the newest each poll,
                    // so waiting for one slot is enough
                    if Instant::now() >= deadline {
                        return Err(EngineError::Timeout);
                    }
                    QueueShared::unpark(&self.shared.reader);
                    std::thread::park_timeout(PARK_GRANULARITY);
                    pending = back;
                }
            }
        }
        QueueShared::unpark(&self.shared.reader);

        if mode == PushMode::BlockUntilAcked {
            self.wait_for_ack(generation, deadline)?;
        }
        Ok(generation)
    }

    fn wait_for_ack(&self, generation: u32, deadline: Instant) -> EngineResult<()> {
        loop {
            // wrapping-safe: "acked at or past generation" within half range
            let acked = self.shared.acked.load(Ordering::Acquire);
            if acked.wrapping_sub(generation) < u32::MAX / 2 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout);
            }
            std::thread::park_timeout(PARK_GRANULARITY);
        }
    }

    pub fn last_acked(&self) -> u32 {
        self.shared.acked.load(Ordering::Acquire)
    }

    /// Register the calling thread as the one the reader unparks after an
    /// ack. Call once from the control loop before the first blocking push.
    pub fn register_writer_thread(&self) {
        if let Ok(mut slot) = self.shared.writer.lock() {
            *slot = Some(std::thread::current());
        }
    }
}

/// Real-time side of the bridge. No method blocks except the explicit
/// [`StateReader::park`] used for cold idle.
pub struct StateReader<T> {
    consumer: Consumer<Sequenced<T>>,
    shared: Arc<QueueShared>,
    current: Option<Sequenced<T>>,
}

impl<T> StateReader<T> {
    /// Advance to the newest published snapshot, acking it and unparking a
    /// blocked writer. Returns the current state, which persists across
    /// polls that find nothing new. The returned handle is a refcount bump,
    /// never an allocation.
    pub fn poll(&mut self) -> Option<Shared<T>> {
        let mut advanced = false;
        while let Ok(next) = self.consumer.pop() {
            self.current = Some(next);
            advanced = true;
        }
        if advanced {
            if let Some(current) = &self.current {
                self.shared
                    .acked
                    .store(current.generation, Ordering::Release);
                QueueShared::unpark(&self.shared.writer);
            }
        }
        self.current()
    }

    pub fn current(&self) -> Option<Shared<T>> {
        self.current.as_ref().map(|s| Shared::clone(&s.state))
    }

    /// Register the calling thread as the one the writer unparks after a
    /// publication. Call once at real-time loop entry.
    pub fn register_reader_thread(&self) {
        if let Ok(mut slot) = self.shared.reader.lock() {
            *slot = Some(std::thread::current());
        }
    }

    /// Cold-idle wait: park until the writer publishes or `timeout`
    /// elapses. The caller polls again either way.
    pub fn park(&self, timeout: Duration) {
        if self.consumer.is_empty() {
            std::thread::park_timeout(timeout);
        }
    }
}

/// Build a connected writer/reader pair. `ack_timeout` bounds every
/// blocking wait on the writer side.
pub fn state_queue<T: Send + Sync + 'static>(
    ack_timeout: Duration,
) -> (StateWriter<T>, StateReader<T>) {
    let (producer, consumer) = RingBuffer::new(4);
    let shared = Arc::new(QueueShared {
        acked: AtomicU32::new(0),
        writer: Mutex::new(None),
        reader: Mutex::new(None),
    });
    (
        StateWriter {
            producer,
            shared: Arc::clone(&shared),
            next_generation: 1,
            ack_timeout,
        },
        StateReader {
            consumer,
            shared,
            current: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reader_sees_newest() {
        let (mut writer, mut reader) = state_queue::<u32>(Duration::from_secs(1));
        writer.push(1, PushMode::FireAndForget).unwrap();
        writer.push(2, PushMode::FireAndForget).unwrap();
        writer.push(3, PushMode::FireAndForget).unwrap();
        assert_eq!(reader.poll().as_deref(), Some(&3));
        // nothing new: state persists
        assert_eq!(reader.poll().as_deref(), Some(&3));
    }

    #[test]
    fn test_block_until_acked() {
        let (mut writer, mut reader) = state_queue::<u32>(Duration::from_secs(2));
        let poller = thread::spawn(move || {
            loop {
                if reader.poll().as_deref() == Some(&42) {
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        });
        writer.register_writer_thread();
        writer.push(42, PushMode::BlockUntilAcked).unwrap();
        assert_eq!(writer.last_acked(), 1);
        poller.join().unwrap();
    }

    #[test]
    fn test_blocked_push_times_out_without_reader() {
        let (mut writer, _reader) = state_queue::<u32>(Duration::from_millis(50));
        assert!(matches!(
            writer.push(7, PushMode::BlockUntilAcked),
            Err(EngineError::Timeout)
        ));
    }

    #[test]
    fn test_park_returns_on_publication() {
        let (mut writer, mut reader) = state_queue::<u32>(Duration::from_secs(1));
        let rt = thread::spawn(move || {
            reader.register_reader_thread();
            let start = Instant::now();
            while reader.poll().is_none() {
                reader.park(Duration::from_millis(500));
                assert!(start.elapsed() < Duration::from_secs(5));
            }
            *reader.current().unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        writer.push(9, PushMode::FireAndForget).unwrap();
        assert_eq!(rt.join().unwrap(), 9);
    }

    #[test]
    fn test_writer_survives_full_queue() {
        let (mut writer, mut reader) = state_queue::<u32>(Duration::from_secs(2));
        let drainer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            reader.poll().as_deref().copied()
        });
        for i in 0..16 {
            writer.push(i, PushMode::FireAndForget).unwrap();
        }
        assert_eq!(drainer.join().unwrap(), Some(15));
    }
}
