//! RT-safe deferred deallocation for buffers crossing the fast-path boundary
//!
//! A fast track's ring buffer is still referenced by the fast mixer until
//! the bridge acknowledges its removal; the last reference can therefore be
//! dropped on the real-time thread. Freeing multi-megabyte buffers there
//! would stall the mix period, so buffers that cross the boundary are held
//! in `basedrop::Shared<T>`: dropping on the RT thread only enqueues a
//! pointer, and a background collector thread does the actual deallocation.

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

/// Spawn the collector thread and hand back an allocation handle
fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("audiod-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it must be created on its own thread
            let mut collector = Collector::new();

            let handle = collector.handle();
            tx.send(handle).expect("failed to send GC handle");

            log::info!("engine GC thread started");

            loop {
                collector.collect();
                // 100ms reclamation latency is plenty for buffer memory
                thread::sleep(Duration::from_millis(100));
            }
        })
        .expect("failed to spawn engine GC thread");

    rx.recv().expect("failed to receive GC handle")
}

/// Get a handle for creating `Shared<T>` allocations
///
/// The first call spawns the collector thread; the handle is cheap to clone.
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;

    #[test]
    fn test_shared_allocation_and_drop() {
        let value = Shared::new(&gc_handle(), vec![0u8; 1024]);
        let clone = value.clone();
        assert_eq!(clone.len(), 1024);
        drop(value);
        drop(clone);
        // Deallocation happens on the collector thread; nothing to assert
        // here beyond not crashing.
    }
}
