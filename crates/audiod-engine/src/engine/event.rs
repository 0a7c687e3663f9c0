//! Config events - typed control requests crossing into a thread's loop
//!
//! Every event carries a uniform completion handle. The sender enqueues,
//! pokes the thread's condvar, and blocks on the handle with a bounded
//! timeout; the loop drains the mailbox in FIFO order and completes each
//! handle. Priority requests are the one asynchronous kind: the sender
//! does not wait, so those events carry no handle.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::types::LatencyMode;

/// Typed payload of a control request
#[derive(Debug, Clone)]
pub enum ConfigEventKind {
    /// Device routing changed underneath the thread
    RoutingChanged,
    /// Generic key=value parameter string, HAL passthrough style
    SetParameters(String),
    /// Establish an audio patch to this thread's stream
    CreatePatch { port: crate::types::PortId },
    /// Tear down a previously created patch
    ReleasePatch { port: crate::types::PortId },
    /// Elevate the priority of a client callback thread. Asynchronous.
    RequestPriority { pid: u32, tid: u32, forced: bool },
    /// Grow the capture history buffer
    ResizeBuffer { frames: usize },
    /// Output latency mode changed
    UpdateLatencyMode(LatencyMode),
}

impl ConfigEventKind {
    /// Asynchronous kinds never get a completion handle.
    pub fn is_async(&self) -> bool {
        matches!(self, ConfigEventKind::RequestPriority { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConfigEventKind::RoutingChanged => "RoutingChanged",
            ConfigEventKind::SetParameters(_) => "SetParameters",
            ConfigEventKind::CreatePatch { .. } => "CreatePatch",
            ConfigEventKind::ReleasePatch { .. } => "ReleasePatch",
            ConfigEventKind::RequestPriority { .. } => "RequestPriority",
            ConfigEventKind::ResizeBuffer { .. } => "ResizeBuffer",
            ConfigEventKind::UpdateLatencyMode(_) => "UpdateLatencyMode",
        }
    }
}

#[derive(Debug)]
enum EventState {
    Pending,
    Done(Result<(), EngineError>),
    /// The waiter gave up; a late completion must not rendezvous
    TimedOut,
}

/// Completion rendezvous shared by the sender and the thread loop.
///
/// At most one thread ever waits on a handle.
#[derive(Clone)]
pub struct EventHandle {
    inner: Arc<(Mutex<EventState>, Condvar)>,
}

impl EventHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(EventState::Pending), Condvar::new())),
        }
    }

    /// Block until the loop completes the event or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> EngineResult<()> {
        let (lock, cond) = &*self.inner;
        let mut state = match lock.lock() {
            Ok(g) => g,
            Err(_) => return Err(EngineError::Dead),
        };
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match &*state {
                EventState::Done(result) => return result.clone(),
                EventState::Pending => {}
                EventState::TimedOut => unreachable!("event waited on twice"),
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                *state = EventState::TimedOut;
                return Err(EngineError::Timeout);
            }
            let (next, wait) = match cond.wait_timeout(state, deadline - now) {
                Ok(r) => r,
                Err(_) => return Err(EngineError::Dead),
            };
            state = next;
            if wait.timed_out() {
                if let EventState::Done(result) = &*state {
                    return result.clone();
                }
                *state = EventState::TimedOut;
                return Err(EngineError::Timeout);
            }
        }
    }

    /// Complete the event from the thread loop. A completion arriving after
    /// the waiter timed out is dropped.
    pub fn complete(&self, result: Result<(), EngineError>) {
        let (lock, cond) = &*self.inner;
        let mut state = match lock.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        match &*state {
            EventState::Pending => {
                *state = EventState::Done(result);
                cond.notify_one();
            }
            EventState::TimedOut => {
                log::warn!("config event completed after waiter timed out");
            }
            EventState::Done(_) => unreachable!("event completed twice"),
        }
    }
}

impl Default for EventHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued control request
pub struct ConfigEvent {
    pub kind: ConfigEventKind,
    pub handle: Option<EventHandle>,
}

impl ConfigEvent {
    pub fn new(kind: ConfigEventKind) -> (Self, Option<EventHandle>) {
        let handle = if kind.is_async() {
            None
        } else {
            Some(EventHandle::new())
        };
        let event = Self {
            kind,
            handle: handle.clone(),
        };
        (event, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_wakes_waiter() {
        let (event, handle) = ConfigEvent::new(ConfigEventKind::RoutingChanged);
        let handle = handle.unwrap();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            event.handle.unwrap().complete(Ok(()));
        });
        assert!(handle.wait(Duration::from_secs(2)).is_ok());
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let (_event, handle) = ConfigEvent::new(ConfigEventKind::RoutingChanged);
        let err = handle.unwrap().wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, EngineError::Timeout));
    }

    #[test]
    fn test_late_completion_is_dropped() {
        let (event, handle) = ConfigEvent::new(ConfigEventKind::SetParameters("a=b".into()));
        let handle = handle.unwrap();
        assert!(matches!(
            handle.wait(Duration::from_millis(5)),
            Err(EngineError::Timeout)
        ));
        // must not panic or rendezvous
        event.handle.unwrap().complete(Ok(()));
    }

    #[test]
    fn test_priority_requests_are_async() {
        let (event, handle) = ConfigEvent::new(ConfigEventKind::RequestPriority {
            pid: 1,
            tid: 2,
            forced: false,
        });
        assert!(handle.is_none());
        assert!(event.handle.is_none());
    }

    #[test]
    fn test_error_propagates_to_waiter() {
        let (event, handle) = ConfigEvent::new(ConfigEventKind::ResizeBuffer { frames: 0 });
        let handle = handle.unwrap();
        event
            .handle
            .unwrap()
            .complete(Err(EngineError::InvalidArgument("frames == 0".into())));
        assert!(matches!(
            handle.wait(Duration::from_secs(1)),
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
