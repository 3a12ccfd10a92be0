//! The `TimerService` capability (§9 design notes): one-shot, cancellable
//! timers that report back through ordinary engine events rather than a
//! raw sleep loop. This is what lets the session be driven deterministically
//! in tests with [`FakeTimerService`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifies which of the two BTP timers fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    AckReceive,
    SendAck,
}

/// A capability for starting/stopping one-shot timers that report back by
/// sending `TimerId` through a caller-supplied channel.
///
/// Implementations MUST guarantee that starting a timer that is already
/// running cancels the previous one first (§3 invariant: at most one of
/// each timer per session).
pub trait TimerService: Send + Sync {
    fn start(&self, id: TimerId, duration: Duration);
    fn stop(&self, id: TimerId);
    fn is_running(&self, id: TimerId) -> bool;
}

/// Production `TimerService` backed by `tokio::time::sleep`.
pub struct TokioTimerService {
    handles: Mutex<HashMap<TimerId, JoinHandle<()>>>,
    fired: mpsc::UnboundedSender<TimerId>,
}

impl TokioTimerService {
    pub fn new(fired: mpsc::UnboundedSender<TimerId>) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            fired,
        }
    }
}

impl TimerService for TokioTimerService {
    fn start(&self, id: TimerId, duration: Duration) {
        self.stop(id);
        let tx = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(id);
        });
        self.handles.lock().unwrap().insert(id, handle);
    }

    fn stop(&self, id: TimerId) {
        if let Some(handle) = self.handles.lock().unwrap().remove(&id) {
            handle.abort();
        }
    }

    fn is_running(&self, id: TimerId) -> bool {
        self.handles.lock().unwrap().contains_key(&id)
    }
}

impl Drop for TokioTimerService {
    fn drop(&mut self) {
        for (_, handle) in self.handles.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

/// Test double recording start/stop calls and the current running set,
/// without ever actually sleeping. Call [`FakeTimerService::fire`] to
/// simulate an expiry and deliver it through the same channel a real
/// timer would use.
pub struct FakeTimerService {
    running: Mutex<std::collections::HashSet<TimerId>>,
    pub started: Mutex<Vec<(TimerId, Duration)>>,
    fired: mpsc::UnboundedSender<TimerId>,
}

impl FakeTimerService {
    pub fn new(fired: mpsc::UnboundedSender<TimerId>) -> Self {
        Self {
            running: Mutex::new(std::collections::HashSet::new()),
            started: Mutex::new(Vec::new()),
            fired,
        }
    }

    /// Simulates the given timer expiring right now, regardless of
    /// whether it is currently "running"; tests decide when timers fire.
    pub fn fire(&self, id: TimerId) {
        let _ = self.fired.send(id);
    }
}

impl TimerService for FakeTimerService {
    fn start(&self, id: TimerId, duration: Duration) {
        self.running.lock().unwrap().insert(id);
        self.started.lock().unwrap().push((id, duration));
    }

    fn stop(&self, id: TimerId) {
        self.running.lock().unwrap().remove(&id);
    }

    fn is_running(&self, id: TimerId) -> bool {
        self.running.lock().unwrap().contains(&id)
    }
}
