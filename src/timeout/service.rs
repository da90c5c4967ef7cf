//! Pausable one-shot deadlines for strategy controllers
//!
//! A single timer thread per service owns a min-heap of wake-up instants.
//! Each [`TimeoutHandle`] tracks how long its deadline has actually been
//! running; time spent paused is excluded, so a wake-up that turns out to be
//! early (because of a pause) is simply rescheduled for the remainder.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Something that can be told its deadline passed
pub trait Timeoutable: Send + Sync {
    /// Abort the in-flight operation if it has not produced a result yet
    fn cancel_if_not_fruitful(&self, timeout: Duration);
}

enum Command {
    Schedule {
        id: u64,
        wake_at: Instant,
        task: Arc<Mutex<TaskState>>,
    },
    Remove {
        id: u64,
    },
    Shutdown,
}

struct TaskState {
    deadline: Duration,
    elapsed_before_pause: Duration,
    running_since: Option<Instant>,
    finished: bool,
    fired_after: Option<Duration>,
    target: Arc<dyn Timeoutable>,
}

impl TaskState {
    fn active_elapsed(&self, now: Instant) -> Duration {
        self.elapsed_before_pause
            + self
                .running_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default()
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_sub(self.active_elapsed(now))
    }
}

fn lock(task: &Mutex<TaskState>) -> MutexGuard<'_, TaskState> {
    task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Schedules, pauses and cancels controller deadlines
pub struct TimeoutService {
    commands: Sender<Command>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutService {
    /// Start the timer thread
    pub fn new() -> Self {
        let (commands, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("rv-timeouts".to_string())
            .spawn(move || run_timer(rx))
            .ok();
        if worker.is_none() {
            tracing::error!("Could not start timeout thread; deadlines will not fire");
        }

        Self {
            commands,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(worker),
        }
    }

    /// Arm a deadline for `target`
    pub fn start(&self, target: Arc<dyn Timeoutable>, deadline: Duration) -> TimeoutHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let task = Arc::new(Mutex::new(TaskState {
            deadline,
            elapsed_before_pause: Duration::ZERO,
            running_since: Some(now),
            finished: false,
            fired_after: None,
            target,
        }));

        tracing::trace!(timeout_id = id, ?deadline, "Deadline armed");
        let _ = self.commands.send(Command::Schedule {
            id,
            wake_at: now + deadline,
            task: Arc::clone(&task),
        });

        TimeoutHandle {
            id,
            task,
            commands: self.commands.clone(),
        }
    }

    /// Like [`start`](Self::start), but begins paused
    pub fn start_paused(&self, target: Arc<dyn Timeoutable>, deadline: Duration) -> TimeoutHandle {
        let handle = self.start(target, deadline);
        handle.pause();
        handle
    }
}

impl Default for TimeoutService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimeoutService {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        // The last handle may be released by a callback on the timer thread itself
        if let Some(worker) = worker.filter(|w| w.thread().id() != thread::current().id()) {
            let _ = worker.join();
        }
    }
}

fn run_timer(rx: Receiver<Command>) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut tasks: HashMap<u64, Arc<Mutex<TaskState>>> = HashMap::new();

    loop {
        let command = match heap.peek() {
            Some(Reverse((wake_at, _))) => {
                let wait = wake_at.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            },
        };

        match command {
            Some(Command::Schedule { id, wake_at, task }) => {
                tasks.insert(id, task);
                heap.push(Reverse((wake_at, id)));
            }
            Some(Command::Remove { id }) => {
                tasks.remove(&id);
            }
            Some(Command::Shutdown) => return,
            None => {}
        }

        let now = Instant::now();
        while let Some(Reverse((wake_at, id))) = heap.peek().copied() {
            if wake_at > now {
                break;
            }
            heap.pop();

            let Some(task) = tasks.get(&id).cloned() else {
                continue;
            };

            let mut state = lock(&task);
            if state.finished {
                drop(state);
                tasks.remove(&id);
                continue;
            }
            if state.running_since.is_none() {
                // Paused; unpause hands the task back with a fresh wake-up
                drop(state);
                tasks.remove(&id);
                continue;
            }
            let remaining = state.remaining(now);
            if !remaining.is_zero() {
                heap.push(Reverse((now + remaining, id)));
                continue;
            }

            state.finished = true;
            state.fired_after = Some(state.active_elapsed(now));
            let deadline = state.deadline;
            let target = Arc::clone(&state.target);
            drop(state);
            tasks.remove(&id);

            tracing::debug!(timeout_id = id, ?deadline, "Deadline expired");
            target.cancel_if_not_fruitful(deadline);
        }
    }
}

/// Control over one armed deadline
pub struct TimeoutHandle {
    id: u64,
    task: Arc<Mutex<TaskState>>,
    commands: Sender<Command>,
}

impl TimeoutHandle {
    /// Suspend the deadline; elapsed time so far is kept
    pub fn pause(&self) {
        let mut state = lock(&self.task);
        if state.finished {
            return;
        }
        if let Some(since) = state.running_since.take() {
            state.elapsed_before_pause += since.elapsed();
            tracing::trace!(timeout_id = self.id, elapsed = ?state.elapsed_before_pause, "Deadline paused");
        }
    }

    /// Resume a paused deadline
    pub fn unpause(&self) {
        let mut state = lock(&self.task);
        if state.finished || state.running_since.is_some() {
            return;
        }
        let now = Instant::now();
        state.running_since = Some(now);
        let wake_at = now + state.remaining(now);
        drop(state);

        tracing::trace!(timeout_id = self.id, "Deadline resumed");
        let _ = self.commands.send(Command::Schedule {
            id: self.id,
            wake_at,
            task: Arc::clone(&self.task),
        });
    }

    /// Disarm the deadline; idempotent
    pub fn cancel(&self) {
        let mut state = lock(&self.task);
        if state.finished {
            return;
        }
        state.finished = true;
        drop(state);
        let _ = self.commands.send(Command::Remove { id: self.id });
    }

    /// Whether the deadline is currently suspended
    pub fn is_paused(&self) -> bool {
        let state = lock(&self.task);
        !state.finished && state.running_since.is_none()
    }

    /// Whether the deadline already fired
    pub fn has_fired(&self) -> bool {
        lock(&self.task).fired_after.is_some()
    }

    /// Active (unpaused) time the deadline ran before it fired
    pub fn fired_after(&self) -> Option<Duration> {
        lock(&self.task).fired_after
    }

    /// Active (unpaused) time elapsed so far
    pub fn active_elapsed(&self) -> Duration {
        lock(&self.task).active_elapsed(Instant::now())
    }

    /// The configured deadline
    pub fn deadline(&self) -> Duration {
        lock(&self.task).deadline
    }
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("id", &self.id)
            .field("deadline", &self.deadline())
            .field("paused", &self.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    struct Recorder {
        fired: Sender<(Instant, Duration)>,
    }

    impl Timeoutable for Recorder {
        fn cancel_if_not_fruitful(&self, timeout: Duration) {
            let _ = self.fired.send((Instant::now(), timeout));
        }
    }

    fn recorder() -> (Arc<Recorder>, Receiver<(Instant, Duration)>) {
        let (tx, rx) = bounded(4);
        (Arc::new(Recorder { fired: tx }), rx)
    }

    #[test]
    fn test_fires_after_deadline() {
        let service = TimeoutService::new();
        let (target, fired) = recorder();

        let started = Instant::now();
        let handle = service.start(target, Duration::from_millis(100));

        let (at, timeout) = fired.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(timeout, Duration::from_millis(100));
        assert!(at.duration_since(started) >= Duration::from_millis(100));
        assert!(handle.has_fired());
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let service = TimeoutService::new();
        let (target, fired) = recorder();

        let handle = service.start(target, Duration::from_millis(50));
        handle.cancel();
        handle.cancel();

        assert!(fired.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(!handle.has_fired());
    }

    #[test]
    fn test_paused_time_does_not_count() {
        let service = TimeoutService::new();
        let (target, fired) = recorder();
        let deadline = Duration::from_millis(200);

        let started = Instant::now();
        let handle = service.start(target, deadline);

        thread::sleep(Duration::from_millis(60));
        handle.pause();
        assert!(handle.is_paused());

        // Long enough that an unpaused deadline would have fired
        thread::sleep(Duration::from_millis(300));
        assert!(fired.try_recv().is_err());
        handle.unpause();

        let (at, _) = fired.recv_timeout(Duration::from_secs(2)).unwrap();
        let active = handle.fired_after().unwrap();

        assert!(active >= deadline);
        assert!(active < deadline + Duration::from_millis(150));
        assert!(at.duration_since(started) >= Duration::from_millis(500));
    }

    #[test]
    fn test_start_paused_waits_for_unpause() {
        let service = TimeoutService::new();
        let (target, fired) = recorder();

        let handle = service.start_paused(target, Duration::from_millis(30));
        assert!(fired.recv_timeout(Duration::from_millis(150)).is_err());

        handle.unpause();
        assert!(fired.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_cancelled_tasks_release_target() {
        let service = TimeoutService::new();

        for paused in [true, false] {
            let (target, fired) = recorder();
            let handle = if paused {
                service.start_paused(Arc::clone(&target) as Arc<dyn Timeoutable>, Duration::from_millis(20))
            } else {
                service.start(Arc::clone(&target) as Arc<dyn Timeoutable>, Duration::from_secs(60))
            };

            // Let a paused wake-up come due before cancelling
            thread::sleep(Duration::from_millis(80));
            handle.cancel();
            drop(handle);

            let started = Instant::now();
            while Arc::strong_count(&target) > 1 {
                assert!(
                    started.elapsed() < Duration::from_secs(2),
                    "timer kept target alive (paused: {})",
                    paused
                );
                thread::sleep(Duration::from_millis(10));
            }
            assert!(fired.try_recv().is_err());
        }
    }

    #[test]
    fn test_unpause_after_paused_wakeup() {
        let service = TimeoutService::new();
        let (target, fired) = recorder();

        let handle = service.start_paused(target, Duration::from_millis(20));
        // The paused wake-up passes and the timer lets go of the task
        thread::sleep(Duration::from_millis(80));
        handle.unpause();

        assert!(fired.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(handle.has_fired());
    }

    #[test]
    fn test_independent_deadlines() {
        let service = TimeoutService::new();
        let (slow, slow_fired) = recorder();
        let (fast, fast_fired) = recorder();

        let _slow = service.start(slow, Duration::from_millis(300));
        let _fast = service.start(fast, Duration::from_millis(30));

        assert!(fast_fired.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(slow_fired.try_recv().is_err());
        assert!(slow_fired.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
