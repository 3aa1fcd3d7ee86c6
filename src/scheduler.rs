//! Single-threaded cooperative executor: the engine thread
//!
//! All pledge-set and status mutations happen on this one thread. Work from
//! other threads (HTTP handlers, wallet callbacks, peer callbacks) is handed
//! off with [`Scheduler::submit`] / [`Scheduler::submit_asap`];
//! [`Scheduler::schedule`] requeues work after a delay. Every mutator of
//! engine-owned state starts with [`Scheduler::assert_on_thread`].

use rand::Rng;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::error;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the engine thread. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<Queues>,
    condvar: Condvar,
    engine_thread: Mutex<Option<ThreadId>>,
}

struct Queues {
    /// Jumps the line; used to answer in-flight work ahead of requeries.
    asap: VecDeque<Task>,
    ready: VecDeque<Task>,
    delayed: BinaryHeap<Delayed>,
    /// Tie-break so equal-deadline tasks keep submission order.
    seq: u64,
    shutdown: bool,
}

struct Delayed {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl Scheduler {
    /// Spawn the engine thread and return a handle to it.
    pub fn start() -> Scheduler {
        let shared = Arc::new(Shared {
            state: Mutex::new(Queues {
                asap: VecDeque::new(),
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
            engine_thread: Mutex::new(None),
        });
        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("pledge-engine".to_string())
            .spawn(move || engine_loop(loop_shared))
            .expect("failed to spawn engine thread");
        *shared.engine_thread.lock().unwrap() = Some(handle.thread().id());
        Scheduler { shared }
    }

    /// Enqueue a task; FIFO among ready tasks.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, task: F) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.ready.push_back(Box::new(task));
        self.shared.condvar.notify_one();
    }

    /// Enqueue a task ahead of regular tasks.
    pub fn submit_asap<F: FnOnce() + Send + 'static>(&self, task: F) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.asap.push_back(Box::new(task));
        self.shared.condvar.notify_one();
    }

    /// Run `task` after `delay` has elapsed.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, delay: Duration, task: F) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        let seq = state.seq;
        state.seq += 1;
        state.delayed.push(Delayed {
            due: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
        self.shared.condvar.notify_one();
    }

    /// Run `task` after `base` plus a random smear of up to `base`, the
    /// smear clamped to `max_jitter`. Spreads requeries so a fleet of
    /// clients does not stampede the network on every new block.
    pub fn schedule_jittered<F: FnOnce() + Send + 'static>(
        &self,
        base: Duration,
        max_jitter: Duration,
        task: F,
    ) {
        self.schedule(jittered(base, max_jitter), task);
    }

    /// Run `f` on the engine thread and return its value; runs inline when
    /// already there.
    pub fn run_on_thread<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.on_thread() {
            return f();
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.submit(move || {
            let _ = tx.send(f());
        });
        rx.recv().expect("engine thread terminated")
    }

    /// Whether the caller is the engine thread.
    pub fn on_thread(&self) -> bool {
        let engine = self.shared.engine_thread.lock().unwrap();
        *engine == Some(thread::current().id())
    }

    /// Panic unless invoked from the engine thread. Called defensively by
    /// every mutator of engine-owned state.
    #[track_caller]
    pub fn assert_on_thread(&self) {
        assert!(
            self.on_thread(),
            "engine-owned state touched from thread {:?}",
            thread::current().name().unwrap_or("?")
        );
    }

    /// Stop accepting tasks and let the engine drain what is queued.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        self.shared.condvar.notify_all();
    }
}

/// `base + random·base`, the random part clamped to `max_jitter`.
pub fn jittered(base: Duration, max_jitter: Duration) -> Duration {
    let smear = base.mul_f64(rand::rng().random_range(0.0..1.0));
    base + smear.min(max_jitter)
}

/// A uniformly random delay in `[0, max]`.
pub fn smear(max: Duration) -> Duration {
    max.mul_f64(rand::rng().random_range(0.0..1.0))
}

fn engine_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                let now = Instant::now();
                while state.delayed.peek().is_some_and(|d| d.due <= now) {
                    let due = state.delayed.pop().unwrap();
                    state.ready.push_back(due.task);
                }
                if let Some(task) = state.asap.pop_front() {
                    break task;
                }
                if let Some(task) = state.ready.pop_front() {
                    break task;
                }
                if state.shutdown {
                    return;
                }
                state = match state.delayed.peek().map(|d| d.due) {
                    Some(due) => {
                        let wait = due.saturating_duration_since(Instant::now());
                        shared.condvar.wait_timeout(state, wait).unwrap().0
                    }
                    None => shared.condvar.wait(state).unwrap(),
                };
            }
        };
        // A panic on the engine thread means an invariant has failed;
        // continuing would publish inconsistent state.
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task())) {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(target: "engine", "engine task panicked, aborting: {msg}");
            std::process::abort();
        }
    }
}
