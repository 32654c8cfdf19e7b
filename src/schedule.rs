//! Background task scheduling.
//!
//! One worker thread services a pool of named tasks. A task handle
//! supports `activate` / `deactivate` / `schedule_after`; each task is
//! single-fire and re-arms itself at the end of its run, so a given task
//! never executes concurrently with itself.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// The function a task runs on each firing.
pub type TaskFn = Box<dyn Fn() + Send + Sync>;

struct TaskShared {
    name: String,
    func: TaskFn,
    active: AtomicBool,
    /// Bumped on every schedule/deactivate; stale heap entries are skipped.
    generation: AtomicU64,
}

struct QueueEntry {
    deadline: Instant,
    generation: u64,
    task: Arc<TaskShared>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Earliest deadline first: BinaryHeap is a max-heap.
        other.deadline.cmp(&self.deadline)
    }
}

#[derive(Default)]
struct PoolState {
    queue: BinaryHeap<QueueEntry>,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    wakeup: Condvar,
}

/// A pool with one worker thread executing scheduled tasks.
pub struct SchedulePool {
    inner: Arc<PoolInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulePool {
    /// Start the pool and its worker thread.
    pub fn new() -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState::default()),
            wakeup: Condvar::new(),
        });

        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("schedule-pool".to_string())
            .spawn(move || run_worker(worker_inner))
            .expect("failed to spawn schedule pool worker");

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Create a task. Tasks start deactivated.
    pub fn create_task(&self, name: impl Into<String>, func: TaskFn) -> TaskHandle {
        TaskHandle {
            shared: Arc::new(TaskShared {
                name: name.into(),
                func,
                active: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
            pool: self.inner.clone(),
        }
    }

    /// Stop the worker thread; pending tasks are discarded.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.queue.clear();
        }
        self.inner.wakeup.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Default for SchedulePool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SchedulePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SchedulePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulePool").finish()
    }
}

fn run_worker(inner: Arc<PoolInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let now = Instant::now();
                let next_deadline = state.queue.peek().map(|entry| entry.deadline);
                match next_deadline {
                    Some(deadline) if deadline <= now => {
                        let Some(entry) = state.queue.pop() else {
                            continue;
                        };
                        // Stale or deactivated entries are dropped here.
                        if entry.generation != entry.task.generation.load(Ordering::SeqCst)
                            || !entry.task.active.load(Ordering::SeqCst)
                        {
                            continue;
                        }
                        break entry.task;
                    }
                    Some(deadline) => {
                        inner.wakeup.wait_until(&mut state, deadline);
                    }
                    None => {
                        inner.wakeup.wait(&mut state);
                    }
                }
            }
        };

        debug!(task = %task.name, "running scheduled task");
        (task.func)();
    }
}

/// Handle to a scheduled task.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
    pool: Arc<PoolInner>,
}

impl TaskHandle {
    /// Allow the task to fire.
    pub fn activate(&self) {
        self.shared.active.store(true, Ordering::SeqCst);
    }

    /// Prevent further firings and invalidate anything already queued.
    pub fn deactivate(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Schedule one firing after `delay`, replacing any pending schedule.
    pub fn schedule_after(&self, delay: Duration) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.pool.state.lock();
            if state.shutdown {
                return;
            }
            state.queue.push(QueueEntry {
                deadline: Instant::now() + delay,
                generation,
                task: self.shared.clone(),
            });
        }
        self.pool.wakeup.notify_all();
    }

    /// The task's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the task may currently fire.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .field("active", &self.is_active())
            .finish()
    }
}
