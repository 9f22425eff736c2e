//! Cooperative timer-task scheduler (SPEC_FULL.md §4.2, §5).
//!
//! The full event-runtime contract in SPEC_FULL.md (`spawn`/`request_event`/
//! `signal`/`idle_timer`, driving socket readiness *and* timeouts across a
//! worker pool) is realized narrowly here: RTSP signaling itself stays on
//! the teacher's thread-per-connection model (see DESIGN.md), so the only
//! piece of "cooperative scheduler" this crate actually needs is a shared
//! timer queue for the two genuinely periodic actors, the idle-timeout
//! sweep (C14) and the reflector housekeeping tick (C12). This is that
//! queue, grounded in `original_source/CommonUtilitiesLib/TimeoutTask.cpp`'s
//! `TimeoutTaskThread`: a background thread parked on a condvar until the
//! next deadline, re-evaluating the whole queue on each wake.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::time::milliseconds;

type TaskFn = Box<dyn FnMut() -> Option<u64> + Send>;

struct ScheduledTask {
    deadline_ms: u64,
    id: u64,
    task: TaskFn,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.id == other.id
    }
}
impl Eq for ScheduledTask {}
impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline_ms.cmp(&other.deadline_ms).then(self.id.cmp(&other.id))
    }
}

/// A background worker driving a priority queue of recurring/one-shot
/// timer tasks. Each task, when run, returns the delay in ms until its
/// next run (`spawn`'s contract: a next-wakeup delay, or `None` to
/// self-destruct, mirroring SPEC_FULL.md §4.2's `-1`/`0`/`N` return values).
pub struct EventRuntime {
    heap: Arc<Mutex<BinaryHeap<Reverse<ScheduledTask>>>>,
    condvar: Arc<Condvar>,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Ceiling on how long the worker ever sleeps with an empty queue,
    /// matching the timeout task's 60s floor (SPEC_FULL.md §4.14, §9).
    idle_floor_ms: u64,
}

impl EventRuntime {
    pub fn new() -> Arc<Self> {
        Self::with_idle_floor(Duration::from_secs(60))
    }

    pub fn with_idle_floor(idle_floor: Duration) -> Arc<Self> {
        let runtime = Arc::new(Self {
            heap: Arc::new(Mutex::new(BinaryHeap::new())),
            condvar: Arc::new(Condvar::new()),
            next_id: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(true)),
            handle: Mutex::new(None),
            idle_floor_ms: idle_floor.as_millis() as u64,
        });
        runtime.clone().spawn_worker();
        runtime
    }

    fn spawn_worker(self: Arc<Self>) {
        let heap = self.heap.clone();
        let condvar = self.condvar.clone();
        let running = self.running.clone();
        let idle_floor_ms = self.idle_floor_ms;

        let join = std::thread::spawn(move || {
            // The mutex is only ever used as the condvar's pair; a no-op
            // dummy guard is all `wait_for` needs.
            let gate = Mutex::new(());
            while running.load(Ordering::SeqCst) {
                let now = milliseconds();
                let next_deadline = {
                    let mut queue = heap.lock();
                    while let Some(Reverse(top)) = queue.peek() {
                        if top.deadline_ms > now {
                            break;
                        }
                        let Reverse(mut due) = queue.pop().unwrap();
                        drop(queue);
                        if let Some(delay) = (due.task)() {
                            due.deadline_ms = milliseconds() + delay;
                            heap.lock().push(Reverse(due));
                        }
                        queue = heap.lock();
                    }
                    queue.peek().map(|Reverse(t)| t.deadline_ms)
                };

                let sleep_ms = match next_deadline {
                    Some(deadline) => deadline.saturating_sub(milliseconds()).max(1),
                    None => idle_floor_ms,
                };

                let mut guard = gate.lock();
                condvar.wait_for(&mut guard, Duration::from_millis(sleep_ms.min(idle_floor_ms)));
            }
        });

        *self.handle.lock() = Some(join);
    }

    /// Enqueue a recurring/one-shot task whose first run fires in
    /// `initial_delay_ms`. The closure returns `Some(next_delay_ms)` to be
    /// rescheduled, or `None` to self-destruct (SPEC_FULL.md §4.2).
    pub fn spawn(&self, initial_delay_ms: u64, task: impl FnMut() -> Option<u64> + Send + 'static) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let deadline_ms = milliseconds() + initial_delay_ms;
        self.heap.lock().push(Reverse(ScheduledTask {
            deadline_ms,
            id,
            task: Box::new(task),
        }));
        self.condvar.notify_all();
    }

    /// Stop the background worker. Idempotent.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.condvar.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
