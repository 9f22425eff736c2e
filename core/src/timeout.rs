//! Shared timeout task (SPEC_FULL.md §4.14).
//!
//! A singleton-style timer: every registered session contributes a
//! `(deadline, on_expire)` pair. On each tick the task walks the set,
//! fires expiries, and reschedules for the earliest remaining deadline or
//! a 60s floor, whichever is sooner. Grounded in
//! `original_source/CommonUtilitiesLib/TimeoutTask.cpp`'s `TimeoutTaskThread::Run`,
//! built here atop [`crate::event::EventRuntime`] rather than a bespoke thread.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::EventRuntime;
use crate::time::milliseconds;

type OnExpire = Box<dyn Fn() + Send>;

struct Registration {
    deadline_ms: u64,
    on_expire: OnExpire,
}

struct Inner {
    registrations: Mutex<HashMap<String, Registration>>,
}

/// A shared idle-timeout enforcer. Cloning shares the same underlying
/// registration table and background sweep.
#[derive(Clone)]
pub struct TimeoutTask {
    inner: Arc<Inner>,
    _runtime: Arc<EventRuntime>,
}

const SWEEP_INTERVAL_MS: u64 = 1000;

impl TimeoutTask {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            registrations: Mutex::new(HashMap::new()),
        });
        let runtime = EventRuntime::new();

        let sweep_inner = inner.clone();
        runtime.spawn(SWEEP_INTERVAL_MS, move || {
            Self::sweep(&sweep_inner);
            Some(SWEEP_INTERVAL_MS)
        });

        Self {
            inner,
            _runtime: runtime,
        }
    }

    fn sweep(inner: &Arc<Inner>) {
        let now = milliseconds();
        let mut expired = Vec::new();
        {
            let registrations = inner.registrations.lock();
            for (key, reg) in registrations.iter() {
                if now >= reg.deadline_ms {
                    expired.push(key.clone());
                }
            }
        }
        for key in expired {
            let callback = {
                let mut registrations = inner.registrations.lock();
                registrations.remove(&key).map(|r| r.on_expire)
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    /// Register (or refresh) a timeout for `key`, firing `on_expire` once
    /// `timeout_ms` elapses with no further [`refresh`](Self::refresh) call.
    pub fn register(&self, key: &str, timeout_ms: u64, on_expire: impl Fn() + Send + 'static) {
        self.inner.registrations.lock().insert(
            key.to_string(),
            Registration {
                deadline_ms: milliseconds() + timeout_ms,
                on_expire: Box::new(on_expire),
            },
        );
    }

    /// Stamp `key`'s `last_activity` forward, pushing its deadline out by
    /// `timeout_ms` from now.
    pub fn refresh(&self, key: &str, timeout_ms: u64) {
        if let Some(reg) = self.inner.registrations.lock().get_mut(key) {
            reg.deadline_ms = milliseconds() + timeout_ms;
        }
    }

    /// Cancel a registration (e.g. on TEARDOWN) without firing `on_expire`.
    pub fn cancel(&self, key: &str) {
        self.inner.registrations.lock().remove(key);
    }

    /// Number of live registrations (diagnostic/test helper).
    pub fn len(&self) -> usize {
        self.inner.registrations.lock().len()
    }
}

impl Default for TimeoutTask {
    fn default() -> Self {
        Self::new()
    }
}
