// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bounded worker pool with cooperative suspension.
//!
//! The pool bounds the number of *running* rule bodies, not the number of
//! OS threads. A body that blocks on its dependencies first releases its
//! slot through [`Pool::blocking`], so ready work can always proceed; the
//! pool spawns replacement threads on demand. This is what keeps the build
//! deadlock-free when every worker is waiting on dependencies.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    /// Maximum number of concurrently *running* jobs.
    limit: usize,
    /// Jobs currently executing (not suspended in `blocking`).
    running: usize,
    /// Worker threads parked waiting for work.
    idle: usize,
    /// Jobs admitted but not yet started.
    queue: VecDeque<Job>,
    /// Live worker threads, joined on shutdown.
    handles: Vec<JoinHandle<()>>,
    /// Once set, workers drain the queue and exit.
    stop: bool,
}

/// Bounded-parallelism worker pool.
pub(crate) struct Pool {
    inner: Mutex<PoolInner>,
    work: Condvar,
}

impl Pool {
    /// Creates a pool that runs at most `limit` jobs at once.
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                limit: limit.max(1),
                running: 0,
                idle: 0,
                queue: VecDeque::new(),
                handles: Vec::new(),
                stop: false,
            }),
            work: Condvar::new(),
        })
    }

    /// Enqueues a job, spawning a worker thread if none is idle.
    pub(crate) fn spawn(self: &Arc<Self>, job: Job) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.stop {
            return;
        }
        inner.queue.push_back(job);
        if inner.idle == 0 {
            Self::add_worker(self, &mut inner);
        } else {
            self.work.notify_one();
        }
    }

    /// Runs `wait` with this worker's slot released, reacquiring it before
    /// returning. The only suspension point in the engine: rule bodies call
    /// this (through `apply`) while blocked on their dependencies.
    pub(crate) fn blocking<R>(self: &Arc<Self>, wait: impl FnOnce() -> R) -> R {
        {
            let Ok(mut inner) = self.inner.lock() else {
                return wait();
            };
            inner.running = inner.running.saturating_sub(1);
            // The freed slot may unblock queued work; make sure a thread
            // exists to claim it.
            if !inner.queue.is_empty() && inner.idle == 0 {
                Self::add_worker(self, &mut inner);
            }
        }
        self.work.notify_all();

        let out = wait();

        let Ok(mut inner) = self.inner.lock() else {
            return out;
        };
        while inner.running >= inner.limit {
            inner = match self.work.wait(inner) {
                Ok(guard) => guard,
                Err(_) => return out,
            };
        }
        inner.running += 1;
        out
    }

    /// Stops admitting work, drains the queue, and joins every worker.
    ///
    /// Callers must be quiescent (no job running or suspended) or the join
    /// would block; the engine guarantees that by waiting for the root
    /// `apply` to finish first.
    pub(crate) fn shutdown(self: &Arc<Self>) {
        let handles = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.stop = true;
            std::mem::take(&mut inner.handles)
        };
        self.work.notify_all();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Abandons the pool without joining, for the timeout path where
    /// in-flight IO must be left to finish naturally.
    pub(crate) fn abandon(self: &Arc<Self>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.stop = true;
            inner.handles.clear();
        }
        self.work.notify_all();
    }

    fn add_worker(pool: &Arc<Self>, inner: &mut PoolInner) {
        let pool = Arc::clone(pool);
        let handle = std::thread::spawn(move || pool.worker());
        inner.handles.push(handle);
    }

    fn worker(self: Arc<Self>) {
        loop {
            let job = {
                let Ok(mut inner) = self.inner.lock() else {
                    return;
                };
                loop {
                    if inner.stop && inner.queue.is_empty() {
                        return;
                    }
                    if !inner.queue.is_empty() && inner.running < inner.limit {
                        inner.running += 1;
                        break inner.queue.pop_front();
                    }
                    inner.idle += 1;
                    inner = match self.work.wait(inner) {
                        Ok(mut guard) => {
                            guard.idle = guard.idle.saturating_sub(1);
                            guard
                        }
                        Err(_) => return,
                    };
                }
            };
            if let Some(job) = job {
                job();
            }
            if let Ok(mut inner) = self.inner.lock() {
                inner.running = inner.running.saturating_sub(1);
            }
            self.work.notify_all();
        }
    }
}
