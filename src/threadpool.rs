//! Generic thread pool with a supervising manager thread.
//!
//! Workers block on a condition variable over a FIFO job queue. A manager
//! samples queue depth and worker counts every five seconds, spawning up to
//! two workers when the backlog outgrows the live set and retiring up to
//! two idle workers when fewer than half of them are busy. Retirement is
//! cooperative: the manager raises an exit allowance and broadcasts, and
//! that many workers leave on their next wake-up.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Manager sampling period.
const MANAGE_INTERVAL: Duration = Duration::from_secs(5);
/// Workers spawned or retired per adjustment.
const ADJUST_STEP: usize = 2;

/// Dynamically sized pool executing boxed jobs.
pub struct ThreadPool {
    shared: Arc<Shared>,
    manager: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    not_empty: Condvar,
    /// Wakes the manager early on shutdown.
    manage_tick: Condvar,
    min: usize,
    max: usize,
}

struct State {
    queue: VecDeque<Job>,
    alive: usize,
    busy: usize,
    exit_pending: usize,
    shutdown: bool,
    workers: Vec<JoinHandle<()>>,
}

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ThreadPool {
    /// Starts `min` workers plus the manager; the pool may grow to `max`.
    pub fn new(min: usize, max: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                alive: 0,
                busy: 0,
                exit_pending: 0,
                shutdown: false,
                workers: Vec::with_capacity(max),
            }),
            not_empty: Condvar::new(),
            manage_tick: Condvar::new(),
            min,
            max,
        });

        for _ in 0..min {
            spawn_worker(&shared);
        }
        let manager = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("pool-manager".into())
                .spawn(move || manager_loop(&shared))
                .ok()
        };

        Self { shared, manager }
    }

    /// Queues a job; silently discarded after shutdown began.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = lock(&self.shared);
        if state.shutdown {
            return;
        }
        state.queue.push_back(Box::new(job));
        drop(state);
        self.shared.not_empty.notify_one();
    }

    /// Workers currently alive (idle or busy).
    pub fn alive_count(&self) -> usize {
        lock(&self.shared).alive
    }

    /// Workers currently running a job.
    pub fn busy_count(&self) -> usize {
        lock(&self.shared).busy
    }

    /// Jobs waiting in the queue.
    pub fn queued_count(&self) -> usize {
        lock(&self.shared).queue.len()
    }
}

impl Drop for ThreadPool {
    /// Graceful teardown: stop intake, let workers drain the queue, then
    /// join the manager and every worker.
    fn drop(&mut self) {
        {
            let mut state = lock(&self.shared);
            state.shutdown = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.manage_tick.notify_all();

        if let Some(manager) = self.manager.take() {
            let _ = manager.join();
        }
        let workers = {
            let mut state = lock(&self.shared);
            std::mem::take(&mut state.workers)
        };
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn spawn_worker(shared: &Arc<Shared>) {
    let cloned = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name("pool-worker".into())
        .spawn(move || worker_loop(&cloned));
    match spawned {
        Ok(handle) => {
            let mut state = lock(shared);
            state.alive += 1;
            state.workers.push(handle);
        }
        Err(err) => error!("failed to spawn pool worker: {err}"),
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let mut state = lock(shared);

        while state.queue.is_empty() && !state.shutdown {
            state = shared
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);

            if state.exit_pending > 0 {
                state.exit_pending -= 1;
                if state.alive > shared.min {
                    state.alive -= 1;
                    debug!("pool worker retiring, {} remain", state.alive);
                    return;
                }
            }
        }

        if state.shutdown && state.queue.is_empty() {
            state.alive -= 1;
            return;
        }

        let Some(job) = state.queue.pop_front() else {
            continue;
        };
        state.busy += 1;
        drop(state);

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("pool job panicked");
        }

        lock(shared).busy -= 1;
    }
}

fn manager_loop(shared: &Arc<Shared>) {
    loop {
        {
            // sleep through the interval, but leave promptly on shutdown
            let state = lock(shared);
            if state.shutdown {
                return;
            }
            let (state, _) = shared
                .manage_tick
                .wait_timeout(state, MANAGE_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            if state.shutdown {
                return;
            }
        }

        let (queued, alive, busy) = {
            let state = lock(shared);
            (state.queue.len(), state.alive, state.busy)
        };

        if queued > alive && alive < shared.max {
            let growth = ADJUST_STEP.min(shared.max - alive);
            debug!("pool backlog {queued} over {alive} workers, adding {growth}");
            for _ in 0..growth {
                spawn_worker(shared);
            }
        }

        if busy * 2 < alive && alive > shared.min {
            let mut state = lock(shared);
            state.exit_pending = ADJUST_STEP;
            drop(state);
            debug!("pool mostly idle ({busy}/{alive}), retiring {ADJUST_STEP}");
            shared.not_empty.notify_all();
        }
    }
}
