//! Fixed worker pool executing HTTP connection state transitions.
//!
//! The reactor enqueues tagged tasks onto a bounded channel; `append`
//! refuses rather than blocks when the queue is full, pushing back-pressure
//! onto the accept path. Each worker drives the connection it received,
//! then reports the token on the completion channel and wakes the reactor,
//! which re-arms or closes the socket. Ownership of a connection therefore
//! alternates strictly between the reactor and at most one worker.
//!
//! The actor model decides which tags the reactor produces: under the
//! default (workers perform I/O) readiness becomes `ReadReady`/`WriteReady`
//! tasks; when the reactor performs I/O itself, workers only ever see
//! `Process`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, warn};
use mio::{Token, Waker};

use crate::connection::{HttpConnection, WriteOutcome};
use crate::db::DbPool;

/// Shared handle to one connection; the mutex hands the record to exactly
/// one thread at a time.
pub type SharedConn = Arc<Mutex<HttpConnection>>;

/// A unit of work, tagged with the readiness that produced it.
pub enum Task {
    /// The socket became readable; the worker reads, then processes.
    ReadReady(SharedConn),
    /// The socket became writable; the worker flushes the response.
    WriteReady(SharedConn),
    /// The reactor already performed the I/O; only process.
    Process(SharedConn),
}

/// Locks a connection, riding over a poisoning panic from a previous
/// holder; the record's own state decides what happens next.
pub fn lock_conn(conn: &SharedConn) -> std::sync::MutexGuard<'_, HttpConnection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The pool of HTTP workers.
pub struct WorkerPool {
    queue: Option<Sender<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers consuming a queue of `queue_capacity` tasks.
    ///
    /// Completions are reported through `done` and `waker`, which the
    /// reactor owns.
    pub fn new(
        count: usize,
        queue_capacity: usize,
        db: DbPool,
        done: Sender<Token>,
        waker: Arc<Waker>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Task>(queue_capacity);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let rx = rx.clone();
            let db = db.clone();
            let done = done.clone();
            let waker = Arc::clone(&waker);
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker_loop(&rx, &db, &done, &waker))?;
            handles.push(handle);
        }
        Ok(Self {
            queue: Some(tx),
            handles,
        })
    }

    /// Enqueues a task; false when the queue is at capacity or shut down.
    pub fn append(&self, task: Task) -> bool {
        match &self.queue {
            Some(queue) => queue.try_send(task).is_ok(),
            None => false,
        }
    }

    /// Stops intake and, when `drain` is set, waits for the workers to
    /// finish the backlog; otherwise the threads are left to the OS.
    pub fn shutdown(&mut self, drain: bool) {
        self.queue = None;
        if drain {
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
        } else {
            self.handles.clear();
        }
    }
}

fn worker_loop(rx: &Receiver<Task>, db: &DbPool, done: &Sender<Token>, waker: &Waker) {
    // recv fails only once the reactor dropped the queue; pending tasks are
    // still delivered before that, so shutdown drains.
    while let Ok(task) = rx.recv() {
        let conn = match &task {
            Task::ReadReady(c) | Task::WriteReady(c) | Task::Process(c) => Arc::clone(c),
        };
        let token = lock_conn(&conn).token();

        let run = catch_unwind(AssertUnwindSafe(|| handle(task, db)));
        if run.is_err() {
            error!("worker task for {token:?} panicked, closing the connection");
            lock_conn(&conn).set_closing();
        }

        // both ends disappear only during teardown
        if done.send(token).is_err() {
            return;
        }
        if let Err(err) = waker.wake() {
            warn!("failed to wake the reactor: {err}");
        }
    }
}

/// Executes one task against its connection.
fn handle(task: Task, db: &DbPool) {
    match task {
        Task::ReadReady(conn) => {
            let mut conn = lock_conn(&conn);
            match conn.read_once() {
                Ok(true) => {
                    let mut lease = db.acquire();
                    conn.process(Some(&mut *lease));
                }
                Ok(false) => conn.set_closing(),
                Err(err) => {
                    debug!("read from {} failed: {err}", conn.peer());
                    conn.set_closing();
                }
            }
        }
        Task::WriteReady(conn) => {
            let mut conn = lock_conn(&conn);
            if conn.write() == WriteOutcome::Closed {
                conn.set_closing();
            }
        }
        Task::Process(conn) => {
            let mut conn = lock_conn(&conn);
            let mut lease = db.acquire();
            conn.process(Some(&mut *lease));
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use clap::Parser;
    use mio::{Poll, Token, Waker};

    use crate::config::{Config, TriggerMode};
    use crate::connection::{ConnContext, HttpConnection};
    use crate::db::DbPool;

    use super::{Task, WorkerPool};

    fn shared_conn(ctx: &Arc<ConnContext>) -> (super::SharedConn, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = HttpConnection::new(
            Token(0),
            mio::net::TcpStream::from_std(server),
            peer,
            Arc::clone(ctx),
        );
        (Arc::new(Mutex::new(conn)), client)
    }

    #[test]
    fn append_refuses_past_queue_capacity() {
        // zero workers and an empty pool: nothing consumes the queue
        let cfg = Config::parse_from(["kvikk"]);
        let db = DbPool::connect(&cfg, 0).unwrap();
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(usize::MAX - 2)).unwrap());
        let (done_tx, _done_rx) = crossbeam_channel::unbounded();
        let mut pool = WorkerPool::new(0, 2, db, done_tx, waker).unwrap();

        let ctx = Arc::new(ConnContext {
            doc_root: PathBuf::from("."),
            users: Mutex::new(HashMap::new()),
            trigger: TriggerMode::Edge,
        });
        let (first, _c1) = shared_conn(&ctx);
        let (second, _c2) = shared_conn(&ctx);
        let (third, _c3) = shared_conn(&ctx);

        assert!(pool.append(Task::Process(first)));
        assert!(pool.append(Task::Process(second)));
        assert!(!pool.append(Task::Process(third)), "queue should be full");

        pool.shutdown(true);
    }

    #[test]
    fn append_after_shutdown_is_refused() {
        let cfg = Config::parse_from(["kvikk"]);
        let db = DbPool::connect(&cfg, 0).unwrap();
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(usize::MAX - 2)).unwrap());
        let (done_tx, _done_rx) = crossbeam_channel::unbounded();
        let mut pool = WorkerPool::new(0, 4, db, done_tx, waker).unwrap();
        pool.shutdown(true);

        let ctx = Arc::new(ConnContext {
            doc_root: PathBuf::from("."),
            users: Mutex::new(HashMap::new()),
            trigger: TriggerMode::Edge,
        });
        let (conn, _client) = shared_conn(&ctx);
        assert!(!pool.append(Task::Process(conn)));
    }
}
