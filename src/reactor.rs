//! The single-threaded I/O reactor.
//!
//! One `Poll` multiplexes the listening socket, every client socket, the
//! signal pipe, and the worker completion waker. Client sockets are handed
//! to workers through the bounded task queue; while a task is in flight the
//! connection's `in_flight` flag makes the reactor drop further readiness
//! for it, and the completion path re-arms interest with `reregister`,
//! which re-raises a still-pending edge. That pairing is the one-shot
//! discipline: a connection is owned by the reactor or by one worker,
//! never both.
//!
//! `SIGALRM` and `SIGTERM` arrive through the signal adapter's pipe as
//! ordinary readiness events, serializing timer ticks and shutdown with
//! the rest of the loop. The alarm is re-armed after every tick.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver};
use log::{debug, info, warn};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use signal_hook::consts::{SIGALRM, SIGTERM};
use signal_hook_mio::v0_8::Signals;
use slab::Slab;

use crate::config::{ActorMode, Config, TriggerMode};
use crate::connection::{ConnContext, HttpConnection, WriteOutcome};
use crate::db::DbPool;
use crate::error::ServerError;
use crate::timer::TimerList;
use crate::worker::{lock_conn, SharedConn, Task, WorkerPool};

const LISTEN_TOKEN: Token = Token(usize::MAX);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);
const WAKE_TOKEN: Token = Token(usize::MAX - 2);
const NUM_EVENTS: usize = 1024;

/// Idle timeout is this many alarm periods.
const EXPIRE_SLOTS: u64 = 3;

/// The event demultiplexer and owner of all connection state.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    signals: Signals,
    connections: Slab<SharedConn>,
    timers: TimerList,
    workers: WorkerPool,
    done_rx: Receiver<Token>,
    ctx: Arc<ConnContext>,
    actor: ActorMode,
    listen_trigger: TriggerMode,
    timeslot: u64,
    graceful: bool,
    running: bool,
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Reactor {
    /// Binds the listen socket, installs the signal adapter and waker, and
    /// spawns the worker pool.
    pub fn new(cfg: &Config, db: DbPool, users: HashMap<String, String>) -> Result<Self, ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
        let mut listener = TcpListener::bind(addr)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;

        let mut signals = Signals::new([SIGALRM, SIGTERM])?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (done_tx, done_rx) = unbounded();

        let ctx = Arc::new(ConnContext {
            doc_root: cfg.doc_root.clone(),
            users: Mutex::new(users),
            trigger: cfg.conn_trigger,
        });
        let workers = WorkerPool::new(cfg.workers, cfg.queue_capacity, db, done_tx, waker)?;

        Ok(Self {
            poll,
            listener,
            signals,
            connections: Slab::new(),
            timers: TimerList::new(),
            workers,
            done_rx,
            ctx,
            actor: cfg.actor_model,
            listen_trigger: cfg.listen_trigger,
            timeslot: cfg.timeslot,
            graceful: cfg.graceful_close,
            running: true,
        })
    }

    /// Runs the event loop until `SIGTERM`, then tears down.
    pub fn run(&mut self) -> io::Result<()> {
        // broken pipes surface as write errors instead of killing the process
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        unsafe { libc::alarm(self.timeslot as libc::c_uint) };

        if let Ok(addr) = self.listener.local_addr() {
            info!("listening on {addr}");
        }

        let mut events = Events::with_capacity(NUM_EVENTS);
        while self.running {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept(),
                    SIGNAL_TOKEN => self.handle_signals(),
                    WAKE_TOKEN => self.drain_completions(),
                    token => self.dispatch(token, event),
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let entry = self.connections.vacant_entry();
                    let token = Token(entry.key());
                    let mut conn = HttpConnection::new(token, stream, peer, Arc::clone(&self.ctx));
                    if let Err(err) = conn.register(self.poll.registry(), Interest::READABLE) {
                        warn!("failed to register {peer}: {err}");
                        continue;
                    }
                    let handle = self
                        .timers
                        .add(token, epoch_secs() + EXPIRE_SLOTS * self.timeslot);
                    conn.set_timer(handle);
                    entry.insert(Arc::new(Mutex::new(conn)));
                    info!("accepted connection from {peer}, {} live", self.connections.len());
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed: {err}");
                    break;
                }
            }
            if self.listen_trigger == TriggerMode::Level {
                // one accept per event; a MOD re-raises readiness if more wait
                let _ = self.poll.registry().reregister(
                    &mut self.listener,
                    LISTEN_TOKEN,
                    Interest::READABLE,
                );
                break;
            }
        }
    }

    fn handle_signals(&mut self) {
        let pending: Vec<i32> = self.signals.pending().collect();
        for signal in pending {
            match signal {
                SIGALRM => self.tick(),
                SIGTERM => {
                    info!("SIGTERM received, beginning shutdown");
                    self.running = false;
                }
                _ => {}
            }
        }
    }

    /// Closes every connection whose timer expired, then re-arms the alarm.
    fn tick(&mut self) {
        let expired = self.timers.tick(epoch_secs());
        for token in expired {
            let in_flight = match self.connections.get(token.0) {
                Some(conn) => {
                    let mut locked = lock_conn(conn);
                    // the list already freed the node
                    locked.take_timer();
                    locked.set_closing();
                    locked.in_flight()
                }
                None => continue,
            };
            if in_flight {
                // a worker owns it; the completion path performs the close
                debug!("connection {} expired in flight", token.0);
            } else {
                info!("closing idle connection {}", token.0);
                self.close(token);
            }
        }
        unsafe { libc::alarm(self.timeslot as libc::c_uint) };
    }

    /// Worker hand-back: clear the flight flag, extend the timer, re-arm.
    fn drain_completions(&mut self) {
        while let Ok(token) = self.done_rx.try_recv() {
            let Some(conn) = self.connections.get(token.0) else {
                continue;
            };
            let conn = Arc::clone(conn);
            lock_conn(&conn).set_in_flight(false);
            self.extend_and_rearm(&conn, token);
        }
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        let Some(entry) = self.connections.get(token.0) else {
            return;
        };
        let conn = Arc::clone(entry);

        if lock_conn(&conn).in_flight() {
            // a worker owns the record; the completion re-register will
            // surface anything still pending on the socket
            return;
        }

        if event.is_error() {
            lock_conn(&conn).set_closing();
            self.close(token);
            return;
        }

        if event.is_readable() {
            self.on_readable(conn, token);
        } else if event.is_writable() {
            self.on_writable(conn, token);
        }
    }

    fn on_readable(&mut self, conn: SharedConn, token: Token) {
        match self.actor {
            ActorMode::Proactor => {
                lock_conn(&conn).set_in_flight(true);
                self.submit(Task::ReadReady(Arc::clone(&conn)), &conn, token);
            }
            ActorMode::Simple => {
                let outcome = lock_conn(&conn).read_once();
                match outcome {
                    Ok(true) => {
                        lock_conn(&conn).set_in_flight(true);
                        self.submit(Task::Process(Arc::clone(&conn)), &conn, token);
                    }
                    Ok(false) => {
                        lock_conn(&conn).set_closing();
                        self.close(token);
                    }
                    Err(err) => {
                        debug!("read on connection {} failed: {err}", token.0);
                        lock_conn(&conn).set_closing();
                        self.close(token);
                    }
                }
            }
        }
    }

    fn on_writable(&mut self, conn: SharedConn, token: Token) {
        match self.actor {
            ActorMode::Proactor => {
                lock_conn(&conn).set_in_flight(true);
                self.submit(Task::WriteReady(Arc::clone(&conn)), &conn, token);
            }
            ActorMode::Simple => {
                let outcome = lock_conn(&conn).write();
                if outcome == WriteOutcome::Closed {
                    lock_conn(&conn).set_closing();
                    self.close(token);
                } else {
                    self.extend_and_rearm(&conn, token);
                }
            }
        }
    }

    /// Queue rejection is back-pressure: the connection is dropped rather
    /// than blocking the reactor.
    fn submit(&mut self, task: Task, conn: &SharedConn, token: Token) {
        if !self.workers.append(task) {
            warn!("task queue full, closing connection {}", token.0);
            let mut locked = lock_conn(conn);
            locked.set_in_flight(false);
            locked.set_closing();
            drop(locked);
            self.close(token);
        }
    }

    /// Extends the idle timer, then re-arms readiness; the order upholds
    /// the contract that a timer never lags a live re-registration.
    fn extend_and_rearm(&mut self, conn: &SharedConn, token: Token) {
        let mut locked = lock_conn(conn);
        match locked.interest() {
            None => {
                drop(locked);
                self.close(token);
            }
            Some(interest) => {
                if let Some(handle) = locked.timer() {
                    self.timers
                        .adjust(handle, epoch_secs() + EXPIRE_SLOTS * self.timeslot);
                }
                if let Err(err) = locked.reregister(self.poll.registry(), interest) {
                    debug!("re-arm of connection {} failed: {err}", token.0);
                    locked.set_closing();
                    drop(locked);
                    self.close(token);
                }
            }
        }
    }

    /// Removes the connection from the poll set and the timer list; the
    /// socket closes when the last task reference drops.
    fn close(&mut self, token: Token) {
        if let Some(conn) = self.connections.try_remove(token.0) {
            let mut locked = lock_conn(&conn);
            if let Some(handle) = locked.take_timer() {
                self.timers.remove(handle);
            }
            if let Err(err) = locked.deregister(self.poll.registry()) {
                debug!("deregister of connection {} failed: {err}", token.0);
            }
            info!(
                "closed connection from {}, {} live",
                locked.peer(),
                self.connections.len()
            );
        }
    }

    fn shutdown(&mut self) {
        unsafe { libc::alarm(0) };
        let _ = self.poll.registry().deregister(&mut self.listener);
        info!(
            "shutdown: draining workers ({} connections live)",
            self.connections.len()
        );
        self.workers.shutdown(self.graceful);

        let tokens: Vec<Token> = self.connections.iter().map(|(key, _)| Token(key)).collect();
        for token in tokens {
            self.close(token);
        }
        let _ = self.poll.registry().deregister(&mut self.signals);
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::net::TcpStream;

    use clap::Parser;

    use crate::config::Config;
    use crate::db::DbPool;

    use super::Reactor;

    fn test_reactor() -> Reactor {
        // port 0 binds an ephemeral port; zero workers keep the pool inert
        let cfg = Config::parse_from(["kvikk", "--port", "0", "--workers", "0"]);
        let db = DbPool::connect(&cfg, 0).unwrap();
        Reactor::new(&cfg, db, Default::default()).unwrap()
    }

    #[test]
    fn accept_registers_connection_and_timer() {
        let mut reactor = test_reactor();
        let addr = reactor.listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        // the listener is non-blocking; poll until the connection lands
        for _ in 0..200 {
            reactor.accept();
            if !reactor.connections.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(1, reactor.connections.len());
        assert_eq!(1, reactor.timers.len());
    }

    #[test]
    fn expired_timer_closes_the_connection() {
        let mut reactor = test_reactor();
        let addr = reactor.listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        for _ in 0..200 {
            reactor.accept();
            if !reactor.connections.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(1, reactor.connections.len());

        // pretend three timeslots elapsed
        let expired = reactor.timers.tick(super::epoch_secs() + 100);
        assert_eq!(1, expired.len());
        for token in expired {
            reactor.close(token);
        }
        assert!(reactor.connections.is_empty());
        assert!(reactor.timers.is_empty());
    }

    #[test]
    fn close_is_idempotent_for_stale_tokens() {
        let mut reactor = test_reactor();
        reactor.close(mio::Token(17));
        assert!(reactor.connections.is_empty());
    }
}
