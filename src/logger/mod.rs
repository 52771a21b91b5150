//! Asynchronous multi-buffer log pipeline.
//!
//! Producers format a line, take one mutex over the buffer ring, copy the
//! line into the current cell, and return; no disk I/O ever happens on a
//! calling thread in async mode. A dedicated background thread persists
//! sealed cells to dated, size-rotated files.
//!
//! The ring is a circular doubly-linked list of fixed cells addressed by
//! slab keys. The producer cursor `curr` marks the single writable cell;
//! the consumer cursor `prst` marks the next cell to persist and never
//! passes `curr` except through a sealed cell. When `curr` fills and its
//! successor is still unpersisted, a fresh cell is spliced in between,
//! bounded by a total memory cap; past the cap, lines are dropped and a
//! suppression window keeps the producers from spinning on retries.

mod cell;
mod clock;
mod file;

use std::io::Write;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{LevelFilter, Metadata, Record};
use slab::Slab;

use crate::config::LogMode;
use crate::error::ServerError;

use cell::{CellBuffer, CellStatus};
use clock::Clock;
use file::LogFile;

/// Capacity of one ring cell.
const ONE_BUFF_LEN: usize = 30 * 1024 * 1024;
/// Cells allocated up front.
const INITIAL_CELLS: usize = 3;
/// Hard cap on total ring memory; growth stops here.
const MEM_USE_LIMIT: usize = 3 * 1024 * 1024 * 1024;
/// A single line is truncated past this.
const LINE_LIMIT: usize = 4 * 1024;
/// Seconds of silence after a memory-pressure drop.
const RELOG_THRESHOLD: i64 = 5;
/// Consumer condvar timeout; bounds worst-case flush latency.
const BUFF_WAIT: Duration = Duration::from_secs(1);

static LOGGER: OnceLock<RingLogger> = OnceLock::new();

/// Installs the process-wide ring logger and starts its consumer thread.
///
/// An unparsable `level` falls back to `info`, mirroring the clamp the
/// original level knob applied. Fails if a logger is already installed.
pub fn init(dir: &Path, prog: &str, level: &str, mode: LogMode) -> Result<(), ServerError> {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    LOGGER
        .set(RingLogger::new(dir, prog, level, mode))
        .map_err(|_| ServerError::LoggerInit)?;
    let Some(logger) = LOGGER.get() else {
        return Err(ServerError::LoggerInit);
    };
    logger.start()?;
    log::set_logger(logger).map_err(|_| ServerError::LoggerInit)?;
    log::set_max_level(level);
    Ok(())
}

/// Drains the ring and joins the consumer thread, if a logger was installed.
pub fn shutdown() {
    if let Some(logger) = LOGGER.get() {
        logger.shutdown();
    }
}

/// The ring logger; implements [`log::Log`].
#[derive(Debug)]
pub struct RingLogger {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<Ring>,
    cond: Condvar,
    drained: Condvar,
    clock: Mutex<Clock>,
    file: Mutex<LogFile>,
    level: LevelFilter,
    mode: LogMode,
    stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Ring {
    cells: Slab<CellBuffer>,
    /// Producer cursor: the one cell accepting appends.
    curr: usize,
    /// Consumer cursor: the next cell to persist.
    prst: usize,
    cell_len: usize,
    mem_limit: usize,
    /// Epoch seconds of the last drop; non-zero opens the suppression window.
    last_drop: i64,
    dropped: u64,
}

impl Ring {
    fn new(cell_len: usize, cell_count: usize, mem_limit: usize) -> Self {
        let mut cells = Slab::with_capacity(cell_count);
        let keys: Vec<usize> = (0..cell_count)
            .map(|_| cells.insert(CellBuffer::new(cell_len)))
            .collect();
        for (i, &key) in keys.iter().enumerate() {
            cells[key].prev = keys[(i + cell_count - 1) % cell_count];
            cells[key].next = keys[(i + 1) % cell_count];
        }
        Self {
            cells,
            curr: keys[0],
            prst: keys[0],
            cell_len,
            mem_limit,
            last_drop: 0,
            dropped: 0,
        }
    }

    fn drained(&self) -> bool {
        let prst = &self.cells[self.prst];
        prst.status == CellStatus::Free && prst.is_empty()
    }
}

fn relock<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

fn level_tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "[ERROR]",
        log::Level::Warn => "[WARN]",
        log::Level::Info => "[INFO]",
        log::Level::Debug => "[DEBUG]",
        log::Level::Trace => "[TRACE]",
    }
}

fn tid() -> u64 {
    thread_local! {
        static TID: u64 = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
    }
    TID.with(|t| *t)
}

/// Refreshes the clock cache and reads the calendar date for file naming.
fn current_date(inner: &Inner) -> (i32, u32, u32) {
    let mut clock = relock(inner.clock.lock());
    clock.stamp();
    clock.date()
}

impl RingLogger {
    /// Builds a logger with production-sized buffers.
    pub fn new(dir: &Path, prog: &str, level: LevelFilter, mode: LogMode) -> Self {
        Self::with_options(
            dir,
            prog,
            level,
            mode,
            ONE_BUFF_LEN,
            INITIAL_CELLS,
            MEM_USE_LIMIT,
        )
    }

    pub(crate) fn with_options(
        dir: &Path,
        prog: &str,
        level: LevelFilter,
        mode: LogMode,
        cell_len: usize,
        cell_count: usize,
        mem_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Ring::new(cell_len, cell_count, mem_limit)),
                cond: Condvar::new(),
                drained: Condvar::new(),
                clock: Mutex::new(Clock::new()),
                file: Mutex::new(LogFile::new(dir, prog)),
                level,
                mode,
                stop: AtomicBool::new(false),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Starts the persistence thread. A no-op in synchronous mode.
    pub fn start(&self) -> std::io::Result<()> {
        if self.inner.mode == LogMode::Sync {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("log-persist".into())
            .spawn(move || persist_loop(&inner))?;
        *relock(self.inner.handle.lock()) = Some(handle);
        Ok(())
    }

    /// Seals the active cell and blocks until the consumer has drained the
    /// ring, bounded to a few seconds so a wedged disk cannot hang shutdown.
    pub fn flush_blocking(&self) {
        if self.inner.mode == LogMode::Sync {
            return;
        }
        let mut ring = relock(self.inner.state.lock());
        let curr = ring.curr;
        if ring.cells[curr].status == CellStatus::Free && !ring.cells[curr].is_empty() {
            ring.cells[curr].status = CellStatus::Full;
            let next = ring.cells[curr].next;
            if ring.cells[next].status == CellStatus::Free {
                ring.curr = next;
            }
        }
        self.inner.cond.notify_one();

        let mut rounds = 0;
        while !ring.drained() && rounds < 25 {
            let (guard, _) = relock(
                self.inner
                    .drained
                    .wait_timeout(ring, Duration::from_millis(200)),
            );
            ring = guard;
            rounds += 1;
        }
    }

    /// Flushes, stops and joins the consumer thread.
    pub fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        self.inner.cond.notify_all();
        let handle = relock(self.inner.handle.lock()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let dropped = relock(self.inner.state.lock()).dropped;
        if dropped > 0 {
            eprintln!("log ring dropped {dropped} lines under memory pressure");
        }
    }

    /// Renders the line prefix and message; returns the bytes and the epoch
    /// second used, for the suppression window.
    fn format_line(&self, record: &Record<'_>) -> (Vec<u8>, i64) {
        let mut line = Vec::with_capacity(256);
        let secs;
        {
            let mut clock = relock(self.inner.clock.lock());
            let (s, millis, stamp) = clock.stamp();
            secs = s;
            let _ = write!(line, "{}[{stamp}.{millis:03}]", level_tag(record.level()));
        }
        let _ = write!(
            line,
            "[{}]{}:{}({}): {}",
            tid(),
            record.file().unwrap_or("??"),
            record.line().unwrap_or(0),
            record.target(),
            record.args()
        );
        if line.len() >= LINE_LIMIT {
            line.truncate(LINE_LIMIT - 1);
        }
        line.push(b'\n');
        (line, secs)
    }

    fn append(&self, record: &Record<'_>) {
        let (line, secs) = self.format_line(record);
        match self.inner.mode {
            LogMode::Sync => {
                let date = current_date(&self.inner);
                relock(self.inner.file.lock()).write_chunk(&line, date);
            }
            LogMode::Async => self.append_line(&line, secs),
        }
    }

    /// The producer half of the ring discipline.
    fn append_line(&self, line: &[u8], now_secs: i64) {
        let mut signal = false;
        {
            let mut ring = relock(self.inner.state.lock());
            if ring.last_drop != 0 {
                if now_secs - ring.last_drop < RELOG_THRESHOLD {
                    ring.dropped += 1;
                    return;
                }
                ring.last_drop = 0;
            }

            let curr = ring.curr;
            if ring.cells[curr].status == CellStatus::Free
                && ring.cells[curr].avail() >= line.len()
            {
                ring.cells[curr].append(line);
            } else if ring.cells[curr].status == CellStatus::Free {
                ring.cells[curr].status = CellStatus::Full;
                signal = true;
                let next = ring.cells[curr].next;
                if ring.cells[next].status == CellStatus::Free {
                    ring.curr = next;
                    ring.cells[next].append(line);
                } else if (ring.cells.len() + 1) * ring.cell_len <= ring.mem_limit {
                    let cell_len = ring.cell_len;
                    let fresh = ring.cells.insert(CellBuffer::new(cell_len));
                    ring.cells[fresh].prev = curr;
                    ring.cells[fresh].next = next;
                    ring.cells[curr].next = fresh;
                    ring.cells[next].prev = fresh;
                    ring.curr = fresh;
                    ring.cells[fresh].append(line);
                } else {
                    // both neighbors sealed and no headroom to grow
                    ring.curr = next;
                    ring.last_drop = now_secs;
                    ring.dropped += 1;
                }
            } else {
                // producer raced the consumer into a sealed cell
                ring.last_drop = now_secs;
                ring.dropped += 1;
            }
        }
        if signal {
            self.inner.cond.notify_one();
        }
    }

    #[cfg(test)]
    fn ring_stats(&self) -> (usize, usize, u64) {
        let ring = relock(self.inner.state.lock());
        let sealed = ring
            .cells
            .iter()
            .filter(|(_, c)| c.status == CellStatus::Full)
            .count();
        (ring.cells.len(), sealed, ring.dropped)
    }
}

impl log::Log for RingLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.inner.level
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            self.append(record);
        }
    }

    fn flush(&self) {
        self.flush_blocking();
    }
}

/// Consumer loop: wait for a sealed cell (or force-seal on timeout), write
/// it out with the ring unlocked, then reopen the cell and advance.
fn persist_loop(inner: &Inner) {
    loop {
        let mut ring = relock(inner.state.lock());

        if ring.cells[ring.prst].status == CellStatus::Free && !inner.stop.load(Ordering::Relaxed)
        {
            let (guard, _) = relock(inner.cond.wait_timeout(ring, BUFF_WAIT));
            ring = guard;
        }

        let prst = ring.prst;
        if ring.cells[prst].is_empty() {
            if inner.stop.load(Ordering::Relaxed) {
                return;
            }
            continue;
        }

        if ring.cells[prst].status == CellStatus::Free {
            // Timed out with the producer still in this cell. Only seal when
            // the cursors actually coincide; a producer that advanced in the
            // wake-up window has sealed the cell itself.
            if prst == ring.curr {
                ring.cells[prst].status = CellStatus::Full;
                ring.curr = ring.cells[prst].next;
            } else {
                continue;
            }
        }

        let data = mem::take(&mut ring.cells[prst].data);
        drop(ring);

        let date = current_date(inner);
        relock(inner.file.lock()).write_chunk(&data, date);

        let mut ring = relock(inner.state.lock());
        let cell = &mut ring.cells[prst];
        cell.data = data;
        cell.clear();
        let next = cell.next;
        ring.prst = next;
        inner.drained.notify_all();
    }
}

#[cfg(test)]
mod test {
    use log::{LevelFilter, Log};

    use crate::config::LogMode;

    use super::{CellStatus, RingLogger};

    fn small_logger(dir: &std::path::Path, cells: usize, mem_cells: usize) -> RingLogger {
        RingLogger::with_options(
            dir,
            "unit",
            LevelFilter::Trace,
            LogMode::Async,
            64,
            cells,
            64 * mem_cells,
        )
    }

    #[test]
    fn lines_accumulate_in_current_cell() {
        let dir = tempfile::tempdir().unwrap();
        let logger = small_logger(dir.path(), 3, 3);
        logger.append_line(&[b'a'; 40], 100);
        let (cells, sealed, dropped) = logger.ring_stats();
        assert_eq!((3, 0, 0), (cells, sealed, dropped));
    }

    #[test]
    fn overflow_seals_and_advances_to_free_neighbor() {
        let dir = tempfile::tempdir().unwrap();
        let logger = small_logger(dir.path(), 3, 3);
        logger.append_line(&[b'a'; 40], 100);
        logger.append_line(&[b'b'; 40], 100);
        let (_, sealed, dropped) = logger.ring_stats();
        assert_eq!(1, sealed);
        assert_eq!(0, dropped);
    }

    #[test]
    fn ring_grows_when_successor_is_sealed() {
        let dir = tempfile::tempdir().unwrap();
        // memory cap allows five cells, so the wrap-around inserts a fresh one
        let logger = small_logger(dir.path(), 3, 5);
        for _ in 0..4 {
            logger.append_line(&[b'x'; 40], 100);
        }
        let (cells, sealed, dropped) = logger.ring_stats();
        assert_eq!(4, cells);
        assert_eq!(3, sealed);
        assert_eq!(0, dropped);
    }

    #[test]
    fn memory_cap_drops_and_opens_suppression_window() {
        let dir = tempfile::tempdir().unwrap();
        let logger = small_logger(dir.path(), 3, 3);
        for _ in 0..4 {
            logger.append_line(&[b'x'; 40], 100);
        }
        let (cells, _, dropped) = logger.ring_stats();
        assert_eq!(3, cells);
        assert_eq!(1, dropped);

        // inside the window: silent drop, no state change
        logger.append_line(&[b'y'; 10], 102);
        assert_eq!(2, logger.ring_stats().2);

        // after the window: curr points at a sealed cell, so the line still
        // drops, but the window re-opens from now
        logger.append_line(&[b'z'; 10], 120);
        assert_eq!(3, logger.ring_stats().2);
    }

    #[test]
    fn prst_never_passes_curr() {
        let dir = tempfile::tempdir().unwrap();
        let logger = small_logger(dir.path(), 3, 5);
        for _ in 0..4 {
            logger.append_line(&[b'x'; 40], 100);
        }
        let ring = super::relock(logger.inner.state.lock());
        // every cell from prst up to (exclusive) curr must be sealed
        let mut key = ring.prst;
        let mut sealed_between = 0;
        while key != ring.curr {
            assert_eq!(CellStatus::Full, ring.cells[key].status);
            sealed_between += 1;
            key = ring.cells[key].next;
            assert!(sealed_between <= ring.cells.len());
        }
        assert_eq!(3, sealed_between);
    }

    #[test]
    fn consumer_persists_to_file_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RingLogger::with_options(
            dir.path(),
            "unit",
            LevelFilter::Trace,
            LogMode::Async,
            4096,
            3,
            4096 * 3,
        );
        logger.start().unwrap();
        logger.log(
            &log::Record::builder()
                .args(format_args!("answer is {}", 42))
                .level(log::Level::Info)
                .target("unit")
                .file(Some("unit.rs"))
                .line(Some(7))
                .build(),
        );
        logger.flush_blocking();
        logger.shutdown();

        let entry = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let contents = std::fs::read_to_string(entry.path()).unwrap();
        assert!(contents.contains("[INFO]"));
        assert!(contents.contains("unit.rs:7(unit): answer is 42"));
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn sync_mode_writes_without_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RingLogger::with_options(
            dir.path(),
            "unit",
            LevelFilter::Trace,
            LogMode::Sync,
            4096,
            3,
            4096 * 3,
        );
        logger.start().unwrap();
        logger.log(
            &log::Record::builder()
                .args(format_args!("inline"))
                .level(log::Level::Warn)
                .target("unit")
                .build(),
        );

        let entry = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let contents = std::fs::read_to_string(entry.path()).unwrap();
        assert!(contents.contains("[WARN]"));
        assert!(contents.contains("inline"));
    }

    #[test]
    fn oversize_lines_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let logger = small_logger(dir.path(), 3, 3);
        let huge = "x".repeat(8 * 1024);
        let (line, _) = logger.format_line(
            &log::Record::builder()
                .args(format_args!("{huge}"))
                .level(log::Level::Info)
                .target("unit")
                .build(),
        );
        assert_eq!(super::LINE_LIMIT, line.len());
        assert_eq!(b'\n', *line.last().unwrap());
    }

    #[test]
    fn level_filter_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RingLogger::with_options(
            dir.path(),
            "unit",
            LevelFilter::Warn,
            LogMode::Async,
            64,
            3,
            64 * 3,
        );
        logger.log(
            &log::Record::builder()
                .args(format_args!("quiet"))
                .level(log::Level::Info)
                .target("unit")
                .build(),
        );
        let ring = super::relock(logger.inner.state.lock());
        assert!(ring.cells[ring.curr].is_empty());
    }
}
