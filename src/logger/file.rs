//! Log file selection and rotation.
//!
//! Files are named `<dir>/<prog>.<YYYYMMDD>.<pid>.log`. A date change opens
//! a fresh file. When the active file reaches the size limit, numbered
//! suffixes shift upward (`.log.k` becomes `.log.(k+1)`, the active file
//! becomes `.log.1`) and a fresh `.log` is started. If the directory cannot
//! be created or written, output is redirected to the null device and the
//! session continues.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One log file per gigabyte; rotation shifts suffixes past this.
const FILE_SIZE_LIMIT: u64 = 1024 * 1024 * 1024;

#[derive(Debug)]
pub(crate) struct LogFile {
    dir: PathBuf,
    prog: String,
    pid: u32,
    env_ok: bool,
    file: Option<File>,
    year: i32,
    mon: u32,
    day: u32,
    written: u64,
    size_limit: u64,
    /// Files opened for the current date, counting the active one.
    file_count: u32,
}

impl LogFile {
    pub(crate) fn new(dir: &Path, prog: &str) -> Self {
        let env_ok = fs::create_dir_all(dir).is_ok();
        if !env_ok {
            eprintln!("logdir {} is not usable, logging to null", dir.display());
        }
        Self {
            dir: dir.to_path_buf(),
            prog: prog.to_owned(),
            pid: std::process::id(),
            env_ok,
            file: None,
            year: 0,
            mon: 0,
            day: 0,
            written: 0,
            size_limit: FILE_SIZE_LIMIT,
            file_count: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_size_limit(dir: &Path, prog: &str, size_limit: u64) -> Self {
        let mut this = Self::new(dir, prog);
        this.size_limit = size_limit;
        this
    }

    /// Writes one sealed buffer (or one line in synchronous mode) to the
    /// file selected for `date`, then flushes.
    ///
    /// A short write is reported on stderr and never retried.
    pub(crate) fn write_chunk(&mut self, data: &[u8], date: (i32, u32, u32)) {
        if !self.select(date) {
            return;
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        match file.write(data) {
            Ok(n) => {
                self.written += n as u64;
                if n != data.len() {
                    eprintln!("short log write: {} of {} bytes", n, data.len());
                }
            }
            Err(err) => eprintln!("log write failed: {err}"),
        }
        let _ = file.flush();
    }

    /// Ensures `self.file` points at the right target. Returns false only
    /// when no file could be opened at all.
    fn select(&mut self, (year, mon, day): (i32, u32, u32)) -> bool {
        if !self.env_ok {
            if self.file.is_none() {
                self.file = OpenOptions::new().write(true).open("/dev/null").ok();
            }
            return self.file.is_some();
        }

        if self.file.is_none() || (self.year, self.mon, self.day) != (year, mon, day) {
            self.year = year;
            self.mon = mon;
            self.day = day;
            self.file_count = 0;
            self.open_fresh();
        } else if self.written >= self.size_limit {
            self.shift_suffixes();
            self.open_fresh();
        }
        self.file.is_some()
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!(
            "{}.{:04}{:02}{:02}.{}.log",
            self.prog, self.year, self.mon, self.day, self.pid
        ))
    }

    fn suffixed_path(&self, n: u32) -> PathBuf {
        let mut path = self.active_path().into_os_string();
        path.push(format!(".{n}"));
        PathBuf::from(path)
    }

    fn open_fresh(&mut self) {
        self.written = 0;
        match File::create(self.active_path()) {
            Ok(file) => {
                self.file = Some(file);
                self.file_count += 1;
            }
            Err(err) => {
                eprintln!("cannot open {}: {err}", self.active_path().display());
                self.env_ok = false;
                self.file = None;
            }
        }
    }

    /// mv x.log.k -> x.log.(k+1) for all existing k, then x.log -> x.log.1.
    fn shift_suffixes(&mut self) {
        for n in (1..self.file_count).rev() {
            let _ = fs::rename(self.suffixed_path(n), self.suffixed_path(n + 1));
        }
        let _ = fs::rename(self.active_path(), self.suffixed_path(1));
    }
}
