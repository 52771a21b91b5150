//! Bounded pool of pre-authenticated MySQL handles.
//!
//! The counting discipline lives in a generic free-list pool so its lease
//! contract is testable without a database; [`DbPool`] instantiates it over
//! `mysql::Conn`. `acquire` blocks until a handle is free and never fails at
//! runtime; construction authenticates every handle up front and any
//! failure there is fatal.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};

use crate::config::Config;
use crate::error::ServerError;

/// Generic bounded free-list with blocking acquisition.
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    free: Mutex<Vec<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> Pool<T> {
    /// Builds a pool owning `items`; the pool never grows past them.
    pub fn new(items: Vec<T>) -> Self {
        let capacity = items.len();
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(items),
                available: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Takes an item, blocking until one is returned if none is free.
    pub fn acquire(&self) -> Lease<T> {
        let mut free = lock(&self.shared.free);
        loop {
            if let Some(item) = free.pop() {
                return Lease {
                    item: Some(item),
                    shared: Arc::clone(&self.shared),
                };
            }
            free = self
                .shared
                .available
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of items currently free.
    pub fn free_count(&self) -> usize {
        lock(&self.shared.free).len()
    }

    /// Total items owned by the pool.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scoped borrow of a pooled item; returns it on drop, on every exit path
/// including a panic unwinding through the holder.
pub struct Lease<T> {
    item: Option<T>,
    shared: Arc<Shared<T>>,
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("lease accessed after drop")
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("lease accessed after drop")
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            lock(&self.shared.free).push(item);
            self.shared.available.notify_one();
        }
    }
}

/// A lease over one database handle.
pub type DbLease = Lease<Conn>;

/// The bounded MySQL connection pool.
#[derive(Clone)]
pub struct DbPool {
    pool: Pool<Conn>,
}

impl DbPool {
    /// Authenticates `capacity` handles against the configured database.
    /// Any authentication failure aborts startup.
    pub fn connect(cfg: &Config, capacity: usize) -> Result<Self, ServerError> {
        let mut handles = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            let opts = OptsBuilder::new()
                .ip_or_hostname(Some(cfg.sql_host.as_str()))
                .tcp_port(cfg.sql_port)
                .user(Some(cfg.sql_user.as_str()))
                .pass(Some(cfg.sql_password.as_str()))
                .db_name(Some(cfg.sql_database.as_str()));
            handles.push(Conn::new(opts)?);
        }
        Ok(Self {
            pool: Pool::new(handles),
        })
    }

    /// Borrows a handle, blocking until one is free.
    pub fn acquire(&self) -> DbLease {
        self.pool.acquire()
    }

    /// Free handles right now; equals the capacity when no lease is out.
    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }
}

/// Loads the credential table served from memory at request time.
pub fn load_users(conn: &mut Conn) -> Result<HashMap<String, String>, mysql::Error> {
    let rows: Vec<(String, String)> = conn.query("SELECT username, passwd FROM user")?;
    Ok(rows.into_iter().collect())
}

/// Records a new credential pair; a duplicate username surfaces as the
/// database error from the unique key.
pub fn insert_user(conn: &mut Conn, user: &str, password: &str) -> Result<(), mysql::Error> {
    conn.exec_drop(
        "INSERT INTO user (username, passwd) VALUES (?, ?)",
        (user, password),
    )
}

#[cfg(test)]
mod test {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Pool;

    #[test]
    fn acquire_hands_out_distinct_items() {
        let pool = Pool::new(vec![1u32, 2, 3]);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(*a, *b);
        assert_eq!(1, pool.free_count());
    }

    #[test]
    fn dropping_a_lease_returns_the_item() {
        let pool = Pool::new(vec![7u32]);
        {
            let lease = pool.acquire();
            assert_eq!(7, *lease);
            assert_eq!(0, pool.free_count());
        }
        assert_eq!(1, pool.free_count());
    }

    #[test]
    fn lease_survives_a_panic_in_the_holder() {
        let pool = Pool::new(vec![1u32, 2]);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _lease = pool.acquire();
            panic!("task blew up mid-request");
        }));
        assert!(result.is_err());
        assert_eq!(2, pool.free_count());
    }

    #[test]
    fn acquire_blocks_until_a_lease_returns() {
        let pool = Pool::new(vec![0u32]);
        let first = pool.acquire();

        let served = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let pool = pool.clone();
            let served = Arc::clone(&served);
            thread::spawn(move || {
                let lease = pool.acquire();
                served.store(*lease as usize + 1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(0, served.load(Ordering::SeqCst), "waiter ran too early");
        drop(first);
        waiter.join().unwrap();
        assert_eq!(1, served.load(Ordering::SeqCst));
        assert_eq!(1, pool.free_count());
    }

    #[test]
    fn capacity_reflects_initial_items() {
        let pool = Pool::new(vec![1u32, 2, 3, 4]);
        assert_eq!(4, pool.capacity());
        let _a = pool.acquire();
        assert_eq!(4, pool.capacity());
        assert_eq!(3, pool.free_count());
    }
}
