//! `DuckDB` connection pool.
//!
//! A single database instance is opened once; further connections are cloned
//! from it so every connection shares the same catalog and transaction
//! manager. Idle connections are returned to the pool on drop.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::Connection;

struct PoolInner {
    db_path: Option<PathBuf>,
    max_idle: usize,
    root: Mutex<Connection>,
    idle: Mutex<Vec<Connection>>,
}

/// Pool of connections to one `DuckDB` database.
#[derive(Clone)]
pub struct DuckDbConnectionManager {
    inner: Arc<PoolInner>,
}

impl DuckDbConnectionManager {
    /// Open (or create) the database file at `path`.
    ///
    /// # Errors
    /// Returns an error if the database file cannot be opened or configured.
    pub fn open(path: impl Into<PathBuf>, max_idle: usize) -> Result<Self, ::duckdb::Error> {
        let path = path.into();
        let root = Connection::open(&path)?;
        Self::from_root(root, Some(path), max_idle)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if `DuckDB` cannot allocate the database.
    pub fn open_in_memory(max_idle: usize) -> Result<Self, ::duckdb::Error> {
        let root = Connection::open_in_memory()?;
        Self::from_root(root, None, max_idle)
    }

    fn from_root(
        root: Connection,
        db_path: Option<PathBuf>,
        max_idle: usize,
    ) -> Result<Self, ::duckdb::Error> {
        configure_connection(&root)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                db_path,
                max_idle: max_idle.max(1),
                root: Mutex::new(root),
                idle: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Take an idle connection or clone a new one from the root.
    ///
    /// # Errors
    /// Returns an error if a new connection cannot be cloned or configured.
    ///
    /// # Panics
    /// Panics if a pool mutex is poisoned.
    pub fn acquire(&self) -> Result<PooledConnection, ::duckdb::Error> {
        let idle = self
            .inner
            .idle
            .lock()
            .expect("duckdb idle pool mutex poisoned")
            .pop();

        let connection = match idle {
            Some(connection) => connection,
            None => {
                let connection = self
                    .inner
                    .root
                    .lock()
                    .expect("duckdb root connection mutex poisoned")
                    .try_clone()?;
                configure_connection(&connection)?;
                connection
            }
        };

        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            connection: Some(connection),
        })
    }

    /// Path of the database file; `None` for in-memory databases.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.inner.db_path.as_deref()
    }

    #[must_use]
    pub fn idle_len(&self) -> usize {
        self.inner
            .idle
            .lock()
            .expect("duckdb idle pool mutex poisoned")
            .len()
    }
}

/// A pooled connection that returns to the pool when dropped.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    connection: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection unexpectedly missing")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("pooled connection unexpectedly missing")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let mut idle = self
            .pool
            .idle
            .lock()
            .expect("duckdb idle pool mutex poisoned");
        if idle.len() < self.pool.max_idle {
            idle.push(connection);
        }
    }
}

fn configure_connection(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch("PRAGMA disable_progress_bar;")
}
