//! Database connection management.
//!
//! A small bounded pool of rusqlite connections. Callers wait for a permit
//! on a fair tokio semaphore (first come, first served), then the blocking
//! SQL runs on the blocking thread pool so async tasks are never stalled
//! behind SQLite.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};
use uuid::Uuid;

use recall_core::config::{expand_home, StorageConfig};
use recall_core::error::{RecallError, Result};

use crate::migrations;

/// Where connections point.
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    /// Shared-cache in-memory database, addressed by URI.
    Memory(String),
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub available: usize,
}

/// Pooled SQLite database.
///
/// File databases run in WAL mode with a busy timeout so readers and a
/// writer can share the file. In-memory databases use a shared-cache URI,
/// an anchor connection that keeps the database alive, and a single pooled
/// connection (shared-cache writers would otherwise fail with SQLITE_LOCKED).
pub struct Database {
    location: Location,
    idle: Arc<Mutex<Vec<Connection>>>,
    permits: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Option<Duration>,
    busy_timeout: Duration,
    _anchor: Option<Mutex<Connection>>,
}

impl Database {
    /// Open the database described by the storage configuration.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let acquire_timeout = config.acquire_timeout_ms.map(Duration::from_millis);
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        if config.is_in_memory() {
            Self::open_memory(acquire_timeout, busy_timeout)
        } else {
            let path = expand_home(&config.database_path);
            Self::open_file(
                &path,
                config.pool_min,
                config.pool_max,
                acquire_timeout,
                busy_timeout,
            )
        }
    }

    /// Open (or create) a file database with the default pool bounds.
    pub fn new(path: &Path) -> Result<Self> {
        let defaults = StorageConfig::default();
        Self::open_file(
            path,
            defaults.pool_min,
            defaults.pool_max,
            None,
            Duration::from_millis(defaults.busy_timeout_ms),
        )
    }

    /// Open a private in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open_memory(None, Duration::from_millis(5_000))
    }

    fn open_file(
        path: &Path,
        pool_min: usize,
        pool_max: usize,
        acquire_timeout: Option<Duration>,
        busy_timeout: Duration,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self {
            location: Location::File(path.to_path_buf()),
            idle: Arc::new(Mutex::new(Vec::with_capacity(pool_max))),
            permits: Arc::new(Semaphore::new(pool_max)),
            max_size: pool_max,
            acquire_timeout,
            busy_timeout,
            _anchor: None,
        };

        let first = db.connect()?;
        migrations::run_migrations(&first)?;

        let mut warm = vec![first];
        for _ in 1..pool_min.min(pool_max) {
            warm.push(db.connect()?);
        }
        let warmed = warm.len();
        db.idle_guard()?.extend(warm);

        info!(
            path = %path.display(),
            pool_min = warmed,
            pool_max,
            "Database opened"
        );
        Ok(db)
    }

    fn open_memory(acquire_timeout: Option<Duration>, busy_timeout: Duration) -> Result<Self> {
        let uri = format!("file:recall-{}?mode=memory&cache=shared", Uuid::new_v4());
        let location = Location::Memory(uri);

        let mut db = Self {
            location,
            idle: Arc::new(Mutex::new(Vec::with_capacity(1))),
            permits: Arc::new(Semaphore::new(1)),
            max_size: 1,
            acquire_timeout,
            busy_timeout,
            _anchor: None,
        };

        let anchor = db.connect()?;
        migrations::run_migrations(&anchor)?;
        db._anchor = Some(Mutex::new(anchor));

        let pooled = db.connect()?;
        db.idle_guard()?.push(pooled);

        debug!("In-memory database opened");
        Ok(db)
    }

    /// Open a fresh connection with the standard PRAGMAs applied.
    fn connect(&self) -> Result<Connection> {
        let conn = match &self.location {
            Location::File(path) => Connection::open(path),
            Location::Memory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
        }
        .map_err(|e| RecallError::Storage(format!("Failed to open database: {}", e)))?;

        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| RecallError::Storage(format!("Failed to set busy timeout: {}", e)))?;

        let pragmas = match self.location {
            Location::File(_) => {
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA cache_size = -65536;"
            }
            Location::Memory(_) => "PRAGMA foreign_keys = ON;",
        };
        conn.execute_batch(pragmas)
            .map_err(|e| RecallError::Storage(format!("Failed to set pragmas: {}", e)))?;

        Ok(conn)
    }

    fn idle_guard(&self) -> Result<std::sync::MutexGuard<'_, Vec<Connection>>> {
        self.idle
            .lock()
            .map_err(|e| RecallError::Storage(format!("Connection pool lock poisoned: {}", e)))
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match self.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
                RecallError::Timeout {
                    operation: "acquire database connection".to_string(),
                    after_ms: limit.as_millis() as u64,
                }
            })?,
            None => acquire.await,
        };
        permit.map_err(|e| RecallError::Storage(format!("Connection pool closed: {}", e)))
    }

    /// Take an idle connection, or open a new one. Callers hold a permit,
    /// so the total never exceeds `max_size`.
    fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle_guard()?.pop() {
            return Ok(conn);
        }
        debug!("Opening additional pooled connection");
        self.connect()
    }

    /// Run a closure against a pooled connection on the blocking thread pool.
    ///
    /// Waits for a free connection first. The permit and the connection
    /// travel together into the blocking task, so a caller dropped mid-query
    /// keeps its slot occupied until the statement finishes and the
    /// connection is back in the idle list.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        let mut conn = self.checkout()?;
        let idle = Arc::clone(&self.idle);

        tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            if let Ok(mut idle) = idle.lock() {
                idle.push(conn);
            }
            drop(permit);
            result
        })
        .await
        .map_err(|e| RecallError::Storage(format!("Database task failed: {}", e)))?
    }

    /// Current pool occupancy.
    pub fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            max_size: self.max_size,
            idle: self.idle.lock().map(|idle| idle.len()).unwrap_or(0),
            available: self.permits.available_permits(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.location)
            .field("max_size", &self.max_size)
            .finish()
    }
}
