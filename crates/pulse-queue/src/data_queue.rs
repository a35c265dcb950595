//! The persistent data queue: ordered, durable, opaque byte records.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use pulse_db::DbPool;
use rusqlite::params;

use crate::error::QueueError;

/// One opaque unit of queued work.
///
/// The payload is opaque to the queue; idempotence keys and any structure
/// live inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntity {
    /// Globally unique record id.
    pub unique_id: String,
    /// Creation time as epoch milliseconds.
    pub timestamp_ms: i64,
    /// The payload bytes.
    pub data: Vec<u8>,
}

impl DataEntity {
    /// Creates a new entity around `data` with a fresh id and the current
    /// time.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            unique_id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }
}

/// An ordered, durable queue of [`DataEntity`] records over SQLite.
///
/// Rows are inserted in call order; `peek` reads the smallest unremoved
/// storage sequence. Each queue owns its own database file, so two queues
/// never contend on one another's storage.
pub struct DataQueue {
    pool: DbPool,
    closed: AtomicBool,
    capacity: Option<usize>,
}

impl DataQueue {
    /// Opens (and migrates) the queue database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError` if the pool cannot be created or migrations fail.
    pub fn open(db_path: &Path) -> Result<Self, QueueError> {
        Self::open_with_capacity(db_path, None)
    }

    /// Opens the queue with a maximum row count. `add` fails with
    /// `QueueError::Full` once the capacity is reached.
    ///
    /// # Errors
    ///
    /// Returns `QueueError` if the pool cannot be created or migrations fail.
    pub fn open_with_capacity(
        db_path: &Path,
        capacity: Option<usize>,
    ) -> Result<Self, QueueError> {
        let pool = pulse_db::create_pool(&db_path.to_string_lossy())
            .map_err(|e| match e {
                pulse_db::PoolError::PoolInit(inner) => QueueError::Unavailable(inner),
            })?;
        let conn = pool.get()?;
        pulse_db::run_migrations(&conn).map_err(|e| match e {
            pulse_db::MigrationError::ExecutionFailed { source, .. } => {
                QueueError::Database(source)
            }
            pulse_db::MigrationError::StateQuery(source) => QueueError::Database(source),
        })?;

        Ok(Self {
            pool,
            closed: AtomicBool::new(false),
            capacity,
        })
    }

    /// Appends an entity to the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after [`close`](Self::close), `Full` at capacity, or
    /// a storage error.
    pub fn add(&self, entity: &DataEntity) -> Result<(), QueueError> {
        self.check_open()?;
        let conn = self.pool.get()?;

        if let Some(capacity) = self.capacity {
            let count: usize =
                conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
            if count >= capacity {
                return Err(QueueError::Full(capacity));
            }
        }

        conn.execute(
            "INSERT INTO queue (uniqueID, timestamp, data) VALUES (?1, ?2, ?3)",
            params![entity.unique_id, entity.timestamp_ms, entity.data],
        )?;
        Ok(())
    }

    /// Returns the oldest entity without removing it, or `None` when empty.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after close, or a storage error.
    pub fn peek(&self) -> Result<Option<DataEntity>, QueueError> {
        Ok(self.peek_n(1)?.into_iter().next())
    }

    /// Returns up to `n` oldest entities in storage order.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after close, or a storage error.
    pub fn peek_n(&self, n: usize) -> Result<Vec<DataEntity>, QueueError> {
        self.check_open()?;
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT uniqueID, timestamp, data FROM queue ORDER BY seq ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([n as i64], |row| {
            Ok(DataEntity {
                unique_id: row.get(0)?,
                timestamp_ms: row.get(1)?,
                data: row.get(2)?,
            })
        })?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    /// Removes the oldest entity.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after close, or a storage error.
    pub fn remove(&self) -> Result<(), QueueError> {
        self.remove_n(1)?;
        Ok(())
    }

    /// Removes up to `n` oldest entities; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after close, or a storage error.
    pub fn remove_n(&self, n: usize) -> Result<usize, QueueError> {
        self.check_open()?;
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM queue WHERE seq IN
                (SELECT seq FROM queue ORDER BY seq ASC LIMIT ?1)",
            [n as i64],
        )?;
        Ok(removed)
    }

    /// Removes the oldest entity only if its id matches `unique_id`.
    ///
    /// The hit-queue worker uses this so a concurrent [`clear`](Self::clear)
    /// between process-completion and removal cannot delete a record that
    /// was never presented.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after close, or a storage error.
    pub fn remove_matching(&self, unique_id: &str) -> Result<bool, QueueError> {
        self.check_open()?;
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM queue WHERE seq = (SELECT MIN(seq) FROM queue) AND uniqueID = ?1",
            [unique_id],
        )?;
        Ok(removed > 0)
    }

    /// Removes every queued entity.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after close, or a storage error.
    pub fn clear(&self) -> Result<(), QueueError> {
        self.check_open()?;
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM queue", [])?;
        Ok(())
    }

    /// Number of queued entities.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after close, or a storage error.
    pub fn count(&self) -> Result<usize, QueueError> {
        self.check_open()?;
        let conn = self.pool.get()?;
        let count: usize = conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Closes the queue. All subsequent operations fail with `Closed`; rows
    /// already on disk remain for the next open.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}
