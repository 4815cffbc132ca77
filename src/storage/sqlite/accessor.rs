//! Exclusive access to the one SQLite connection shared by every task.
//!
//! The connection lives on a dedicated worker thread and is only reachable
//! through [`Accessor::call`]. Closures run one at a time and each runs to
//! completion before the next starts, so a closure is the unit of mutual
//! exclusion: a read followed by a dependent write, or several writes that
//! must not interleave, belong in one closure. Closures are synchronous and
//! cannot await, which keeps model calls out of the exclusive section.

use std::time::Duration;

use tokio_rusqlite::{Connection, OpenFlags, rusqlite};

use crate::storage::{Result, StoreError};

pub struct Accessor {
    conn: Connection,
}

impl Accessor {
    /// Opens the database at `path`, or an in-memory one, and applies the
    /// connection pragmas every caller relies on.
    pub async fn open(path: Option<&str>, busy_timeout: Duration) -> Result<Self> {
        let conn = match path {
            Some(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )
            .await
            .map_err(|err| {
                log::error!("opening database path {path}: {err}");
                StoreError::from(err)
            })?,
            None => Connection::open_in_memory().await?,
        };

        conn.call(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok::<_, rusqlite::Error>(())
        })
        .await?;

        log::debug!(
            "opened database {} with busy timeout {:?}",
            path.unwrap_or(":memory:"),
            busy_timeout
        );
        Ok(Self { conn })
    }

    /// Runs `function` with exclusive access to the connection.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok::<_, rusqlite::Error>(function(conn)))
            .await?
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}
