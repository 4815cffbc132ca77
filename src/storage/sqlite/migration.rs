#[cfg(test)]
#[path = "migration_test.rs"]
mod tests;

use tokio_rusqlite::rusqlite::{self, Connection, TransactionBehavior};

use super::schema::{self, DEPENDENT_TABLES, Table};
use crate::storage::{Result, StoreError};

/// Outcome of one cascade migration run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub rebuilt: Vec<&'static str>,
    pub orphans_removed: usize,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.rebuilt.is_empty() && self.orphans_removed == 0
    }
}

impl std::fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_noop() {
            return write!(f, "schema already cascades on delete");
        }
        write!(
            f,
            "rebuilt [{}], removed {} orphaned row(s)",
            self.rebuilt.join(", "),
            self.orphans_removed
        )
    }
}

/// Dependent tables that still carry a foreign key without ON DELETE CASCADE.
pub(crate) fn pending_tables(conn: &Connection) -> rusqlite::Result<Vec<&'static Table>> {
    let mut pending = vec![];
    for table in DEPENDENT_TABLES {
        if !schema::cascades_on_delete(conn, table.name)? {
            pending.push(table);
        }
    }
    Ok(pending)
}

/// Rebuilds every non-compliant dependent table and purges orphans in one
/// transaction. Foreign-key enforcement is switched off for the rebuild and
/// is back on when this returns, whatever the outcome.
pub(crate) fn migrate_if_needed(conn: &mut Connection) -> Result<MigrationReport> {
    let pending = pending_tables(conn)
        .map_err(|err| StoreError::migration("inspecting foreign keys", err))?;
    if pending.is_empty() {
        log::debug!("dependent tables already cascade on delete");
        return Ok(MigrationReport::default());
    }

    log::info!(
        "rebuilding tables without cascading foreign keys: {}",
        pending.iter().map(|t| t.name).collect::<Vec<_>>().join(", ")
    );

    // Must be outside the transaction: the pragma is a no-op inside one.
    conn.execute_batch("PRAGMA foreign_keys = OFF;")
        .map_err(|err| StoreError::migration("disabling foreign key enforcement", err))?;

    let result = rebuild(conn, &pending);

    let restored = conn.execute_batch("PRAGMA foreign_keys = ON;");
    if let Err(err) = &restored {
        log::error!("re-enabling foreign key enforcement: {err}");
    }
    let report = result.inspect_err(|err| log::error!("cascade migration rolled back: {err}"))?;
    restored.map_err(|err| StoreError::migration("re-enabling foreign key enforcement", err))?;

    log::info!("cascade migration done: {report}");
    Ok(report)
}

fn rebuild(conn: &mut Connection, pending: &[&'static Table]) -> Result<MigrationReport> {
    // Dropping the transaction on any early return rolls everything back.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| StoreError::migration("starting transaction", err))?;

    for table in pending {
        let copied = schema::rebuild_table(&tx, table)
            .map_err(|err| StoreError::migration(format!("rebuilding table {}", table.name), err))?;
        log::debug!("rebuilt {} with {copied} row(s)", table.name);
    }

    let orphans_removed =
        purge_orphans(&tx).map_err(|err| StoreError::migration("purging orphaned rows", err))?;

    let violations = foreign_key_violations(&tx)
        .map_err(|err| StoreError::migration("checking foreign keys", err))?;
    if violations > 0 {
        return Err(StoreError::migration(
            "checking foreign keys",
            StoreError::Constraint(format!("{violations} row(s) still violate foreign keys")),
        ));
    }

    tx.commit()
        .map_err(|err| StoreError::migration("committing", err))?;

    Ok(MigrationReport {
        rebuilt: pending.iter().map(|t| t.name).collect(),
        orphans_removed,
    })
}

/// Parents first, so messages of a conversation removed here go too.
fn purge_orphans(conn: &Connection) -> rusqlite::Result<usize> {
    let conversations = conn.execute(
        "DELETE FROM conversations
         WHERE project_id IS NOT NULL AND project_id NOT IN (SELECT id FROM projects)",
        [],
    )?;
    let tasks = conn.execute(
        "DELETE FROM tasks WHERE project_id NOT IN (SELECT id FROM projects)",
        [],
    )?;
    let messages = conn.execute(
        "DELETE FROM messages WHERE conversation_id NOT IN (SELECT id FROM conversations)",
        [],
    )?;
    if conversations + tasks + messages > 0 {
        log::warn!(
            "removed orphans: {conversations} conversation(s), {tasks} task(s), {messages} message(s)"
        );
    }
    Ok(conversations + tasks + messages)
}

fn foreign_key_violations(conn: &Connection) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}
