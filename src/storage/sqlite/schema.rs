//! Table definitions and the only DDL the application issues.

use tokio_rusqlite::rusqlite::{self, Connection, params};

/// A managed table: its column list and the index that supports its reads.
pub(crate) struct Table {
    pub name: &'static str,
    columns: &'static str,
    index: Option<&'static str>,
}

impl Table {
    fn create_sql(&self, name: &str) -> String {
        format!("CREATE TABLE IF NOT EXISTS {name} ({})", self.columns)
    }

    pub fn shadow_name(&self) -> String {
        format!("{}__cascade_shadow", self.name)
    }
}

pub(crate) const PROJECTS: Table = Table {
    name: "projects",
    columns: "
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE CHECK (length(trim(name)) > 0),
        context TEXT",
    index: None,
};

pub(crate) const TASKS: Table = Table {
    name: "tasks",
    columns: "
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        description TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'",
    index: Some("CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id)"),
};

pub(crate) const CONVERSATIONS: Table = Table {
    name: "conversations",
    columns: "
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT,
        project_id INTEGER REFERENCES projects(id) ON DELETE CASCADE,
        created_at INTEGER NOT NULL
            DEFAULT (CAST(ROUND((julianday('now') - 2440587.5) * 86400000) AS INTEGER))",
    index: Some(
        "CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversations(project_id)",
    ),
};

pub(crate) const MESSAGES: Table = Table {
    name: "messages",
    columns: "
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        sender TEXT NOT NULL CHECK (sender IN ('user', 'agent')),
        kind TEXT NOT NULL DEFAULT 'text',
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
            DEFAULT (CAST(ROUND((julianday('now') - 2440587.5) * 86400000) AS INTEGER))",
    index: Some(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation \
         ON messages(conversation_id, created_at, id)",
    ),
};

/// Creation order. Parents come before the tables referencing them.
pub(crate) const TABLES: [&Table; 4] = [&PROJECTS, &TASKS, &CONVERSATIONS, &MESSAGES];

/// Tables holding a foreign key that must cascade on delete.
pub(crate) const DEPENDENT_TABLES: [&Table; 3] = [&TASKS, &CONVERSATIONS, &MESSAGES];

/// Creates every missing table and index in one transaction. Existing tables
/// are left exactly as they are.
pub(crate) fn ensure_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for table in TABLES {
        tx.execute_batch(&table.create_sql(table.name))?;
        if let Some(index) = table.index {
            tx.execute_batch(index)?;
        }
    }
    tx.commit()
}

/// True when every foreign key declared on `table` cascades on delete. A table
/// without foreign keys trivially does.
pub(crate) fn cascades_on_delete(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let non_cascading: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_foreign_key_list(?1) WHERE upper(on_delete) <> 'CASCADE'",
        params![table],
        |row| row.get(0),
    )?;
    Ok(non_cascading == 0)
}

/// Older layouts stored `created_at` as `YYYY-MM-DD HH:MM:SS` text. Mixed
/// with integer milliseconds it would sort after every newer row.
const TEXT_TIMESTAMP_TO_MILLIS: &str = "CASE typeof(created_at) \
     WHEN 'text' THEN CAST(ROUND((julianday(created_at) - 2440587.5) * 86400000) AS INTEGER) \
     ELSE created_at END";

/// Replaces `table` with a copy declared with the current foreign-key clauses.
/// Every row is carried over with its id. Must run inside a transaction with
/// foreign-key enforcement off. Returns the number of copied rows.
pub(crate) fn rebuild_table(conn: &Connection, table: &Table) -> rusqlite::Result<usize> {
    let shadow = table.shadow_name();
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {shadow};"))?;
    conn.execute_batch(&table.create_sql(&shadow))?;

    let old_columns = column_names(conn, table.name)?;
    let shared = column_names(conn, &shadow)?
        .into_iter()
        .filter(|column| old_columns.contains(column))
        .collect::<Vec<_>>();
    let columns = shared
        .iter()
        .map(|column| format!("\"{column}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let values = shared
        .iter()
        .map(|column| match column.as_str() {
            "created_at" => TEXT_TIMESTAMP_TO_MILLIS.to_string(),
            _ => format!("\"{column}\""),
        })
        .collect::<Vec<_>>()
        .join(", ");

    let copied = conn.execute(
        &format!(
            "INSERT INTO {shadow} ({columns}) SELECT {values} FROM {}",
            table.name
        ),
        [],
    )?;
    swap(conn, table)?;
    Ok(copied)
}

fn swap(conn: &Connection, table: &Table) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "DROP TABLE {name}; ALTER TABLE {shadow} RENAME TO {name};",
        name = table.name,
        shadow = table.shadow_name(),
    ))?;
    if let Some(index) = table.index {
        conn.execute_batch(index)?;
    }
    Ok(())
}

pub(crate) fn column_names(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let names = stmt
        .query_map(params![table], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )
}
