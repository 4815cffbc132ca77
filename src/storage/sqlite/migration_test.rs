use std::sync::Arc;

use tokio_rusqlite::rusqlite::{Connection, params};

use super::*;
use crate::{
    cancellation::CancellationRegistry,
    models::{MessageKind, Sender},
    storage::{Storage, sqlite::Sqlite},
};

const LEGACY_SCHEMA: &str = "
CREATE TABLE projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    context TEXT
);
CREATE TABLE tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    description TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
);
CREATE TABLE conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    project_id INTEGER REFERENCES projects(id),
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id),
    sender TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'text',
    content TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);
";

fn legacy_connection(schema_sql: &str) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = OFF;").unwrap();
    conn.execute_batch(schema_sql).unwrap();
    conn
}

fn seed_legacy_rows(conn: &Connection) {
    conn.execute_batch(
        "INSERT INTO projects (id, name) VALUES (1, 'Work');
         INSERT INTO tasks (id, project_id, description) VALUES (1, 1, 'write report');
         INSERT INTO conversations (id, name, project_id) VALUES (10, 'planning', 1);
         INSERT INTO conversations (id, name, project_id) VALUES (11, NULL, NULL);
         INSERT INTO conversations (id, name, project_id) VALUES (12, 'lost', 99);
         INSERT INTO messages (id, conversation_id, sender, content) VALUES (100, 10, 'user', 'hello');
         INSERT INTO messages (id, conversation_id, sender, content) VALUES (101, 10, 'agent', 'hi there');
         INSERT INTO messages (id, conversation_id, sender, content) VALUES (102, 11, 'user', 'free');
         INSERT INTO messages (id, conversation_id, sender, content) VALUES (103, 12, 'user', 'orphan');",
    )
    .unwrap();
}

fn foreign_keys_enabled(conn: &Connection) -> bool {
    conn.query_row("PRAGMA foreign_keys", [], |row| row.get::<_, i64>(0))
        .unwrap()
        == 1
}

fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .unwrap()
}

#[test]
fn test_fresh_schema_needs_no_migration() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    schema::ensure_schema(&mut conn).unwrap();

    assert!(pending_tables(&conn).unwrap().is_empty());
    let report = migrate_if_needed(&mut conn).unwrap();
    assert!(report.is_noop());
    assert!(foreign_keys_enabled(&conn));
}

#[test]
fn test_ensure_schema_keeps_existing_tables() {
    let mut conn = legacy_connection(LEGACY_SCHEMA);
    seed_legacy_rows(&conn);

    schema::ensure_schema(&mut conn).unwrap();

    assert_eq!(pending_tables(&conn).unwrap().len(), 3);
    assert_eq!(count(&conn, "messages"), 4);
}

#[test]
fn test_migrate_legacy_schema() {
    let mut conn = legacy_connection(LEGACY_SCHEMA);
    seed_legacy_rows(&conn);
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();

    let report = migrate_if_needed(&mut conn).unwrap();
    assert_eq!(report.rebuilt, vec!["tasks", "conversations", "messages"]);
    // conversation 12 and its message
    assert_eq!(report.orphans_removed, 2);
    assert!(foreign_keys_enabled(&conn));
    assert!(pending_tables(&conn).unwrap().is_empty());

    // ids survive the copy
    let ids = conn
        .prepare("SELECT id FROM messages ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get::<_, i64>(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(ids, vec![100, 101, 102]);
    assert_eq!(count(&conn, "conversations"), 2);
    assert_eq!(count(&conn, "tasks"), 1);

    let text_timestamps: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM messages WHERE typeof(created_at) <> 'integer')
                  + (SELECT COUNT(*) FROM conversations WHERE typeof(created_at) <> 'integer')",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(text_timestamps, 0);

    for table in ["tasks", "conversations", "messages"] {
        assert!(!schema::table_exists(&conn, &format!("{table}__cascade_shadow")).unwrap());
    }

    let again = migrate_if_needed(&mut conn).unwrap();
    assert!(again.is_noop());

    // deleting the project now reaches every dependent row
    conn.execute("DELETE FROM projects WHERE id = ?1", params![1])
        .unwrap();
    assert_eq!(count(&conn, "tasks"), 0);
    assert_eq!(count(&conn, "conversations"), 1);
    assert_eq!(count(&conn, "messages"), 1);
}

#[test]
fn test_migrate_only_rebuilds_non_compliant_tables() {
    let legacy = LEGACY_SCHEMA.replace(
        "project_id INTEGER NOT NULL REFERENCES projects(id),",
        "project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,",
    );
    let mut conn = legacy_connection(&legacy);
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();

    let report = migrate_if_needed(&mut conn).unwrap();
    assert_eq!(report.rebuilt, vec!["conversations", "messages"]);
    assert_eq!(report.orphans_removed, 0);
}

#[test]
fn test_failed_migration_rolls_back() {
    // content may be NULL here but not in the current schema, so the copy fails
    let legacy = LEGACY_SCHEMA.replace("content TEXT NOT NULL,", "content TEXT,");
    let mut conn = legacy_connection(&legacy);
    seed_legacy_rows(&conn);
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender, content) VALUES (104, 10, 'user', NULL)",
        [],
    )
    .unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();

    let err = migrate_if_needed(&mut conn).unwrap_err();
    match &err {
        StoreError::Migration { step, source } => {
            assert_eq!(step, "rebuilding table messages");
            assert!(source.is_constraint(), "unexpected source: {source}");
        }
        other => panic!("expected a migration error, got {other:?}"),
    }

    assert!(foreign_keys_enabled(&conn));
    assert_eq!(pending_tables(&conn).unwrap().len(), 3);
    assert_eq!(count(&conn, "conversations"), 3);
    assert_eq!(count(&conn, "messages"), 5);
    for table in ["tasks", "conversations", "messages"] {
        assert!(!schema::table_exists(&conn, &format!("{table}__cascade_shadow")).unwrap());
    }
}

#[tokio::test]
async fn test_migrate_file_database_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.db");
    let path = path.to_str().unwrap();

    {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("PRAGMA foreign_keys = OFF;").unwrap();
        conn.execute_batch(LEGACY_SCHEMA).unwrap();
        seed_legacy_rows(&conn);
    }

    let storage = Sqlite::open(
        Some(path),
        std::time::Duration::from_millis(500),
        Arc::new(CancellationRegistry::new()),
    )
    .await
    .unwrap();
    let report = storage.migrate_if_needed().await.unwrap();
    assert_eq!(report.rebuilt.len(), 3);
    assert_eq!(report.orphans_removed, 2);

    let messages = storage.list_messages(10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content(), "hello");

    // rows written after the migration sort after the copied history
    storage
        .append_message(10, Sender::User, MessageKind::Text, "newest")
        .await
        .unwrap();
    let contents = storage
        .list_messages(10)
        .await
        .unwrap()
        .iter()
        .map(|m| m.content().to_string())
        .collect::<Vec<_>>();
    assert_eq!(contents, vec!["hello", "hi there", "newest"]);
    let history = storage.reply_history(10, "newest").await.unwrap();
    assert_eq!(history.len(), 3);
    storage.close().await.unwrap();

    let reopened = Sqlite::open(
        Some(path),
        std::time::Duration::from_millis(500),
        Arc::new(CancellationRegistry::new()),
    )
    .await
    .unwrap();
    assert!(reopened.migrate_if_needed().await.unwrap().is_noop());
}
