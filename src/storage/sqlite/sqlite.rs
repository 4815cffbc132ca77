#[cfg(test)]
#[path = "sqlite_test.rs"]
mod tests;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use tokio_rusqlite::{
    TransactionBehavior, named_params, params,
    rusqlite::{
        self, Connection, OptionalExtension, Row,
        types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef},
    },
};

use super::{Accessor, MigrationReport, migration, schema};
use crate::{
    cancellation::{ArcRegistry, ReplyTicket},
    config::constants::{BUSY_TIMEOUT_MS, FREE_CONVERSATION_NAME, LAZY_CONVERSATION_NAME},
    models::{
        Conversation, ConversationId, Message, MessageKind, Project, ProjectId, Role, Sender,
        Task, TaskId, Turn,
    },
    storage::{MessageTarget, Result, Storage, StoreError},
};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, kind, content, created_at";
const CONVERSATION_COLUMNS: &str = "id, name, project_id, created_at";

pub struct Sqlite {
    accessor: Accessor,
    registry: ArcRegistry,
}

impl Sqlite {
    /// Opens the database and creates whatever tables are missing. Tables
    /// from an older layout are left for [`Storage::migrate_if_needed`].
    pub async fn open(
        path: Option<&str>,
        busy_timeout: Duration,
        registry: ArcRegistry,
    ) -> Result<Self> {
        let accessor = Accessor::open(path, busy_timeout).await?;
        accessor
            .call(|conn| Ok(schema::ensure_schema(conn)?))
            .await?;
        Ok(Self { accessor, registry })
    }

    pub async fn open_in_memory(registry: ArcRegistry) -> Result<Self> {
        Self::open(None, Duration::from_millis(BUSY_TIMEOUT_MS), registry).await
    }

    pub fn registry(&self) -> &ArcRegistry {
        &self.registry
    }

    pub async fn close(self) -> Result<()> {
        self.accessor.close().await
    }

    #[cfg(test)]
    pub(crate) fn accessor(&self) -> &Accessor {
        &self.accessor
    }
}

#[async_trait]
impl Storage for Sqlite {
    async fn migrate_if_needed(&self) -> Result<MigrationReport> {
        self.accessor.call(migration::migrate_if_needed).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.accessor
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, name, context FROM projects ORDER BY name ASC")?;
                let projects = stmt
                    .query_map([], project_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(projects)
            })
            .await
    }

    async fn find_project(&self, name: &str) -> Result<Project> {
        let name = name.trim().to_string();
        self.accessor
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, name, context FROM projects WHERE name = ?1",
                    params![name],
                    project_from_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::not_found("project", name))
            })
            .await
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        self.accessor
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, name, context FROM projects WHERE id = ?1",
                    params![id],
                    project_from_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::not_found("project", id))
            })
            .await
    }

    async fn create_project(&self, name: &str, context: Option<&str>) -> Result<Project> {
        let name = required("project name", name)?;
        let context = optional_text(context);
        self.accessor
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (name, context) VALUES (:name, :context)",
                    named_params! { ":name": name, ":context": context },
                )
                .map_err(|err| duplicate_project(err, &name))?;
                let id = conn.last_insert_rowid();
                log::info!("created project {id} ({name})");
                Ok(Project::new(name).with_id(id).with_context(context))
            })
            .await
    }

    async fn rename_project(&self, id: ProjectId, name: &str) -> Result<()> {
        let name = required("project name", name)?;
        self.accessor
            .call(move |conn| {
                let updated = conn
                    .execute(
                        "UPDATE projects SET name = ?1 WHERE id = ?2",
                        params![name, id],
                    )
                    .map_err(|err| duplicate_project(err, &name))?;
                if updated == 0 {
                    return Err(StoreError::not_found("project", id));
                }
                Ok(())
            })
            .await
    }

    async fn set_project_context(&self, id: ProjectId, context: Option<&str>) -> Result<()> {
        let context = optional_text(context);
        self.accessor
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE projects SET context = ?1 WHERE id = ?2",
                    params![context, id],
                )?;
                if updated == 0 {
                    return Err(StoreError::not_found("project", id));
                }
                Ok(())
            })
            .await
    }

    async fn delete_project(&self, id: ProjectId) -> Result<Vec<ConversationId>> {
        let registry = self.registry.clone();
        self.accessor
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if !exists(&tx, "projects", id)? {
                    return Err(StoreError::not_found("project", id));
                }

                let conversation_ids = {
                    let mut stmt = tx.prepare("SELECT id FROM conversations WHERE project_id = ?1 ORDER BY id")?;
                    let ids = stmt
                        .query_map(params![id], |row| row.get(0))?
                        .collect::<rusqlite::Result<Vec<ConversationId>>>()?;
                    ids
                };
                // Signals go out before the rows disappear so no reply can
                // commit into a conversation that is being removed.
                let cancelled = registry.cancel_many(conversation_ids.iter().copied());

                let deleted = tx
                    .execute("DELETE FROM projects WHERE id = ?1", params![id])
                    .and_then(|_| tx.commit());
                if let Err(err) = deleted {
                    if cancelled > 0 {
                        log::warn!(
                            "project {id} was not deleted, {cancelled} in-flight reply(ies) already dropped: {err}"
                        );
                    }
                    return Err(err.into());
                }
                log::info!(
                    "deleted project {id} with {} conversation(s), {cancelled} reply(ies) cancelled",
                    conversation_ids.len()
                );
                Ok(conversation_ids)
            })
            .await
    }

    async fn list_conversations(&self, project_id: Option<ProjectId>) -> Result<Vec<Conversation>> {
        self.accessor
            .call(move |conn| {
                let sql = match project_id {
                    Some(_) => format!(
                        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE project_id = ?1 ORDER BY id ASC"
                    ),
                    None => format!(
                        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE project_id IS NULL ORDER BY id ASC"
                    ),
                };
                let mut stmt = conn.prepare(&sql)?;
                let conversations = match project_id {
                    Some(project_id) => stmt.query_map(params![project_id], conversation_from_row)?,
                    None => stmt.query_map([], conversation_from_row)?,
                }
                .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(conversations)
            })
            .await
    }

    async fn create_conversation(
        &self,
        project_id: Option<ProjectId>,
        name: Option<&str>,
    ) -> Result<Conversation> {
        let name = optional_text(name);
        self.accessor
            .call(move |conn| {
                if let Some(project_id) = project_id {
                    if !exists(conn, "projects", project_id)? {
                        return Err(StoreError::not_found("project", project_id));
                    }
                }
                Ok(insert_conversation(conn, project_id, name.as_deref())?)
            })
            .await
    }

    async fn rename_conversation(&self, id: ConversationId, name: Option<&str>) -> Result<()> {
        let name = optional_text(name);
        self.accessor
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE conversations SET name = ?1 WHERE id = ?2",
                    params![name, id],
                )?;
                if updated == 0 {
                    return Err(StoreError::not_found("conversation", id));
                }
                Ok(())
            })
            .await
    }

    async fn delete_conversation(&self, id: ConversationId) -> Result<()> {
        let registry = self.registry.clone();
        self.accessor
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if !exists(&tx, "conversations", id)? {
                    return Err(StoreError::not_found("conversation", id));
                }
                let cancelled = registry.cancel(id);
                let deleted = tx
                    .execute("DELETE FROM conversations WHERE id = ?1", params![id])
                    .and_then(|_| tx.commit());
                if let Err(err) = deleted {
                    if cancelled {
                        log::warn!(
                            "conversation {id} was not deleted, its in-flight reply is already dropped: {err}"
                        );
                    }
                    return Err(err.into());
                }
                log::info!("deleted conversation {id} (reply cancelled: {cancelled})");
                Ok(())
            })
            .await
    }

    async fn clear_history(&self, id: ConversationId) -> Result<usize> {
        self.accessor
            .call(move |conn| {
                if !exists(conn, "conversations", id)? {
                    return Err(StoreError::not_found("conversation", id));
                }
                let removed = conn.execute(
                    "DELETE FROM messages WHERE conversation_id = ?1",
                    params![id],
                )?;
                log::debug!("cleared {removed} message(s) from conversation {id}");
                Ok(removed)
            })
            .await
    }

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: Sender,
        kind: MessageKind,
        content: &str,
    ) -> Result<Message> {
        let content = content.to_string();
        self.accessor
            .call(move |conn| {
                if !exists(conn, "conversations", conversation_id)? {
                    return Err(StoreError::not_found("conversation", conversation_id));
                }
                Ok(insert_message(conn, conversation_id, sender, kind, &content)?)
            })
            .await
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.accessor
            .call(move |conn| Ok(select_messages(conn, conversation_id)?))
            .await
    }

    async fn save_user_message(
        &self,
        target: MessageTarget,
        kind: MessageKind,
        content: &str,
    ) -> Result<(Message, ReplyTicket)> {
        let content = required("message", content)?;
        let registry = self.registry.clone();
        self.accessor
            .call(move |conn| {
                let tx = conn.transaction()?;
                let conversation_id = match target {
                    MessageTarget::Conversation(id) => {
                        if !exists(&tx, "conversations", id)? {
                            return Err(StoreError::not_found("conversation", id));
                        }
                        id
                    }
                    MessageTarget::NewConversation(project_id) => {
                        let name = match project_id {
                            Some(project_id) => {
                                if !exists(&tx, "projects", project_id)? {
                                    return Err(StoreError::not_found("project", project_id));
                                }
                                LAZY_CONVERSATION_NAME
                            }
                            None => FREE_CONVERSATION_NAME,
                        };
                        let conversation = insert_conversation(&tx, project_id, Some(name))?;
                        log::debug!("started conversation {} for a new message", conversation.id());
                        conversation.id()
                    }
                };
                let message = insert_message(&tx, conversation_id, Sender::User, kind, &content)?;
                tx.commit()?;

                // Same exclusive section as the insert: a delete cannot slip in
                // between the message landing and its reply being tracked.
                let ticket = registry.register(conversation_id);
                Ok((message, ticket))
            })
            .await
    }

    async fn reply_history(
        &self,
        conversation_id: ConversationId,
        pending: &str,
    ) -> Result<Vec<Turn>> {
        let pending = pending.to_string();
        self.accessor
            .call(move |conn| {
                let mut turns = select_messages(conn, conversation_id)?
                    .iter()
                    .map(Message::to_turn)
                    .collect::<Vec<_>>();
                if turns.last().is_none_or(|turn| turn.role() != Role::User) {
                    turns.push(Turn::user(pending));
                }
                Ok(turns)
            })
            .await
    }

    async fn commit_reply(&self, ticket: &ReplyTicket, content: &str) -> Result<Option<Message>> {
        let ticket = ticket.clone();
        let content = content.to_string();
        let registry = self.registry.clone();
        self.accessor
            .call(move |conn| {
                let result = commit(conn, &ticket, &content);
                registry.complete(&ticket);
                result
            })
            .await
    }

    async fn add_task(&self, project_id: ProjectId, description: &str) -> Result<Task> {
        let description = required("task description", description)?;
        self.accessor
            .call(move |conn| {
                if !exists(conn, "projects", project_id)? {
                    return Err(StoreError::not_found("project", project_id));
                }
                conn.execute(
                    "INSERT INTO tasks (project_id, description) VALUES (?1, ?2)",
                    params![project_id, description],
                )?;
                let id = conn.last_insert_rowid();
                Ok(conn.query_row(
                    "SELECT id, project_id, description, status FROM tasks WHERE id = ?1",
                    params![id],
                    task_from_row,
                )?)
            })
            .await
    }

    async fn list_tasks(&self, project_id: ProjectId) -> Result<Vec<Task>> {
        self.accessor
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, description, status FROM tasks WHERE project_id = ?1 ORDER BY id ASC",
                )?;
                let tasks = stmt
                    .query_map(params![project_id], task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(tasks)
            })
            .await
    }

    async fn update_task_status(&self, id: TaskId, status: &str) -> Result<()> {
        let status = required("task status", status)?;
        self.accessor
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET status = ?1 WHERE id = ?2",
                    params![status, id],
                )?;
                if updated == 0 {
                    return Err(StoreError::not_found("task", id));
                }
                Ok(())
            })
            .await
    }
}

/// Last checkpoint of a reply. Runs inside the exclusive section.
fn commit(conn: &Connection, ticket: &ReplyTicket, content: &str) -> Result<Option<Message>> {
    let conversation_id = ticket.conversation_id();
    if ticket.is_cancelled() {
        log::debug!("reply for conversation {conversation_id} was cancelled, dropping it");
        return Ok(None);
    }
    if !exists(conn, "conversations", conversation_id)? {
        log::warn!("conversation {conversation_id} vanished before its reply, dropping it");
        return Ok(None);
    }
    match insert_message(conn, conversation_id, Sender::Agent, MessageKind::Text, content) {
        Ok(message) => Ok(Some(message)),
        Err(err) if is_foreign_key_violation(&err) => {
            log::warn!("reply for conversation {conversation_id} lost its parent: {err}");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn exists(conn: &Connection, table: &str, id: i64) -> rusqlite::Result<bool> {
    conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
        params![id],
        |row| row.get(0),
    )
}

fn insert_conversation(
    conn: &Connection,
    project_id: Option<ProjectId>,
    name: Option<&str>,
) -> rusqlite::Result<Conversation> {
    conn.execute(
        "INSERT INTO conversations (name, project_id) VALUES (?1, ?2)",
        params![name, project_id],
    )?;
    let id = conn.last_insert_rowid();
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
        params![id],
        conversation_from_row,
    )
}

fn insert_message(
    conn: &Connection,
    conversation_id: ConversationId,
    sender: Sender,
    kind: MessageKind,
    content: &str,
) -> rusqlite::Result<Message> {
    conn.execute(
        "INSERT INTO messages (conversation_id, sender, kind, content)
         VALUES (:conversation_id, :sender, :kind, :content)",
        named_params! {
            ":conversation_id": conversation_id,
            ":sender": sender,
            ":kind": kind,
            ":content": content,
        },
    )?;
    let id = conn.last_insert_rowid();
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        params![id],
        message_from_row,
    )
}

fn select_messages(
    conn: &Connection,
    conversation_id: ConversationId,
) -> rusqlite::Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1
         ORDER BY created_at ASC, id ASC"
    ))?;
    let messages = stmt
        .query_map(params![conversation_id], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project::new(row.get::<_, String>(1)?)
        .with_id(row.get(0)?)
        .with_context(row.get(2)?))
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation::default()
        .with_id(row.get(0)?)
        .with_name(row.get(1)?)
        .with_project_id(row.get(2)?)
        .with_created_at(timestamp_at(row, 3)?))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message::new(row.get(2)?, row.get::<_, String>(4)?)
        .with_id(row.get(0)?)
        .with_conversation_id(row.get(1)?)
        .with_kind(row.get(3)?)
        .with_created_at(timestamp_at(row, 5)?))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task::new(row.get(1)?, row.get::<_, String>(2)?)
        .with_id(row.get(0)?)
        .with_status(row.get::<_, String>(3)?))
}

#[derive(Debug, Error)]
#[error("timestamp {0} is out of range")]
struct InvalidTimestamp(i64);

/// Reads a creation timestamp. Current rows hold epoch milliseconds; rows
/// copied from older databases hold `YYYY-MM-DD HH:MM:SS` text in UTC.
fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    match row.get_ref(idx)? {
        ValueRef::Integer(millis) => DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Integer,
                Box::new(InvalidTimestamp(millis)),
            )
        }),
        ValueRef::Text(text) => {
            let text = std::str::from_utf8(text).map_err(rusqlite::Error::Utf8Error)?;
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .map(|timestamp| timestamp.and_utc())
                .map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
                })
        }
        other => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "created_at".to_string(),
            other.data_type(),
        )),
    }
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

fn duplicate_project(err: rusqlite::Error, name: &str) -> StoreError {
    match StoreError::from(err) {
        StoreError::Constraint(_) => {
            StoreError::Constraint(format!("a project named \"{name}\" already exists"))
        }
        other => other,
    }
}

/// Trims `value` and rejects it when nothing is left.
fn required(what: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(StoreError::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(value.to_string())
}

fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl ToSql for Sender {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Sender {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}

impl ToSql for MessageKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MessageKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}
