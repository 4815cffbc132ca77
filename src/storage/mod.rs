pub mod error;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use eyre::WrapErr;

pub use error::{Result, StoreError};
pub use sqlite::{MigrationReport, Sqlite};

use crate::{
    cancellation::{ArcRegistry, ReplyTicket},
    config::{StorageConfig, ensure_parent_dir, resolve_path},
    models::{
        Conversation, ConversationId, Message, MessageKind, Project, ProjectId, Sender, Task,
        TaskId, Turn,
    },
};

/// Where a user message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Conversation(ConversationId),
    /// Start a conversation first, under the project when one is given.
    NewConversation(Option<ProjectId>),
}

#[async_trait]
pub trait Storage {
    /// Rebuilds tables whose foreign keys do not cascade on delete. No-op once
    /// applied.
    async fn migrate_if_needed(&self) -> Result<MigrationReport>;

    async fn list_projects(&self) -> Result<Vec<Project>>;
    async fn find_project(&self, name: &str) -> Result<Project>;
    async fn get_project(&self, id: ProjectId) -> Result<Project>;
    async fn create_project(&self, name: &str, context: Option<&str>) -> Result<Project>;
    async fn rename_project(&self, id: ProjectId, name: &str) -> Result<()>;
    async fn set_project_context(&self, id: ProjectId, context: Option<&str>) -> Result<()>;
    /// Deletes the project with everything it owns. In-flight replies of its
    /// conversations are cancelled first. Returns the removed conversation ids.
    async fn delete_project(&self, id: ProjectId) -> Result<Vec<ConversationId>>;

    /// Conversations of a project, or the free ones when `project_id` is `None`.
    async fn list_conversations(&self, project_id: Option<ProjectId>) -> Result<Vec<Conversation>>;
    async fn create_conversation(
        &self,
        project_id: Option<ProjectId>,
        name: Option<&str>,
    ) -> Result<Conversation>;
    async fn rename_conversation(&self, id: ConversationId, name: Option<&str>) -> Result<()>;
    async fn delete_conversation(&self, id: ConversationId) -> Result<()>;
    /// Removes every message of the conversation and returns how many.
    async fn clear_history(&self, id: ConversationId) -> Result<usize>;

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: Sender,
        kind: MessageKind,
        content: &str,
    ) -> Result<Message>;
    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>>;

    /// Saves a user message and registers the reply it expects, creating the
    /// conversation on the way when needed.
    async fn save_user_message(
        &self,
        target: MessageTarget,
        kind: MessageKind,
        content: &str,
    ) -> Result<(Message, ReplyTicket)>;
    /// History to send to the model, ending with the pending user text.
    async fn reply_history(
        &self,
        conversation_id: ConversationId,
        pending: &str,
    ) -> Result<Vec<Turn>>;
    /// Persists the agent reply unless the ticket was cancelled or the
    /// conversation is gone. Always settles the ticket.
    async fn commit_reply(&self, ticket: &ReplyTicket, content: &str) -> Result<Option<Message>>;

    async fn add_task(&self, project_id: ProjectId, description: &str) -> Result<Task>;
    async fn list_tasks(&self, project_id: ProjectId) -> Result<Vec<Task>>;
    async fn update_task_status(&self, id: TaskId, status: &str) -> Result<()>;
}

pub type ArcStorage = Arc<dyn Storage + Send + Sync>;

pub async fn new_storage(config: &StorageConfig, registry: ArcRegistry) -> eyre::Result<ArcStorage> {
    let storage = match config {
        StorageConfig::Sqlite(sqlite_config) => {
            let path = match sqlite_config.path() {
                Some(path) => {
                    let path = resolve_path(path)?;
                    ensure_parent_dir(&path)?;
                    Some(path)
                }
                None => None,
            };
            let sqlite = Sqlite::open(path.as_deref(), sqlite_config.busy_timeout(), registry)
                .await
                .wrap_err("opening sqlite storage")?;
            if sqlite_config.migrate_on_startup {
                let report = sqlite
                    .migrate_if_needed()
                    .await
                    .wrap_err("migrating database")?;
                if !report.is_noop() {
                    log::info!("database migrated: {report}");
                }
            }
            Arc::new(sqlite)
        }
    };
    Ok(storage)
}
