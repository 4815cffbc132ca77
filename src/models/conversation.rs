#[cfg(test)]
#[path = "conversation_test.rs"]
mod tests;

use super::{ConversationId, ProjectId};

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    id: ConversationId,
    name: Option<String>,
    project_id: Option<ProjectId>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl Conversation {
    pub fn with_id(mut self, id: ConversationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_project_id(mut self, project_id: Option<ProjectId>) -> Self {
        self.project_id = project_id;
        self
    }

    pub fn with_created_at(mut self, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        self.created_at = timestamp;
        self
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Label shown to the user; unnamed conversations get a placeholder.
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("Chat #{}", self.id),
        }
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        self.project_id
    }

    /// A free conversation is not attached to any project.
    pub fn is_free(&self) -> bool {
        self.project_id.is_none()
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            id: 0,
            name: None,
            project_id: None,
            created_at: chrono::Utc::now(),
        }
    }
}
