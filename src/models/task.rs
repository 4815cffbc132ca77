use super::{ProjectId, TaskId};

pub const TASK_PENDING: &str = "pending";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    id: TaskId,
    project_id: ProjectId,
    description: String,
    status: String,
}

impl Task {
    pub fn new(project_id: ProjectId, description: impl Into<String>) -> Self {
        Self {
            id: 0,
            project_id,
            description: description.into(),
            status: TASK_PENDING.to_string(),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_pending(&self) -> bool {
        self.status == TASK_PENDING
    }
}
