pub mod backend;
pub mod conversation;
pub mod event;
pub mod message;
pub mod project;
pub mod task;

pub use backend::*;
pub use conversation::Conversation;
pub use message::{Message, MessageKind, Sender, UnknownVariant};
pub use project::Project;
pub use task::Task;

pub use event::{ArcEventTx, Event, EventTx};

pub type ProjectId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;
pub type TaskId = i64;
