use std::sync::Arc;

use tokio::sync::mpsc;

use super::{ConversationId, Message};

#[derive(Debug)]
pub enum Event {
    /// Progressively extended reply text, only while the reply is still wanted
    ReplyPartial {
        conversation_id: ConversationId,
        text: String,
    },
    ReplyCommitted(Message),
    ReplyDiscarded(ConversationId),
}

#[async_trait::async_trait]
pub trait EventTx {
    async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>>;
}

impl Event {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Event::ReplyPartial {
                conversation_id, ..
            } => *conversation_id,
            Event::ReplyCommitted(message) => message.conversation_id(),
            Event::ReplyDiscarded(conversation_id) => *conversation_id,
        }
    }
}

#[async_trait::async_trait]
impl EventTx for mpsc::Sender<Event> {
    async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(event).await
    }
}

#[async_trait::async_trait]
impl EventTx for mpsc::UnboundedSender<Event> {
    async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(event)
    }
}

pub type ArcEventTx = Arc<dyn EventTx + Send + Sync>;
