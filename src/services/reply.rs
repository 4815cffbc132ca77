//! The life of one agent reply.
//!
//! A reply moves `Pending -> Generated -> Committed | Discarded`. Each state is
//! its own type, so the only way to a terminal state is through
//! [`Reply::settle`], which holds both cancellation checkpoints: one right
//! after the model returns, one inside the exclusive section that inserts the
//! reply.

#[cfg(test)]
#[path = "reply_test.rs"]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Context, Result};
use tokio::task::JoinHandle;

use crate::{
    backend::{ArcBackend, ArcReplySink, ReplySink},
    cancellation::{ArcRegistry, ReplyTicket},
    models::{ArcEventTx, ConversationId, Event, Message, MessageKind, Turn},
    storage::{self, ArcStorage, MessageTarget},
};

/// Prefix of the reply persisted when the model could not answer.
pub const MODEL_ERROR_PREFIX: &str = "[Model error]";

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Committed(Message),
    Discarded(ConversationId),
}

impl ReplyOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ReplyOutcome::Committed(_))
    }
}

/// A saved user message whose reply is being generated in the background.
pub struct PendingReply {
    message: Message,
    handle: JoinHandle<Result<ReplyOutcome>>,
}

impl PendingReply {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.message.conversation_id()
    }

    /// Waits for the reply to be committed or discarded.
    pub async fn wait(self) -> Result<ReplyOutcome> {
        self.handle.await.wrap_err("joining reply task")?
    }
}

#[derive(Clone)]
pub struct ReplyService {
    storage: ArcStorage,
    backend: ArcBackend,
    registry: ArcRegistry,
    event_tx: ArcEventTx,
    stream: bool,
}

impl ReplyService {
    pub fn new(
        storage: ArcStorage,
        backend: ArcBackend,
        registry: ArcRegistry,
        event_tx: ArcEventTx,
    ) -> Self {
        Self {
            storage,
            backend,
            registry,
            event_tx,
            stream: false,
        }
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Saves the user message and starts generating the reply on its own
    /// task. Storage errors surface here, before anything is spawned.
    pub async fn send(
        &self,
        target: MessageTarget,
        kind: MessageKind,
        text: &str,
    ) -> storage::Result<PendingReply> {
        let (message, ticket) = self.storage.save_user_message(target, kind, text).await?;
        log::debug!(
            "saved message {} in conversation {}, generating reply",
            message.id(),
            message.conversation_id()
        );

        let reply = Reply {
            service: self.clone(),
            ticket,
            state: Pending {
                prompt: message.content().to_string(),
            },
        };
        let handle = tokio::spawn(reply.run());
        Ok(PendingReply { message, handle })
    }
}

struct Pending {
    prompt: String,
}

struct Generated {
    content: String,
}

struct Reply<S> {
    service: ReplyService,
    ticket: ReplyTicket,
    state: S,
}

impl Reply<Pending> {
    async fn run(self) -> Result<ReplyOutcome> {
        let service = self.service.clone();
        let ticket = self.ticket.clone();

        let outcome = match self.generate().await {
            Ok(generated) => generated.settle().await,
            Err(err) => Err(err),
        };
        // Settling already forgets the ticket; this covers the error paths.
        service.registry.complete(&ticket);

        match &outcome {
            Ok(ReplyOutcome::Committed(message)) => {
                service
                    .emit(Event::ReplyCommitted(message.clone()))
                    .await;
            }
            Ok(ReplyOutcome::Discarded(conversation_id)) => {
                service
                    .emit(Event::ReplyDiscarded(*conversation_id))
                    .await;
            }
            Err(err) => {
                log::error!(
                    "reply for conversation {} failed: {:#}",
                    ticket.conversation_id(),
                    err
                );
            }
        }
        outcome
    }

    async fn generate(self) -> Result<Reply<Generated>> {
        let conversation_id = self.ticket.conversation_id();
        let turns = self
            .service
            .storage
            .reply_history(conversation_id, &self.state.prompt)
            .await
            .wrap_err("reading conversation history")?;

        // The exclusive section is released here; the model call runs
        // without holding it.
        let content = match self.ask_model(turns).await {
            Ok(content) => content,
            Err(err) => {
                log::error!("model failed for conversation {conversation_id}: {err:#}");
                format!("{MODEL_ERROR_PREFIX} {err}")
            }
        };

        Ok(Reply {
            service: self.service,
            ticket: self.ticket,
            state: Generated { content },
        })
    }

    async fn ask_model(&self, turns: Vec<Turn>) -> Result<String> {
        let backend = &self.service.backend;
        if self.service.stream {
            let sink: ArcReplySink = Arc::new(GatedSink {
                ticket: self.ticket.clone(),
                event_tx: self.service.event_tx.clone(),
            });
            match backend.stream(turns.clone(), sink).await {
                Ok(content) => return Ok(content),
                Err(err) => {
                    log::warn!(
                        "streaming from {} failed, retrying without streaming: {err:#}",
                        backend.name()
                    );
                }
            }
        }
        backend.complete(turns).await
    }
}

impl Reply<Generated> {
    async fn settle(self) -> Result<ReplyOutcome> {
        let conversation_id = self.ticket.conversation_id();
        if self.ticket.is_cancelled() {
            log::debug!("reply for conversation {conversation_id} cancelled during generation");
            return Ok(ReplyOutcome::Discarded(conversation_id));
        }

        let committed = self
            .service
            .storage
            .commit_reply(&self.ticket, &self.state.content)
            .await
            .wrap_err("saving reply")?;

        Ok(match committed {
            Some(message) => ReplyOutcome::Committed(message),
            None => ReplyOutcome::Discarded(conversation_id),
        })
    }
}

impl ReplyService {
    async fn emit(&self, event: Event) {
        if let Err(err) = self.event_tx.send(event).await {
            log::debug!("event receiver is gone: {err}");
        }
    }
}

/// Forwards streaming partials until the reply is cancelled.
struct GatedSink {
    ticket: ReplyTicket,
    event_tx: ArcEventTx,
}

#[async_trait]
impl ReplySink for GatedSink {
    async fn partial(&self, text: &str) {
        if self.ticket.is_cancelled() {
            return;
        }
        let event = Event::ReplyPartial {
            conversation_id: self.ticket.conversation_id(),
            text: text.to_string(),
        };
        if let Err(err) = self.event_tx.send(event).await {
            log::debug!("event receiver is gone: {err}");
        }
    }
}
