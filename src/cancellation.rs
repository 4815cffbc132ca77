//! Cancellation signals for in-flight replies, keyed by conversation.
//!
//! A reply registers a signal when its user message is saved. Deleting the
//! conversation (or its project) fires the signal so the reply drops its
//! result instead of writing it. Cancellation is advisory: the model call is
//! never interrupted, only the decision to persist its output is gated.

#[cfg(test)]
#[path = "cancellation_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::models::ConversationId;

/// Handle held by one reply. Cloning shares the same signal.
#[derive(Debug, Clone)]
pub struct ReplyTicket {
    conversation_id: ConversationId,
    generation: u64,
    token: CancellationToken,
}

impl ReplyTicket {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal is set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[derive(Default)]
struct Entries {
    next_generation: u64,
    tokens: HashMap<ConversationId, (u64, CancellationToken)>,
}

#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<Entries>,
}

pub type ArcRegistry = Arc<CancellationRegistry>;

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh signal for `conversation_id`, replacing any signal
    /// already tracked for it. The replaced signal is left untouched.
    pub fn register(&self, conversation_id: ConversationId) -> ReplyTicket {
        let mut entries = self.lock();
        entries.next_generation += 1;
        let generation = entries.next_generation;
        let token = CancellationToken::new();
        if entries
            .tokens
            .insert(conversation_id, (generation, token.clone()))
            .is_some()
        {
            log::debug!("replaced in-flight reply signal for conversation {conversation_id}");
        }
        ReplyTicket {
            conversation_id,
            generation,
            token,
        }
    }

    /// Fires and forgets the signal of one conversation. Returns whether one
    /// was tracked.
    pub fn cancel(&self, conversation_id: ConversationId) -> bool {
        self.cancel_many([conversation_id]) > 0
    }

    /// Fires and forgets the signals of every listed conversation. Returns how
    /// many were tracked.
    pub fn cancel_many(&self, ids: impl IntoIterator<Item = ConversationId>) -> usize {
        let mut entries = self.lock();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, token)) = entries.tokens.remove(&id) {
                token.cancel();
                cancelled += 1;
                log::debug!("cancelled in-flight reply for conversation {id}");
            }
        }
        cancelled
    }

    /// Forgets the ticket's entry once its reply is settled. An entry that was
    /// replaced by a newer registration is kept.
    pub fn complete(&self, ticket: &ReplyTicket) -> bool {
        let mut entries = self.lock();
        match entries.tokens.get(&ticket.conversation_id) {
            Some((generation, _)) if *generation == ticket.generation => {
                entries.tokens.remove(&ticket.conversation_id);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, conversation_id: ConversationId) -> bool {
        self.lock().tokens.contains_key(&conversation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // Entries stay consistent even if a holder panicked mid-update.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
