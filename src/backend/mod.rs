pub mod openai;

pub use openai::OpenAI;

#[cfg(test)]
use mockall::automock;

use crate::{
    config::{BackendConfig, verbose},
    models::Turn,
};
use async_trait::async_trait;
use eyre::Result;
use std::{sync::Arc, time::Duration};

/// Receives the progressively extended text of a streaming reply.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplySink {
    async fn partial(&self, text: &str);
}

pub type ArcReplySink = Arc<dyn ReplySink + Send + Sync>;

/// A language model that answers a conversation history.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend {
    fn name(&self) -> &str;

    /// Returns the whole reply at once.
    async fn complete(&self, turns: Vec<Turn>) -> Result<String>;

    /// Hands each extension of the reply to `sink` as it is generated, then
    /// returns the final text.
    async fn stream(&self, turns: Vec<Turn>, sink: ArcReplySink) -> Result<String>;
}

pub type ArcBackend = Arc<dyn Backend + Send + Sync>;

pub fn new_backend(config: &BackendConfig) -> Result<ArcBackend> {
    let mut connection = config.connection.clone();
    if let (None, Some(secs)) = (connection.timeout(), config.timeout_secs) {
        connection = connection.with_timeout(Duration::from_secs(secs as u64));
    }

    let backend = OpenAI::from(&connection);
    verbose!("  [+] Added backend: {} ({})", backend.name(), backend.endpoint());
    log::debug!(
        "using backend {} at {} with model {}",
        backend.name(),
        backend.endpoint(),
        backend.model()
    );
    Ok(Arc::new(backend))
}
