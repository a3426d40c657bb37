use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use lumo_core::chat::{ChatStreamEvent, ChatStreamInput};

use crate::client::ClientError;

pub type ChatEventStream = Pin<Box<dyn Stream<Item = Result<ChatStreamEvent, ClientError>> + Send>>;

/// Opens `chat.stream` event iterators for the chat store.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_chat_stream(&self, input: ChatStreamInput) -> Result<ChatEventStream, ClientError>;
}
