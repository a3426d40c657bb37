use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::chat::{ChatMessage, OpenAIModel};
use crate::errors::GatewayError;
use crate::security::ApiKey;
use crate::stream::StreamEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A resolved upstream request: overrides from the client already merged
/// with server defaults.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: OpenAIModel,
    pub messages: Vec<ChatMessage>,
    pub api_key: Option<ApiKey>,
    pub base_url: Option<String>,
}

impl ChatRequest {
    pub fn new(model: OpenAIModel, messages: Vec<ChatMessage>) -> Self {
        Self {
            model,
            messages,
            api_key: None,
            base_url: None,
        }
    }
}

/// Implemented by each upstream chat backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Open a completion stream. Failures before the first byte are returned
    /// as `Err`; failures after that arrive as `StreamEvent::Error`.
    async fn stream(&self, request: &ChatRequest) -> Result<EventStream, GatewayError>;
}
