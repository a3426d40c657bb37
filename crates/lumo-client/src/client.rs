use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use lumo_core::chat::{ChatStreamEvent, ChatStreamInput};
use lumo_core::contract::{ErrorCode, Procedure, RpcError, Validate, ValidationError};
use lumo_core::item::{
    CreateItemInput, DeleteItemInput, DeleteItemOutput, GetItemInput, Item, UpdateItemInput,
};
use lumo_core::security::env_vars;
use lumo_core::sse;

use crate::transport::{ChatEventStream, ChatTransport};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3001";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with the common error envelope.
    #[error("{message}")]
    Rpc { code: ErrorCode, message: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected response ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            Self::Validation(_) => Some(ErrorCode::BadRequest),
            _ => None,
        }
    }
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self {
        Self::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Typed client for the `/rpc/{procedure}` surface.
#[derive(Clone, Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    base_url: String,
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let base_url = base_url.into();
        let parsed = url::Url::parse(&base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(format!("{base_url}: must be http(s)")));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `LUMO_SERVER_URL`, falling back to `http://localhost:3001`.
    pub fn from_env() -> Result<Self, ClientError> {
        let url = std::env::var(env_vars::LUMO_SERVER_URL)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        Self::new(url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn procedure_url(&self, procedure: Procedure) -> String {
        format!("{}/rpc/{}", self.base_url, procedure.path())
    }

    async fn send<I: Serialize>(
        &self,
        procedure: Procedure,
        input: Option<&I>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut req = self.http.post(self.procedure_url(procedure));
        if let Some(input) = input {
            req = req.json(input);
        }
        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<RpcError>(&body) {
            Ok(envelope) => Err(envelope.into()),
            Err(_) => Err(ClientError::UnexpectedResponse { status, body }),
        }
    }

    async fn call<I: Serialize, O: DeserializeOwned>(
        &self,
        procedure: Procedure,
        input: Option<&I>,
    ) -> Result<O, ClientError> {
        debug!(%procedure, "calling");
        let resp = self.send(procedure, input).await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::UnexpectedResponse {
            status,
            body: format!("undecodable output: {e}"),
        })
    }

    pub async fn health_check(&self) -> Result<String, ClientError> {
        self.call::<(), _>(Procedure::HealthCheck, None).await
    }

    pub async fn list_items(&self) -> Result<Vec<Item>, ClientError> {
        self.call::<(), _>(Procedure::ItemList, None).await
    }

    #[instrument(skip(self))]
    pub async fn get_item(&self, id: i64) -> Result<Item, ClientError> {
        let input = GetItemInput { id };
        input.validate()?;
        self.call(Procedure::ItemGet, Some(&input)).await
    }

    #[instrument(skip(self, input))]
    pub async fn create_item(&self, input: &CreateItemInput) -> Result<Item, ClientError> {
        input.validate()?;
        self.call(Procedure::ItemCreate, Some(input)).await
    }

    #[instrument(skip(self, input), fields(item_id = input.id))]
    pub async fn update_item(&self, input: &UpdateItemInput) -> Result<Item, ClientError> {
        input.validate()?;
        self.call(Procedure::ItemUpdate, Some(input)).await
    }

    #[instrument(skip(self))]
    pub async fn delete_item(&self, id: i64) -> Result<DeleteItemOutput, ClientError> {
        let input = DeleteItemInput { id };
        input.validate()?;
        self.call(Procedure::ItemDelete, Some(&input)).await
    }

    /// Open `chat.stream`. `event: error` frames arrive as `Err` items.
    #[instrument(skip(self, input), fields(messages = input.messages.len()))]
    pub async fn chat_stream(&self, input: &ChatStreamInput) -> Result<ChatEventStream, ClientError> {
        input.validate()?;
        let resp = self.send(Procedure::ChatStream, Some(input)).await?;

        let events = sse::frames(Box::pin(resp.bytes_stream())).filter_map(|frame| async move {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            };
            match frame.event_name() {
                "message" => Some(serde_json::from_str::<ChatStreamEvent>(&frame.data).map_err(|e| {
                    ClientError::UnexpectedResponse {
                        status: 200,
                        body: format!("bad stream event: {e}"),
                    }
                })),
                "error" => Some(Err(serde_json::from_str::<RpcError>(&frame.data)
                    .map(ClientError::from)
                    .unwrap_or_else(|_| ClientError::Rpc {
                        code: ErrorCode::InternalError,
                        message: frame.data.clone(),
                    }))),
                other => {
                    debug!(event = other, "ignoring unknown stream event");
                    None
                }
            }
        });

        Ok(Box::pin(events))
    }
}

#[async_trait]
impl ChatTransport for RpcClient {
    async fn open_chat_stream(&self, input: ChatStreamInput) -> Result<ChatEventStream, ClientError> {
        self.chat_stream(&input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lumo_core::chat::ChatMessage;
    use lumo_core::errors::GatewayError;
    use lumo_core::security::ApiKey;
    use lumo_llm::{MockProvider, MockResponse};
    use lumo_server::{ServerConfig, ServerHandle};
    use lumo_store::Database;

    async fn server(responses: Vec<MockResponse>, api_key: Option<&str>) -> (ServerHandle, RpcClient) {
        let config = ServerConfig {
            port: 0,
            openai_api_key: api_key.map(ApiKey::new),
            ..Default::default()
        };
        let provider = Arc::new(MockProvider::new(responses));
        let handle = lumo_server::start(config, Database::in_memory().unwrap(), provider)
            .await
            .unwrap();
        let client = RpcClient::new(handle.url()).unwrap();
        (handle, client)
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(matches!(RpcClient::new("ftp://example.com"), Err(ClientError::InvalidUrl(_))));
        assert!(matches!(RpcClient::new("not a url"), Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn procedure_urls() {
        let client = RpcClient::new("http://localhost:3001/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:3001");
        assert_eq!(
            client.procedure_url(Procedure::ItemGet),
            "http://localhost:3001/rpc/item.get"
        );
    }

    #[tokio::test]
    async fn item_round_trip() {
        let (_handle, client) = server(vec![], None).await;

        assert_eq!(client.health_check().await.unwrap(), "ok");
        assert!(client.list_items().await.unwrap().is_empty());

        let item = client
            .create_item(&CreateItemInput {
                name: "Milk".into(),
                description: None,
            })
            .await
            .unwrap();
        assert_eq!(client.get_item(item.id).await.unwrap(), item);

        let updated = client
            .update_item(&UpdateItemInput {
                id: item.id,
                description: Some("2L".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.description.as_deref(), Some("2L"));

        assert!(client.delete_item(item.id).await.unwrap().success);
        let err = client.get_item(item.id).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotFound));
        assert_eq!(err.to_string(), "Not Found");
    }

    #[tokio::test]
    async fn invalid_input_fails_before_sending() {
        let client = RpcClient::new("http://127.0.0.1:9").unwrap();
        let err = client
            .create_item(&CreateItemInput {
                name: String::new(),
                description: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn chat_stream_yields_events() {
        let (_handle, client) = server(vec![MockResponse::stream_text(&["Hel", "lo"])], Some("sk")).await;

        let input = ChatStreamInput::new(vec![ChatMessage::user("Hi")]);
        let events: Vec<_> = client.chat_stream(&input).await.unwrap().collect().await;
        let events: Vec<_> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                ChatStreamEvent::Delta { text: "Hel".into() },
                ChatStreamEvent::Delta { text: "lo".into() },
                ChatStreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn chat_stream_errors() {
        let (_handle, client) = server(
            vec![MockResponse::Error(GatewayError::AuthenticationFailed("bad key".into()))],
            None,
        )
        .await;
        let input = ChatStreamInput::new(vec![ChatMessage::user("Hi")]);

        // No key on either side: rejected before streaming.
        let err = client.chat_stream(&input).await.err().unwrap();
        assert_eq!(err.code(), Some(ErrorCode::Unauthorized));

        // Upstream rejects the key: an error frame inside the stream.
        let mut with_key = input.clone();
        with_key.openai_api_key = Some("sk-wrong".into());
        let events: Vec<_> = client.chat_stream(&with_key).await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        let err = events.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Unauthorized));
        assert!(err.to_string().contains("bad key"));
    }
}
