//! Procedure handlers for the unary RPC surface, plus chat request resolution.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use lumo_core::chat::ChatStreamInput;
use lumo_core::contract::{ErrorCode, Procedure, RpcError};
use lumo_core::item::{CreateItemInput, DeleteItemInput, DeleteItemOutput, GetItemInput, UpdateItemInput};
use lumo_core::provider::{ChatProvider, ChatRequest};
use lumo_core::security::ApiKey;
use lumo_llm::DEFAULT_BASE_URL;
use lumo_store::{Database, ItemRepo};

use crate::rpc::{parse_input, to_output, ApiError};

/// Shared state available to all handlers.
pub struct HandlerState {
    pub db: Database,
    pub items: ItemRepo,
    pub provider: Arc<dyn ChatProvider>,
    pub default_api_key: Option<ApiKey>,
    pub default_base_url: Option<String>,
}

impl HandlerState {
    pub fn new(db: Database, provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            items: ItemRepo::new(db.clone()),
            db,
            provider,
            default_api_key: None,
            default_base_url: None,
        }
    }

    pub fn with_openai_defaults(mut self, api_key: Option<ApiKey>, base_url: Option<String>) -> Self {
        self.default_api_key = api_key;
        self.default_base_url = base_url;
        self
    }

    /// Merge client overrides with server defaults. Fails with `UNAUTHORIZED`
    /// when neither side supplies an API key.
    pub fn resolve_chat_request(&self, input: &ChatStreamInput) -> Result<ChatRequest, RpcError> {
        let api_key = input
            .openai_api_key
            .as_deref()
            .map(ApiKey::new)
            .or_else(|| self.default_api_key.clone())
            .ok_or_else(|| {
                RpcError::with_message(ErrorCode::Unauthorized, "OpenAI API key is not configured")
            })?;
        let base_url = input
            .openai_base_url
            .clone()
            .or_else(|| self.default_base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let mut request = ChatRequest::new(input.model.unwrap_or_default(), input.conversation().to_vec());
        request.api_key = Some(api_key);
        request.base_url = Some(base_url);
        Ok(request)
    }
}

/// Dispatch a unary procedure. `chat.stream` is served separately.
pub fn dispatch(state: &HandlerState, procedure: Procedure, body: &[u8]) -> Result<Value, ApiError> {
    debug!(%procedure, "dispatching");
    match procedure {
        Procedure::HealthCheck => Ok(Value::String("ok".into())),
        Procedure::ItemList => item_list(state),
        Procedure::ItemGet => item_get(state, parse_input(body)?),
        Procedure::ItemCreate => item_create(state, parse_input(body)?),
        Procedure::ItemUpdate => item_update(state, parse_input(body)?),
        Procedure::ItemDelete => item_delete(state, parse_input(body)?),
        Procedure::ChatStream => Err(ApiError(RpcError::bad_request(
            "chat.stream is an event stream; POST it to /rpc/chat.stream",
        ))),
    }
}

#[instrument(skip(state))]
fn item_list(state: &HandlerState) -> Result<Value, ApiError> {
    to_output(&state.items.list()?)
}

#[instrument(skip(state), fields(item_id = input.id))]
fn item_get(state: &HandlerState, input: GetItemInput) -> Result<Value, ApiError> {
    let item = state.items.get(input.id)?.ok_or_else(RpcError::not_found)?;
    to_output(&item)
}

#[instrument(skip(state, input))]
fn item_create(state: &HandlerState, input: CreateItemInput) -> Result<Value, ApiError> {
    to_output(&state.items.create(&input)?)
}

#[instrument(skip(state, input), fields(item_id = input.id))]
fn item_update(state: &HandlerState, input: UpdateItemInput) -> Result<Value, ApiError> {
    if state.items.get(input.id)?.is_none() {
        return Err(RpcError::not_found().into());
    }
    to_output(&state.items.update(&input)?)
}

#[instrument(skip(state), fields(item_id = input.id))]
fn item_delete(state: &HandlerState, input: DeleteItemInput) -> Result<Value, ApiError> {
    if state.items.get(input.id)?.is_none() {
        return Err(RpcError::not_found().into());
    }
    state.items.delete(input.id)?;
    to_output(&DeleteItemOutput { success: true })
}
