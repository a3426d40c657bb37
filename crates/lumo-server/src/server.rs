use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

use lumo_core::chat::ChatStreamInput;
use lumo_core::contract::{ErrorCode, Procedure, RpcError};
use lumo_core::ids::RequestId;
use lumo_core::provider::ChatProvider;
use lumo_core::stream::StreamEvent;
use lumo_store::Database;

use crate::config::ServerConfig;
use crate::handlers::{self, HandlerState};
use crate::rpc::{gateway_rpc_error, parse_input, ApiError};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
}

/// Build the Axum router with all routes. The timeout applies to unary
/// routes only.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let unary = with_timeout(
        Router::new()
            .route("/health", get(health_handler))
            .route("/rpc/{procedure}", get(rpc_handler).post(rpc_handler)),
        request_timeout,
    );

    let streaming = Router::new().route("/rpc/chat.stream", post(chat_stream_handler));

    unary
        .merge(streaming)
        .fallback(fallback_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Apply the request timeout. A timed-out request answers with the common
/// error envelope instead of a bare 408.
fn with_timeout<S>(router: Router<S>, timeout: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(TimeoutLayer::new(timeout))
        .layer(middleware::map_response(timeout_envelope))
}

async fn timeout_envelope(response: Response) -> Response {
    if response.status() != StatusCode::REQUEST_TIMEOUT {
        return response;
    }
    warn!("request timed out");
    ApiError(RpcError::with_message(ErrorCode::InternalError, "Request timed out")).into_response()
}

async fn fallback_handler(uri: Uri) -> ApiError {
    ApiError(RpcError::with_message(
        ErrorCode::NotFound,
        format!("No route for {}", uri.path()),
    ))
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    db: Database,
    provider: Arc<dyn ChatProvider>,
) -> Result<ServerHandle, std::io::Error> {
    let handler_state = HandlerState::new(db, provider)
        .with_openai_defaults(config.openai_api_key.clone(), config.openai_base_url.clone());
    let state = AppState {
        handler_state: Arc::new(handler_state),
    };

    let router = build_router(state, config.request_timeout());
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "lumo server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone().cancelled_owned();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(signal).await {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            warn!(error = %e, "server task failed");
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.handler_state.db.ping() {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable" })),
            )
        }
    }
}

async fn rpc_handler(
    State(state): State<AppState>,
    Path(procedure): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let procedure: Procedure = procedure.parse()?;
    let span = tracing::info_span!("rpc", request_id = %RequestId::new(), %procedure);
    span.in_scope(|| handlers::dispatch(&state.handler_state, procedure, &body)).map(Json)
}

async fn chat_stream_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request_id = RequestId::new();
    let span = tracing::info_span!(
        "rpc",
        request_id = %request_id,
        procedure = %Procedure::ChatStream
    );

    let input = span.in_scope(|| parse_input::<ChatStreamInput>(&body))?;
    let request = state.handler_state.resolve_chat_request(&input)?;
    span.in_scope(|| {
        info!(model = %request.model, messages = request.messages.len(), "chat stream opened")
    });

    let provider = Arc::clone(&state.handler_state.provider);
    let opened = async move { provider.stream(&request).await }.instrument(span.clone());

    // Dropping the body (client disconnect) drops the upstream stream with it.
    let events = futures::stream::once(opened)
        .flat_map(|opened| match opened {
            Ok(events) => events,
            Err(error) => futures::stream::iter([StreamEvent::Error { error }]).boxed(),
        })
        .scan(false, |finished, event| {
            if *finished {
                return futures::future::ready(None);
            }
            *finished = event.is_terminal();
            futures::future::ready(Some(event))
        })
        .map(move |event| {
            if let StreamEvent::Error { error } = &event {
                span.in_scope(|| warn!(kind = error.error_kind(), error = %error, "chat stream failed"));
            }
            Ok::<_, Infallible>(sse_event(event))
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn json_event(name: &'static str, value: &impl serde::Serialize) -> Event {
    Event::default().event(name).json_data(value).unwrap_or_else(|e| {
        Event::default()
            .event("error")
            .data(format!(r#"{{"code":"INTERNAL_ERROR","message":"{e}"}}"#))
    })
}

/// `event: message` for deltas and done; `event: error` with the common
/// error envelope for failures.
fn sse_event(event: StreamEvent) -> Event {
    if let Some(wire) = event.to_wire() {
        return json_event("message", &wire);
    }
    let error = match &event {
        StreamEvent::Error { error } => gateway_rpc_error(error),
        _ => RpcError::internal("unexpected stream event"),
    };
    json_event("error", &error)
}
