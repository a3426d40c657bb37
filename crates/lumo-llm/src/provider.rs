use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use lumo_core::errors::GatewayError;
use lumo_core::provider::{ChatProvider, ChatRequest, EventStream};
use lumo_core::security::ApiKey;
use lumo_core::sse::{self, SseFrame};
use lumo_core::stream::StreamEvent;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Streaming client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiProvider {
    client: Client,
    default_api_key: Option<ApiKey>,
    default_base_url: String,
    idle_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(
        default_api_key: Option<ApiKey>,
        default_base_url: Option<String>,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            default_api_key,
            default_base_url: default_base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            idle_timeout: SSE_IDLE_TIMEOUT,
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn default_base_url(&self) -> &str {
        &self.default_base_url
    }

    fn endpoint(&self, request: &ChatRequest) -> String {
        let base = request.base_url.as_deref().unwrap_or(&self.default_base_url);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    fn resolve_key<'a>(&'a self, request: &'a ChatRequest) -> Result<&'a ApiKey, GatewayError> {
        request
            .api_key
            .as_ref()
            .or(self.default_api_key.as_ref())
            .ok_or(GatewayError::MissingApiKey)
    }
}

pub(crate) fn build_request_body(request: &ChatRequest) -> serde_json::Value {
    let messages: Vec<_> = request
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();

    json!({
        "model": request.model.as_str(),
        "messages": messages,
        "stream": true,
    })
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, request), fields(model = %request.model, messages = request.messages.len()))]
    async fn stream(&self, request: &ChatRequest) -> Result<EventStream, GatewayError> {
        let key = self.resolve_key(request)?;
        let url = self.endpoint(request);
        debug!(%url, "opening completion stream");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(key.expose())
            .header("accept", "text/event-stream")
            .json(&build_request_body(request))
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            let error = match GatewayError::from_status(status, error_message(&body)) {
                GatewayError::RateLimited { .. } => GatewayError::RateLimited { retry_after },
                other => other,
            };
            warn!(status, kind = error.error_kind(), "upstream rejected request");
            return Err(error);
        }

        let frames = sse::frames(Box::pin(resp.bytes_stream()));
        Ok(event_stream(frames, self.idle_timeout))
    }
}

/// Prefer the `error.message` of an OpenAI error body over the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error.message)
        .unwrap_or_else(|| body.to_string())
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<serde_json::Value>,
}

impl ApiErrorBody {
    fn into_gateway_error(self) -> GatewayError {
        let message = self.message.unwrap_or_else(|| "upstream error".to_string());
        let code = self.code.as_ref().and_then(|c| c.as_str()).unwrap_or_default();
        match (self.kind.as_deref().unwrap_or_default(), code) {
            ("authentication_error", _) | (_, "invalid_api_key") => {
                GatewayError::AuthenticationFailed(message)
            }
            (_, "rate_limit_exceeded") | ("rate_limit_error", _) => {
                GatewayError::RateLimited { retry_after: None }
            }
            ("invalid_request_error", _) => GatewayError::InvalidRequest(message),
            _ => GatewayError::StreamInterrupted(message),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Chunk {
    Error { error: ApiErrorBody },
    Completion { choices: Vec<Choice> },
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

enum ChunkOutcome {
    Delta(String),
    Finished(String),
    Done,
    Error(GatewayError),
    Skip,
}

fn parse_chunk(data: &str) -> ChunkOutcome {
    let data = data.trim();
    if data == "[DONE]" {
        return ChunkOutcome::Done;
    }
    match serde_json::from_str::<Chunk>(data) {
        Ok(Chunk::Error { error }) => ChunkOutcome::Error(error.into_gateway_error()),
        Ok(Chunk::Completion { choices }) => {
            let Some(choice) = choices.into_iter().next() else {
                return ChunkOutcome::Skip;
            };
            let text = choice.delta.and_then(|d| d.content).unwrap_or_default();
            match (text.is_empty(), choice.finish_reason) {
                (false, _) => ChunkOutcome::Delta(text),
                (true, Some(reason)) => ChunkOutcome::Finished(reason),
                (true, None) => ChunkOutcome::Skip,
            }
        }
        Err(e) => {
            debug!(error = %e, "skipping unparseable chunk");
            ChunkOutcome::Skip
        }
    }
}

struct StreamState<S> {
    frames: std::pin::Pin<Box<S>>,
    finish_reason: Option<String>,
}

/// Map SSE frames to provider events. Ends after the first terminal event.
/// No frame within `idle_timeout` ends the stream with `StreamInterrupted`.
fn event_stream<S, E>(frames: S, idle_timeout: Duration) -> EventStream
where
    S: Stream<Item = Result<SseFrame, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = StreamState {
        frames: Box::pin(frames),
        finish_reason: None,
    };

    Box::pin(futures::stream::unfold(Some(state), move |state| async move {
        let mut state = state?;
        loop {
            let next = match tokio::time::timeout(idle_timeout, state.frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let error = GatewayError::StreamInterrupted(format!(
                        "idle timeout after {}s",
                        idle_timeout.as_secs()
                    ));
                    return Some((StreamEvent::Error { error }, None));
                }
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    let error = GatewayError::StreamInterrupted(e.to_string());
                    return Some((StreamEvent::Error { error }, None));
                }
                None => {
                    let finish_reason = state.finish_reason.take();
                    return Some((StreamEvent::Done { finish_reason }, None));
                }
            };

            match parse_chunk(&frame.data) {
                ChunkOutcome::Delta(text) => return Some((StreamEvent::Delta { text }, Some(state))),
                ChunkOutcome::Finished(reason) => state.finish_reason = Some(reason),
                ChunkOutcome::Skip => {}
                ChunkOutcome::Done => {
                    let finish_reason = state.finish_reason.take();
                    return Some((StreamEvent::Done { finish_reason }, None));
                }
                ChunkOutcome::Error(error) => return Some((StreamEvent::Error { error }, None)),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumo_core::chat::{ChatMessage, ChatRole, OpenAIModel};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(base_url: &str) -> ChatRequest {
        let mut req = ChatRequest::new(OpenAIModel::Gpt4oMini, vec![ChatMessage::user("Hi")]);
        req.api_key = Some(ApiKey::new("sk-test"));
        req.base_url = Some(base_url.to_string());
        req
    }

    fn sse_body(chunks: &[&str]) -> String {
        chunks.iter().map(|c| format!("data: {c}\n\n")).collect()
    }

    async fn collect(stream: EventStream) -> Vec<StreamEvent> {
        stream.collect().await
    }

    #[test]
    fn request_body_shape() {
        let req = ChatRequest::new(
            OpenAIModel::Gpt4o,
            vec![
                ChatMessage::new(ChatRole::System, "be brief"),
                ChatMessage::user("Hi"),
            ],
        );
        let body = build_request_body(&req);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let provider = OpenAiProvider::new(None, Some("http://localhost:8080/v1/".into())).unwrap();
        let req = ChatRequest::new(OpenAIModel::Gpt4oMini, vec![]);
        assert_eq!(provider.endpoint(&req), "http://localhost:8080/v1/chat/completions");
        assert_eq!(
            OpenAiProvider::new(None, None).unwrap().endpoint(&req),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn chunk_parsing() {
        assert!(matches!(parse_chunk("[DONE]"), ChunkOutcome::Done));
        assert!(matches!(
            parse_chunk(r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#),
            ChunkOutcome::Delta(t) if t == "Hel"
        ));
        assert!(matches!(
            parse_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            ChunkOutcome::Skip
        ));
        assert!(matches!(
            parse_chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            ChunkOutcome::Finished(r) if r == "stop"
        ));
        assert!(matches!(parse_chunk(r#"{"choices":[]}"#), ChunkOutcome::Skip));
        assert!(matches!(parse_chunk("not json"), ChunkOutcome::Skip));
    }

    #[test]
    fn error_chunk_classification() {
        let auth = parse_chunk(r#"{"error":{"message":"bad key","type":"invalid_request_error","code":"invalid_api_key"}}"#);
        assert!(matches!(auth, ChunkOutcome::Error(GatewayError::AuthenticationFailed(m)) if m == "bad key"));

        let invalid = parse_chunk(r#"{"error":{"message":"too long","type":"invalid_request_error"}}"#);
        assert!(matches!(invalid, ChunkOutcome::Error(GatewayError::InvalidRequest(_))));

        let other = parse_chunk(r#"{"error":{"message":"overloaded","type":"server_error"}}"#);
        assert!(matches!(other, ChunkOutcome::Error(GatewayError::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini", "stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(None, None).unwrap();
        let stream = provider.stream(&request(&format!("{}/v1", server.uri()))).await.unwrap();
        let events = collect(stream).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Delta { text: "Hel".into() },
                StreamEvent::Delta { text: "lo".into() },
                StreamEvent::Done { finish_reason: Some("stop".into()) },
            ]
        );
    }

    #[tokio::test]
    async fn end_of_body_without_done_marker_is_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&[r#"{"choices":[{"delta":{"content":"x"}}]}"#])),
            )
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(None, None).unwrap();
        let events = collect(provider.stream(&request(&server.uri())).await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::Done { finish_reason: None });
    }

    #[tokio::test]
    async fn default_key_and_base_url_used() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-server"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse_body(&["[DONE]"])))
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            OpenAiProvider::new(Some(ApiKey::new("sk-server")), Some(server.uri())).unwrap();
        let req = ChatRequest::new(OpenAIModel::Gpt4oMini, vec![ChatMessage::user("Hi")]);
        let events = collect(provider.stream(&req).await.unwrap()).await;
        assert_eq!(events, vec![StreamEvent::Done { finish_reason: None }]);
    }

    #[tokio::test]
    async fn missing_key_fails_before_request() {
        let provider = OpenAiProvider::new(None, None).unwrap();
        let req = ChatRequest::new(OpenAIModel::Gpt4oMini, vec![ChatMessage::user("Hi")]);
        let err = provider.stream(&req).await.err().unwrap();
        assert_eq!(err, GatewayError::MissingApiKey);
    }

    #[tokio::test]
    async fn http_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(401).set_body_json(
                json!({"error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}}),
            ))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(None, None).unwrap();
        let err = provider.stream(&request(&server.uri())).await.err().unwrap();
        assert_eq!(
            err,
            GatewayError::AuthenticationFailed("Incorrect API key provided".into())
        );
    }

    #[tokio::test]
    async fn rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(None, None).unwrap();
        let err = provider.stream(&request(&server.uri())).await.err().unwrap();
        assert_eq!(
            err,
            GatewayError::RateLimited { retry_after: Some(Duration::from_secs(7)) }
        );
    }

    #[tokio::test]
    async fn error_chunk_mid_stream_ends_stream() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"content":"partial"}}]}"#,
            r#"{"error":{"message":"model overloaded","type":"server_error"}}"#,
            r#"{"choices":[{"delta":{"content":"never"}}]}"#,
        ]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(None, None).unwrap();
        let events = collect(provider.stream(&request(&server.uri())).await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            StreamEvent::Error { error: GatewayError::StreamInterrupted(m) } if m == "model overloaded"
        ));
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        // Nothing listens on port 9 locally.
        let provider = OpenAiProvider::new(None, None).unwrap();
        let err = provider.stream(&request("http://127.0.0.1:9")).await.err().unwrap();
        assert!(matches!(err, GatewayError::NetworkError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires_when_no_data() {
        let frames = futures::stream::pending::<Result<SseFrame, std::io::Error>>();
        let mut stream = event_stream(frames, Duration::from_secs(5));

        let event = stream.next().await;
        assert!(
            matches!(&event, Some(StreamEvent::Error { error: GatewayError::StreamInterrupted(msg) }) if msg.contains("idle timeout")),
            "expected idle timeout error, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_resets_on_data() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<SseFrame, std::io::Error>>(4);
        let frames = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let mut stream = event_stream(frames, Duration::from_secs(5));

        let frame = |data: &str| SseFrame { event: None, data: data.to_string() };
        tx.send(Ok(frame(r#"{"choices":[{"delta":{"content":"a"}}]}"#))).await.unwrap();
        assert_eq!(stream.next().await, Some(StreamEvent::Delta { text: "a".into() }));

        tokio::time::advance(Duration::from_secs(4)).await;
        tx.send(Ok(frame(r#"{"choices":[{"delta":{"content":"b"}}]}"#))).await.unwrap();
        assert_eq!(stream.next().await, Some(StreamEvent::Delta { text: "b".into() }));

        drop(tx);
        assert_eq!(stream.next().await, Some(StreamEvent::Done { finish_reason: None }));
    }

    #[test]
    fn timeout_constants() {
        assert_eq!(CONNECT_TIMEOUT, Duration::from_secs(30));
        assert_eq!(SSE_IDLE_TIMEOUT, Duration::from_secs(90));
    }
}
