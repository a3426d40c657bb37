//! Client-side chat state: conversation, request lifecycle and incremental
//! application of streamed deltas.
//!
//! Every run is tagged with the `request_id` current when it started. A run
//! whose id is no longer current stops applying events, so a newer request
//! or a cleared conversation never receives stale text.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lumo_core::chat::{ChatMessage, ChatRole, ChatStreamEvent, OpenAIModel};

use crate::client::ClientError;
use crate::settings::ChatSettings;
use crate::transport::ChatTransport;

const SEND_FAILED: &str = "Chat request failed";
const REGENERATE_FAILED: &str = "Failed to regenerate";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    #[default]
    Ready,
    Submitted,
    Streaming,
    Error,
}

impl ChatStatus {
    /// Whether a new send or regenerate may start.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }

    pub fn is_busy(self) -> bool {
        matches!(self, Self::Submitted | Self::Streaming)
    }
}

/// Observable chat state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChatState {
    pub input: String,
    pub messages: Vec<ChatMessage>,
    pub status: ChatStatus,
    pub error: Option<String>,
    pub settings: ChatSettings,
    pub request_id: u64,
}

struct Inner {
    state: ChatState,
    cancel: Option<CancellationToken>,
}

impl Inner {
    /// A run may touch state only while its id is current and its token is
    /// live. `stop` and `clear_conversation` cancel under this same lock.
    fn is_current(&self, request_id: u64, token: &CancellationToken) -> bool {
        self.state.request_id == request_id && !token.is_cancelled()
    }
}

/// Chat store shared by front-ends. Cloning yields another handle to the
/// same state.
pub struct ChatStore<T: ChatTransport> {
    transport: Arc<T>,
    inner: Arc<Mutex<Inner>>,
    snapshots: Arc<watch::Sender<ChatState>>,
    settings_path: Option<PathBuf>,
}

impl<T: ChatTransport> Clone for ChatStore<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            inner: Arc::clone(&self.inner),
            snapshots: Arc::clone(&self.snapshots),
            settings_path: self.settings_path.clone(),
        }
    }
}

impl<T: ChatTransport + 'static> ChatStore<T> {
    /// Settings are loaded from `settings_path` when given and written back
    /// on every settings change.
    pub fn new(transport: T, settings_path: Option<PathBuf>) -> Self {
        let settings = settings_path
            .as_deref()
            .map(ChatSettings::load)
            .unwrap_or_default();
        let state = ChatState {
            settings,
            ..Default::default()
        };
        let (snapshots, _) = watch::channel(state.clone());

        Self {
            transport: Arc::new(transport),
            inner: Arc::new(Mutex::new(Inner { state, cancel: None })),
            snapshots: Arc::new(snapshots),
            settings_path,
        }
    }

    pub fn snapshot(&self) -> ChatState {
        self.inner.lock().state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.snapshots.subscribe()
    }

    /// Mutate under the lock and publish the result.
    fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut *inner);
        self.snapshots.send_replace(inner.state.clone());
        result
    }

    pub fn set_input(&self, value: impl Into<String>) {
        let value = value.into();
        self.update(|inner| inner.state.input = value);
    }

    pub fn set_model(&self, model: OpenAIModel) {
        self.update_settings(|s| s.model = model);
    }

    pub fn set_openai_api_key(&self, value: impl Into<String>) {
        let value = value.into();
        self.update_settings(|s| s.openai_api_key = value);
    }

    pub fn set_openai_base_url(&self, value: impl Into<String>) {
        let value = value.into();
        self.update_settings(|s| s.openai_base_url = value);
    }

    fn update_settings(&self, f: impl FnOnce(&mut ChatSettings)) {
        let settings = self.update(|inner| {
            f(&mut inner.state.settings);
            inner.state.settings.clone()
        });
        if let Some(path) = &self.settings_path {
            if let Err(e) = settings.save(path) {
                warn!(path = %path.display(), error = %e, "failed to persist chat settings");
            }
        }
    }

    /// Send the current input. Resolves when the run finishes, fails, is
    /// stopped or is superseded.
    pub async fn send_message(&self) {
        let started = self.update(|inner| {
            let text = inner.state.input.trim().to_string();
            if text.is_empty() || !inner.state.status.is_idle() {
                return None;
            }

            let state = &mut inner.state;
            state.messages.push(ChatMessage::user(text));
            state.messages.push(ChatMessage::assistant_placeholder());
            state.request_id += 1;
            state.input.clear();
            state.error = None;
            state.status = ChatStatus::Submitted;

            let token = CancellationToken::new();
            inner.cancel = Some(token.clone());
            Some(Run {
                messages: state.messages.clone(),
                settings: state.settings.clone(),
                request_id: state.request_id,
                token,
            })
        });

        if let Some(run) = started {
            self.execute(run, SEND_FAILED).await;
        }
    }

    /// Drop the last assistant reply and everything after it, then stream a
    /// fresh one.
    pub async fn regenerate(&self) {
        let started = self.update(|inner| {
            let state = &mut inner.state;
            if state.messages.is_empty() || !state.status.is_idle() {
                return None;
            }
            let last_assistant = state
                .messages
                .iter()
                .rposition(|m| m.role == ChatRole::Assistant)?;

            state.messages.truncate(last_assistant);
            state.messages.push(ChatMessage::assistant_placeholder());
            state.request_id += 1;
            state.error = None;
            state.status = ChatStatus::Submitted;

            let token = CancellationToken::new();
            inner.cancel = Some(token.clone());
            Some(Run {
                messages: state.messages.clone(),
                settings: state.settings.clone(),
                request_id: state.request_id,
                token,
            })
        });

        if let Some(run) = started {
            self.execute(run, REGENERATE_FAILED).await;
        }
    }

    /// Cancel the active run, if any, and return to `ready`.
    pub fn stop(&self) {
        self.update(|inner| {
            if !inner.state.status.is_busy() {
                return;
            }
            let Some(token) = inner.cancel.take() else {
                return;
            };
            token.cancel();
            inner.state.status = ChatStatus::Ready;
        });
    }

    /// Cancel any active run and reset the conversation. Settings and the
    /// request counter are kept.
    pub fn clear_conversation(&self) {
        self.update(|inner| {
            if let Some(token) = inner.cancel.take() {
                token.cancel();
            }
            let state = &mut inner.state;
            state.input.clear();
            state.messages.clear();
            state.status = ChatStatus::Ready;
            state.error = None;
        });
    }

    async fn execute(&self, run: Run, fallback: &str) {
        let request_id = run.request_id;
        let token = run.token.clone();

        let Err(e) = self.run_stream(run).await else {
            return;
        };
        if token.is_cancelled() {
            debug!(request_id, "run cancelled");
            return;
        }

        let message = match e.to_string() {
            m if m.trim().is_empty() => fallback.to_string(),
            m => m,
        };
        warn!(request_id, error = %message, "chat run failed");
        self.update(|inner| {
            if !inner.is_current(request_id, &token) {
                return;
            }
            inner.state.status = ChatStatus::Error;
            inner.state.error = Some(message);
            inner.cancel = None;
        });
    }

    async fn run_stream(&self, run: Run) -> Result<(), ClientError> {
        let Run {
            messages,
            settings,
            request_id,
            token,
        } = run;
        let input = settings.to_stream_input(&messages);

        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ClientError::Cancelled),
            opened = self.transport.open_chat_stream(input) => opened?,
        };

        let current = self.update(|inner| {
            let current = inner.is_current(request_id, &token);
            if current {
                inner.state.status = ChatStatus::Streaming;
            }
            current
        });
        if !current {
            return Ok(());
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ClientError::Cancelled),
                next = stream.next() => next,
            };
            let Some(event) = next else {
                break;
            };

            match event? {
                ChatStreamEvent::Delta { text } => {
                    let current = self.update(|inner| {
                        if !inner.is_current(request_id, &token) {
                            return false;
                        }
                        if let Some(last) = inner.state.messages.last_mut() {
                            if last.role == ChatRole::Assistant {
                                last.content.push_str(&text);
                            }
                        }
                        true
                    });
                    if !current {
                        return Ok(());
                    }
                }
                ChatStreamEvent::Done => {
                    self.update(|inner| {
                        if inner.is_current(request_id, &token) {
                            inner.state.status = ChatStatus::Ready;
                            inner.state.error = None;
                            inner.cancel = None;
                        }
                    });
                    return Ok(());
                }
            }
        }

        // Stream ended without `done`.
        self.update(|inner| {
            if inner.is_current(request_id, &token) {
                inner.state.status = ChatStatus::Ready;
                inner.cancel = None;
            }
        });
        Ok(())
    }
}

struct Run {
    messages: Vec<ChatMessage>,
    settings: ChatSettings,
    request_id: u64,
    token: CancellationToken,
}
