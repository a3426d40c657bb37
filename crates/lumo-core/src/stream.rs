use crate::chat::ChatStreamEvent;
use crate::errors::GatewayError;

/// Events emitted by a provider while streaming a completion.
///
/// Ordering contract: `Delta* → (Done | Error)`. Nothing follows a terminal event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Delta { text: String },
    Done { finish_reason: Option<String> },
    Error { error: GatewayError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// The wire event a client sees, if any. Errors travel separately.
    pub fn to_wire(&self) -> Option<ChatStreamEvent> {
        match self {
            Self::Delta { text } => Some(ChatStreamEvent::Delta { text: text.clone() }),
            Self::Done { .. } => Some(ChatStreamEvent::Done),
            Self::Error { .. } => None,
        }
    }
}
