use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::contract::{Validate, ValidationError};
use crate::ids::MessageId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Models the chat proxy accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenAIModel {
    #[default]
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
    #[serde(rename = "gpt-4o")]
    Gpt4o,
}

impl OpenAIModel {
    pub const ALL: [OpenAIModel; 2] = [Self::Gpt4oMini, Self::Gpt4o];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gpt4oMini => "gpt-4o-mini",
            Self::Gpt4o => "gpt-4o",
        }
    }
}

impl fmt::Display for OpenAIModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpenAIModel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ValidationError::new("model", format!("unsupported model: {s}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    /// An empty assistant message that deltas are appended to.
    pub fn assistant_placeholder() -> Self {
        Self::new(ChatRole::Assistant, "")
    }

    pub fn is_empty_assistant(&self) -> bool {
        self.role == ChatRole::Assistant && self.content.is_empty()
    }
}

/// Input of the `chat.stream` procedure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStreamInput {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<OpenAIModel>,
    #[serde(rename = "openAIApiKey", default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(rename = "openAIBaseURL", default, skip_serializing_if = "Option::is_none")]
    pub openai_base_url: Option<String>,
}

impl ChatStreamInput {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            openai_api_key: None,
            openai_base_url: None,
        }
    }

    /// Messages to forward upstream: the trailing empty assistant placeholder,
    /// if any, is not part of the conversation.
    pub fn conversation(&self) -> &[ChatMessage] {
        match self.messages.split_last() {
            Some((last, rest)) if last.is_empty_assistant() => rest,
            _ => &self.messages,
        }
    }
}

impl Validate for ChatStreamInput {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.messages.is_empty() {
            return Err(ValidationError::new("messages", "must contain at least 1 message"));
        }
        if let Some(idx) = self.messages.iter().position(|m| m.id.as_str().is_empty()) {
            return Err(ValidationError::new(
                format!("messages[{idx}].id"),
                "must not be empty",
            ));
        }
        if matches!(&self.openai_api_key, Some(k) if k.is_empty()) {
            return Err(ValidationError::new("openAIApiKey", "must not be empty"));
        }
        if let Some(base) = &self.openai_base_url {
            let parsed = url::Url::parse(base)
                .map_err(|e| ValidationError::new("openAIBaseURL", format!("invalid URL: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ValidationError::new("openAIBaseURL", "must be an http(s) URL"));
            }
        }
        Ok(())
    }
}

/// One event of the `chat.stream` event iterator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatStreamEvent {
    Delta { text: String },
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(messages: Vec<ChatMessage>) -> ChatStreamInput {
        ChatStreamInput::new(messages)
    }

    #[test]
    fn stream_event_wire_format() {
        let delta = ChatStreamEvent::Delta { text: "Hel".into() };
        assert_eq!(
            serde_json::to_value(&delta).unwrap(),
            serde_json::json!({"type": "delta", "text": "Hel"})
        );
        let done: ChatStreamEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(done, ChatStreamEvent::Done);
    }

    #[test]
    fn input_uses_camel_case_wire_names() {
        let mut i = input(vec![ChatMessage::user("hi")]);
        i.model = Some(OpenAIModel::Gpt4o);
        i.openai_api_key = Some("sk-test".into());
        i.openai_base_url = Some("http://localhost:8080/v1".into());
        let json = serde_json::to_value(&i).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["openAIApiKey"], "sk-test");
        assert_eq!(json["openAIBaseURL"], "http://localhost:8080/v1");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn optional_fields_omitted() {
        let json = serde_json::to_value(input(vec![ChatMessage::user("hi")])).unwrap();
        assert!(json.get("model").is_none());
        assert!(json.get("openAIApiKey").is_none());
    }

    #[test]
    fn empty_messages_rejected() {
        assert_eq!(input(vec![]).validate().unwrap_err().field, "messages");
    }

    #[test]
    fn empty_message_id_rejected() {
        let mut msg = ChatMessage::user("hi");
        msg.id = MessageId::from_raw("");
        assert_eq!(input(vec![msg]).validate().unwrap_err().field, "messages[0].id");
    }

    #[test]
    fn empty_api_key_rejected() {
        let mut i = input(vec![ChatMessage::user("hi")]);
        i.openai_api_key = Some(String::new());
        assert_eq!(i.validate().unwrap_err().field, "openAIApiKey");
    }

    #[test]
    fn base_url_must_be_http() {
        let mut i = input(vec![ChatMessage::user("hi")]);
        i.openai_base_url = Some("not a url".into());
        assert!(i.validate().is_err());
        i.openai_base_url = Some("ftp://example.com".into());
        assert!(i.validate().is_err());
        i.openai_base_url = Some("https://api.example.com/v1".into());
        assert!(i.validate().is_ok());
    }

    #[test]
    fn unknown_model_rejected_on_decode() {
        let raw = r#"{"messages":[{"id":"a","role":"user","content":"x"}],"model":"gpt-5"}"#;
        assert!(serde_json::from_str::<ChatStreamInput>(raw).is_err());
        assert!("gpt-5".parse::<OpenAIModel>().is_err());
        assert_eq!("gpt-4o".parse::<OpenAIModel>().unwrap(), OpenAIModel::Gpt4o);
    }

    #[test]
    fn conversation_drops_trailing_placeholder() {
        let i = input(vec![ChatMessage::user("hi"), ChatMessage::assistant_placeholder()]);
        assert_eq!(i.conversation().len(), 1);

        let answered = input(vec![
            ChatMessage::user("hi"),
            ChatMessage::new(ChatRole::Assistant, "hello"),
        ]);
        assert_eq!(answered.conversation().len(), 2);
    }

    #[test]
    fn default_model_is_mini() {
        assert_eq!(OpenAIModel::default(), OpenAIModel::Gpt4oMini);
    }
}
