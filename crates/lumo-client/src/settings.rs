//! Chat settings persisted in a small JSON key-value file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use lumo_core::chat::{ChatMessage, ChatStreamInput, OpenAIModel};

/// Key the settings live under inside the storage file.
pub const SETTINGS_KEY: &str = "lumo.chat.settings";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    pub model: OpenAIModel,
    #[serde(rename = "openAIApiKey")]
    pub openai_api_key: String,
    #[serde(rename = "openAIBaseURL")]
    pub openai_base_url: String,
}

impl ChatSettings {
    /// Lenient decode: unknown models become the default model, non-string
    /// fields become empty strings.
    pub fn from_value(value: &Value) -> Self {
        let string = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let model = value
            .get("model")
            .and_then(Value::as_str)
            .and_then(|m| m.parse().ok())
            .unwrap_or_default();

        Self {
            model,
            openai_api_key: string("openAIApiKey"),
            openai_base_url: string("openAIBaseURL"),
        }
    }

    /// Load from the storage file. A missing or corrupt file yields defaults.
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(store) => store.get(SETTINGS_KEY).map(Self::from_value).unwrap_or_default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt settings file");
                Self::default()
            }
        }
    }

    /// Write under `SETTINGS_KEY`, keeping any other keys in the file.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut store = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Map<String, Value>>(&raw).ok())
            .unwrap_or_default();
        let value = serde_json::to_value(self).map_err(std::io::Error::other)?;
        store.insert(SETTINGS_KEY.to_string(), value);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&store).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn default_path() -> PathBuf {
        lumo_telemetry::data_dir().join("settings.json")
    }

    /// Build a `chat.stream` input. Blank key and base URL are left out so
    /// the server falls back to its own configuration.
    pub fn to_stream_input(&self, messages: &[ChatMessage]) -> ChatStreamInput {
        let non_blank = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        ChatStreamInput {
            messages: messages.to_vec(),
            model: Some(self.model),
            openai_api_key: non_blank(&self.openai_api_key),
            openai_base_url: non_blank(&self.openai_base_url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lenient_decode() {
        let settings = ChatSettings::from_value(&json!({
            "model": "gpt-5-turbo",
            "openAIApiKey": 42,
            "openAIBaseURL": "http://localhost:11434/v1"
        }));
        assert_eq!(settings.model, OpenAIModel::Gpt4oMini);
        assert_eq!(settings.openai_api_key, "");
        assert_eq!(settings.openai_base_url, "http://localhost:11434/v1");

        let settings = ChatSettings::from_value(&json!({"model": "gpt-4o"}));
        assert_eq!(settings.model, OpenAIModel::Gpt4o);
    }

    #[test]
    fn missing_and_corrupt_files_give_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(ChatSettings::load(&path), ChatSettings::default());

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(ChatSettings::load(&path), ChatSettings::default());
    }

    #[test]
    fn save_then_load_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"lumo.theme":"dark"}"#).unwrap();

        let settings = ChatSettings {
            model: OpenAIModel::Gpt4o,
            openai_api_key: "sk-1".into(),
            openai_base_url: String::new(),
        };
        settings.save(&path).unwrap();

        assert_eq!(ChatSettings::load(&path), settings);
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["lumo.theme"], "dark");
        assert_eq!(raw[SETTINGS_KEY]["openAIApiKey"], "sk-1");
    }

    #[test]
    fn stream_input_trims_and_omits_blanks() {
        let settings = ChatSettings {
            model: OpenAIModel::Gpt4o,
            openai_api_key: "  sk-1  ".into(),
            openai_base_url: "   ".into(),
        };
        let input = settings.to_stream_input(&[ChatMessage::user("Hi")]);
        assert_eq!(input.model, Some(OpenAIModel::Gpt4o));
        assert_eq!(input.openai_api_key.as_deref(), Some("sk-1"));
        assert!(input.openai_base_url.is_none());
        assert_eq!(input.messages.len(), 1);
    }
}
