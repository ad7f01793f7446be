use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            model: None,
        }
    }

    /// An empty assistant message, ready to receive streamed fragments.
    pub fn assistant(model: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            model: Some(model.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    pub model: String,
}

impl Conversation {
    pub const PLACEHOLDER_TITLE: &'static str = "New Conversation";

    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: Self::PLACEHOLDER_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            model: model.into(),
        }
    }

    /// Refreshes `updated_at`, always moving it strictly forward even when the
    /// wall clock has not advanced since the previous mutation.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }

    /// Case-insensitive match against the title or any message body.
    pub fn matches(&self, term: &str) -> bool {
        let term = term.to_lowercase();
        self.title.to_lowercase().contains(&term)
            || self
                .messages
                .iter()
                .any(|m| m.content.to_lowercase().contains(&term))
    }
}

/// Generation parameters read by the token source. A turn captures its own
/// copy when it begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub top_k: u32,
    pub repeat_penalty: f64,
    pub system_prompt: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: "llama3.2:latest".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            system_prompt: String::new(),
        }
    }
}

impl GenerationSettings {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.model.trim().is_empty() {
            return Err(AppError::empty_field("model"));
        }
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        check_range("max_tokens", f64::from(self.max_tokens), 1.0, 4000.0)?;
        check_range("top_p", self.top_p, 0.0, 1.0)?;
        check_range("top_k", f64::from(self.top_k), 1.0, 100.0)?;
        check_range("repeat_penalty", self.repeat_penalty, 0.5, 2.0)?;
        Ok(())
    }
}

fn check_range(field_name: &str, actual: f64, min: f64, max: f64) -> Result<(), AppError> {
    if actual.is_nan() || actual < min || actual > max {
        return Err(AppError::OutOfRange {
            field_name: field_name.to_string(),
            min,
            max,
            actual,
        });
    }
    Ok(())
}

/// Partial settings update; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SettingsPatch {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub repeat_penalty: Option<f64>,
    pub system_prompt: Option<String>,
}

impl SettingsPatch {
    pub fn apply(&self, current: &GenerationSettings) -> GenerationSettings {
        GenerationSettings {
            model: self.model.clone().unwrap_or_else(|| current.model.clone()),
            temperature: self.temperature.unwrap_or(current.temperature),
            max_tokens: self.max_tokens.unwrap_or(current.max_tokens),
            top_p: self.top_p.unwrap_or(current.top_p),
            top_k: self.top_k.unwrap_or(current.top_k),
            repeat_penalty: self.repeat_penalty.unwrap_or(current.repeat_penalty),
            system_prompt: self
                .system_prompt
                .clone()
                .unwrap_or_else(|| current.system_prompt.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub repeat_penalty: f64,
}

impl Default for ModelParameters {
    fn default() -> Self {
        let defaults = GenerationSettings::default();
        Self {
            temperature: defaults.temperature,
            top_p: defaults.top_p,
            top_k: defaults.top_k,
            repeat_penalty: defaults.repeat_penalty,
        }
    }
}

/// A model the token source can generate with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    pub display_name: String,
    pub size: String,
    pub modified: Option<DateTime<Utc>>,
    pub parameters: ModelParameters,
}

// ── WebSocket protocol ───────────────────────────────────────────────────────

/// WebSocket message sent by the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    Chat {
        #[serde(default)]
        conversation_id: Option<String>,
        message: String,
    },
    Cancel,
}

/// WebSocket event sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    StreamStart { conversation_id: String, message_id: String },
    StreamChunk { content: String },
    StreamEnd { message_id: String, full_content: String },
    StreamAborted { message_id: Option<String>, reason: String, partial_content: String },
    Error { message: String },
}

/// Serde adapter for message and conversation instants.
///
/// Writes ISO-8601 strings. Reads either an ISO-8601 string or a numeric
/// epoch-milliseconds value.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawInstant {
        Text(String),
        Millis(i64),
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        match RawInstant::deserialize(deserializer)? {
            RawInstant::Text(text) => parse(&text).map_err(de::Error::custom),
            RawInstant::Millis(millis) => Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {millis}"))),
        }
    }

    pub fn parse(text: &str) -> Result<DateTime<Utc>, String> {
        DateTime::parse_from_rfc3339(text)
            .map(|instant| instant.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp '{text}': {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conversation_json_uses_camel_case_and_iso_dates() {
        let mut conversation = Conversation::new("llama3.2:latest");
        conversation.messages.push(Message::user("hello"));
        let value = serde_json::to_value(&conversation).unwrap();

        assert!(value.get("createdAt").and_then(|v| v.as_str()).is_some());
        assert!(value.get("updatedAt").and_then(|v| v.as_str()).is_some());
        assert_eq!(value["messages"][0]["role"], "user");
        assert!(value["messages"][0].get("model").is_none());

        let back: Conversation = serde_json::from_value(value).unwrap();
        assert_eq!(back, conversation);
    }

    #[test]
    fn timestamps_load_from_string_or_epoch_millis() {
        let raw = json!({
            "id": "c1",
            "title": "hi there",
            "messages": [{
                "id": "m1",
                "role": "assistant",
                "content": "hey",
                "timestamp": 1705312800000i64,
                "model": "mistral:latest"
            }],
            "createdAt": "2024-01-15T10:00:00.000Z",
            "updatedAt": "2024-01-15T10:00:00+00:00",
            "model": "mistral:latest"
        });
        let conversation: Conversation = serde_json::from_value(raw).unwrap();
        assert_eq!(conversation.created_at, conversation.updated_at);
        assert_eq!(conversation.messages[0].timestamp, conversation.created_at);
        assert_eq!(conversation.messages[0].model.as_deref(), Some("mistral:latest"));
    }

    #[test]
    fn malformed_timestamp_is_rejected() {
        let raw = json!({
            "id": "m1",
            "role": "user",
            "content": "x",
            "timestamp": "yesterday"
        });
        assert!(serde_json::from_value::<Message>(raw).is_err());
    }

    #[test]
    fn touch_moves_updated_at_strictly_forward() {
        let mut conversation = Conversation::new("m");
        conversation.updated_at = Utc::now() + chrono::Duration::hours(1);
        let before = conversation.updated_at;
        conversation.touch();
        assert!(conversation.updated_at > before);
    }

    #[test]
    fn search_matches_title_and_content_case_insensitively() {
        let mut conversation = Conversation::new("m");
        conversation.title = "Binary Search".into();
        conversation.messages.push(Message::user("How do HEAPS work?"));

        assert!(conversation.matches("binary"));
        assert!(conversation.matches("heaps"));
        assert!(!conversation.matches("graphs"));
    }

    #[test]
    fn settings_patch_only_touches_supplied_fields() {
        let current = GenerationSettings::default();
        let patch = SettingsPatch {
            temperature: Some(1.2),
            system_prompt: Some("be brief".into()),
            ..Default::default()
        };
        let next = patch.apply(&current);
        assert_eq!(next.temperature, 1.2);
        assert_eq!(next.system_prompt, "be brief");
        assert_eq!(next.model, current.model);
        assert_eq!(next.top_k, current.top_k);
    }

    #[test]
    fn settings_validation_enforces_ranges() {
        assert!(GenerationSettings::default().validate().is_ok());

        let hot = GenerationSettings { temperature: 2.5, ..Default::default() };
        assert!(matches!(hot.validate(), Err(AppError::OutOfRange { .. })));

        let unnamed = GenerationSettings { model: "  ".into(), ..Default::default() };
        assert!(matches!(unnamed.validate(), Err(AppError::EmptyField { .. })));

        let zero_tokens = GenerationSettings { max_tokens: 0, ..Default::default() };
        assert!(zero_tokens.validate().is_err());
    }

    #[test]
    fn partially_stored_settings_fill_defaults() {
        let settings: GenerationSettings =
            serde_json::from_value(json!({ "model": "codellama:latest" })).unwrap();
        assert_eq!(settings.model, "codellama:latest");
        assert_eq!(settings.max_tokens, 2000);
    }

    #[test]
    fn ws_client_messages_are_tagged() {
        let chat: WsClientMessage =
            serde_json::from_str(r#"{"type":"chat","message":"hi"}"#).unwrap();
        assert!(matches!(chat, WsClientMessage::Chat { conversation_id: None, .. }));
        let cancel: WsClientMessage = serde_json::from_str(r#"{"type":"cancel"}"#).unwrap();
        assert!(matches!(cancel, WsClientMessage::Cancel));
    }
}
