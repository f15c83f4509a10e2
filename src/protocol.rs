use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One line of a chat response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Tool(ToolEvent),
    Model {
        #[serde(default, deserialize_with = "string_or_empty")]
        message: String,
    },
    Title {
        #[serde(default, deserialize_with = "title_payload")]
        message: Option<TitlePayload>,
    },
    Error {
        #[serde(default)]
        message: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEvent {
    #[serde(default, deserialize_with = "string_or_number")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_status: Option<ToolStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Started,
    Ended,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitlePayload {
    #[serde(default)]
    pub title: Option<String>,
}

pub const UNTITLED: &str = "Untitled";
pub const UNEXPECTED_ERROR: &str = "An unexpected error occurred.";

impl ChatEvent {
    pub fn tool_started(id: impl Into<String>, message: Option<&str>) -> Self {
        ChatEvent::Tool(ToolEvent {
            tool_call_id: Some(id.into()),
            tool_status: Some(ToolStatus::Started),
            message: message.map(str::to_string),
        })
    }

    pub fn tool_ended(id: impl Into<String>) -> Self {
        ChatEvent::Tool(ToolEvent {
            tool_call_id: Some(id.into()),
            tool_status: Some(ToolStatus::Ended),
            message: None,
        })
    }

    pub fn model(text: impl Into<String>) -> Self {
        ChatEvent::Model {
            message: text.into(),
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        ChatEvent::Title {
            message: Some(TitlePayload {
                title: Some(title.into()),
            }),
        }
    }

    /// Parses one stream line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Text shown for an in-band error event.
pub fn error_text(message: &Value) -> String {
    match message {
        Value::String(text) => text.clone(),
        Value::Null => UNEXPECTED_ERROR.to_string(),
        other => other.to_string(),
    }
}

fn string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    })
}

/// Ids arrive as strings, but numeric ids are accepted too.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

/// Anything other than an object carries no title.
fn title_payload<'de, D>(deserializer: D) -> Result<Option<TitlePayload>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Object(map)) => Some(TitlePayload {
            title: map.get("title").and_then(Value::as_str).map(str::to_string),
        }),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub message_data: Value,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            sender: Sender::User,
            message_data: Value::Null,
        }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            sender: Sender::Ai,
            message_data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.message_data = data;
        self
    }

    /// True when `message_data` carries nothing (null or `{}`).
    pub fn has_no_data(&self) -> bool {
        match &self.message_data {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

/// Row returned by `/chat_messages`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRecord {
    pub message: String,
    pub sender: Sender,
    #[serde(default)]
    pub message_data: Option<Value>,
    #[serde(default)]
    pub message_metadata: Option<Value>,
}

impl From<HistoryRecord> for ChatMessage {
    fn from(record: HistoryRecord) -> Self {
        let data = record
            .message_data
            .filter(|value| !value.is_null())
            .or(record.message_metadata.filter(|value| !value.is_null()))
            .unwrap_or_else(|| Value::Object(Default::default()));
        ChatMessage {
            message: record.message,
            sender: record.sender,
            message_data: data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentRequest {
    pub user_query: String,
    pub session_id: String,
    #[serde(rename = "newSession")]
    pub new_session: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub article_id: i64,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HighlightsRequest {
    pub query: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tool_started_line() {
        let event = ChatEvent::from_line(
            r#"{"type":"tool","tool_status":"started","tool_call_id":"1","message":"Searching the news"}"#,
        )
        .unwrap();
        assert_eq!(event, ChatEvent::tool_started("1", Some("Searching the news")));
    }

    #[test]
    fn tool_line_with_missing_fields_still_parses() {
        let event = ChatEvent::from_line(r#"{"type":"tool"}"#).unwrap();
        assert_eq!(
            event,
            ChatEvent::Tool(ToolEvent {
                tool_call_id: None,
                tool_status: None,
                message: None,
            })
        );
    }

    #[test]
    fn unknown_tool_status_maps_to_other() {
        let event =
            ChatEvent::from_line(r#"{"type":"tool","tool_status":"paused","tool_call_id":"x"}"#)
                .unwrap();
        match event {
            ChatEvent::Tool(tool) => assert_eq!(tool.tool_status, Some(ToolStatus::Other)),
            other => panic!("expected tool event, got {other:?}"),
        }
    }

    #[test]
    fn model_message_null_becomes_empty() {
        let event = ChatEvent::from_line(r#"{"type":"model","message":null}"#).unwrap();
        assert_eq!(event, ChatEvent::model(""));
    }

    #[test]
    fn title_line_parses_nested_title() {
        let event =
            ChatEvent::from_line(r#"{"type":"title","message":{"title":"Markets today"}}"#)
                .unwrap();
        assert_eq!(event, ChatEvent::title("Markets today"));
    }

    #[test]
    fn title_line_with_plain_string_has_no_title() {
        let event = ChatEvent::from_line(r#"{"type":"title","message":"Foo"}"#).unwrap();
        assert_eq!(event, ChatEvent::Title { message: None });
    }

    #[test]
    fn numeric_tool_call_id_is_read_as_text() {
        let event =
            ChatEvent::from_line(r#"{"type":"tool","tool_status":"started","tool_call_id":7}"#)
                .unwrap();
        assert_eq!(event, ChatEvent::tool_started("7", None));
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let event = ChatEvent::from_line(r#"{"type":"usage","tokens":12}"#).unwrap();
        assert_eq!(event, ChatEvent::Unknown);
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(ChatEvent::from_line(r#"{"message":"hi"}"#).is_err());
    }

    #[test]
    fn error_text_stringifies_non_strings() {
        assert_eq!(error_text(&json!("boom")), "boom");
        assert_eq!(error_text(&Value::Null), UNEXPECTED_ERROR);
        assert_eq!(error_text(&json!({"code": 3})), r#"{"code":3}"#);
    }

    #[test]
    fn agent_request_uses_backend_field_names() {
        let body = serde_json::to_value(AgentRequest {
            user_query: "What's new in AI?".to_string(),
            session_id: "s1".to_string(),
            new_session: true,
        })
        .unwrap();
        assert_eq!(
            body,
            json!({"user_query": "What's new in AI?", "session_id": "s1", "newSession": true})
        );
    }

    #[test]
    fn history_record_falls_back_to_metadata() {
        let record: HistoryRecord = serde_json::from_value(json!({
            "message": "hello",
            "sender": "ai",
            "message_metadata": {"type": "article_metadata"}
        }))
        .unwrap();
        let message = ChatMessage::from(record);
        assert_eq!(message.sender, Sender::Ai);
        assert_eq!(message.message_data, json!({"type": "article_metadata"}));
    }

    #[test]
    fn history_record_without_data_gets_empty_object() {
        let record: HistoryRecord =
            serde_json::from_value(json!({"message": "hi", "sender": "user"})).unwrap();
        let message = ChatMessage::from(record);
        assert_eq!(message.message_data, json!({}));
        assert!(message.has_no_data());
    }
}
