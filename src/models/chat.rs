use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };
use serde_json::{ Map, Value };
use std::fmt;

/// Sentinel id at the head of every path.
pub const ROOT_ID: &str = "root";

/// True for conversation paths, false for message paths. Every level of the
/// tree appends exactly one id below the `root` sentinel, alternating
/// conversation / message, so conversation paths have even length.
pub fn is_conversation_path(path: &[String]) -> bool {
    !path.is_empty() && path.len() % 2 == 0
}

/// The id one level up: for a message path the owning conversation, for a
/// conversation path the message that spawned it (`root` for top-level
/// conversations).
pub fn parent_id(path: &[String]) -> Option<&str> {
    if path.len() < 2 {
        return None;
    }
    path.get(path.len() - 2).map(String::as_str)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Function,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
            Role::System => "system",
        };
        write!(f, "{}", name)
    }
}

/// A tool invocation attached to a message. Both fields stream: `name`
/// arrives as text chunks, `arguments` as nested diffs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl FunctionCall {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.arguments.is_null()
    }
}

/// The chat body of a message. `content` stays a JSON value because the
/// backend sends either plain text or structured payloads, and partially
/// built values pass through here during streaming.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
}

impl Chat {
    pub fn content_text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Auxiliary message/conversation fields. `duration` is absent while the
/// message is still streaming; its arrival is the stream-finished signal.
/// Unknown keys are kept in `extra` so round-trips do not shed them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, with = "flexible_time", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i8>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_initial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub display_data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A finalized message. The path is assigned by the backend, never changes,
/// and is the sole addressing key; the message id is its last element.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Message {
    pub path: Vec<String>,
    #[serde(default)]
    pub chat: Chat,
    #[serde(default)]
    pub meta: Meta,
    /// Conversation ids spawned from this message. Snapshots carry these at
    /// the top level; streamed meta may carry them under `meta.children`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl Message {
    pub fn id(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Owning conversation id.
    pub fn conversation_id(&self) -> &str {
        parent_id(&self.path).unwrap_or(ROOT_ID)
    }

    /// All conversation ids spawned by this message, from either carrier.
    pub fn spawned_conversations(&self) -> impl Iterator<Item = &str> + '_ {
        self.children
            .iter()
            .chain(self.meta.children.iter().filter(|c| !self.children.contains(*c)))
            .map(String::as_str)
    }
}

/// One conversation as the REST API reports it: its path, its messages in
/// display order, and conversation-level meta (assigned agent etc.).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConversationView {
    pub path: Vec<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub meta: Meta,
}

impl ConversationView {
    pub fn id(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or(ROOT_ID)
    }
}

/// The backend emits naive ISO-8601 timestamps (no offset); those are taken
/// as UTC, offset-carrying ones are normalized, epoch numbers tolerated. A
/// timestamp that parses as nothing becomes None rather than failing the
/// whole frame.
mod flexible_time {
    use chrono::{ DateTime, NaiveDateTime, Utc };
    use serde::{ Deserialize, Deserializer, Serializer };
    use serde_json::Value;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where S: Serializer
    {
        match value {
            Some(t) => serializer.serialize_str(&t.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where D: Deserializer<'de>
    {
        let raw: Option<Value> = Option::deserialize(deserializer)?;
        Ok(match raw {
            Some(Value::String(text)) => parse_text(&text),
            Some(Value::Number(number)) =>
                number.as_f64().and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
            _ => None,
        })
    }

    fn parse_text(text: &str) -> Option<DateTime<Utc>> {
        if let Ok(t) = DateTime::parse_from_rfc3339(text) {
            return Some(t.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|t| t.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_parity_classifies_levels() {
        let conv = vec!["root".to_string(), "c1".to_string()];
        let msg = vec!["root".to_string(), "c1".to_string(), "m1".to_string()];
        assert!(is_conversation_path(&conv));
        assert!(!is_conversation_path(&msg));
        assert_eq!(parent_id(&conv), Some("root"));
        assert_eq!(parent_id(&msg), Some("c1"));
    }

    #[test]
    fn message_deserializes_snapshot_shape() {
        let raw = json!({
            "path": ["root", "c1", "m1"],
            "chat": { "role": "assistant", "content": "hi", "function_call": {} },
            "meta": { "timestamp": "2023-11-02T10:30:00.123456", "duration": 1.5 },
            "children": ["s1"]
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.id(), "m1");
        assert_eq!(msg.conversation_id(), "c1");
        assert_eq!(msg.chat.role, Some(Role::Assistant));
        assert_eq!(msg.chat.content_text(), Some("hi"));
        assert!(msg.chat.function_call.as_ref().unwrap().is_empty());
        assert!(msg.meta.timestamp.is_some());
        assert_eq!(msg.spawned_conversations().collect::<Vec<_>>(), vec!["s1"]);
    }

    #[test]
    fn meta_keeps_unknown_keys() {
        let raw = json!({ "preview": true, "rating": -1 });
        let meta: Meta = serde_json::from_value(raw).unwrap();
        assert_eq!(meta.rating, Some(-1));
        assert_eq!(meta.extra.get("preview"), Some(&json!(true)));
    }
}
