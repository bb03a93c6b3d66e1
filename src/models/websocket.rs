use serde::{ Serialize, Deserialize };
use serde_json::Value;

use super::chat::Meta;

/// Inbound socket frames. The backend tags every JSON frame with `type`;
/// anything that fails to parse into one of these shapes is dropped by the
/// decoder without touching the connection.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Announces that a new id is being initialized at the given
    /// root-to-node path. When the path names a conversation, `meta`
    /// carries conversation-level fields (assigned agent).
    #[serde(rename = "path")] Path {
        path: Vec<String>,
        #[serde(default)]
        meta: Meta,
    },
    /// A complete or freshly-initialized message snapshot. `meta.duration`
    /// present means the stream for this id is finished. The backend
    /// includes `path` when replaying history over a fresh socket; live
    /// frames rely on the preceding path announcement.
    #[serde(rename = "set")] Set {
        id: String,
        #[serde(default)]
        chat: Value,
        #[serde(default)]
        meta: Meta,
        #[serde(default)]
        path: Option<Vec<String>>,
    },
    /// An incremental patch for a message that already exists.
    #[serde(rename = "chunk")] Chunk {
        id: String,
        diff: Value,
    },
}

/// Body of the turn-starting frame. `response_to` is absent when sending at
/// the root.
#[derive(Serialize, Debug, Clone)]
pub struct QueryPayload {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
    pub agent: String,
}

/// Outbound frames. Cancel is a literal control string on the wire, not
/// JSON, so serialization goes through [`ClientFrame::into_text`] instead of
/// a serde derive.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Query(QueryPayload),
    Cancel(Option<String>),
    Heartbeat,
}

impl ClientFrame {
    pub fn into_text(self) -> Result<String, serde_json::Error> {
        match self {
            ClientFrame::Query(payload) => serde_json::to_string(&payload),
            ClientFrame::Cancel(None) => Ok("cancel".to_string()),
            ClientFrame::Cancel(Some(id)) => Ok(format!("cancel:{}", id)),
            ClientFrame::Heartbeat => Ok(r#"{"type":"heartbeat"}"#.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tagged_frames() {
        let set: ServerFrame = serde_json
            ::from_value(
                json!({
                "type": "set",
                "id": "m1",
                "chat": { "role": "user", "content": "hi" },
                "meta": {}
            })
            )
            .unwrap();
        match set {
            ServerFrame::Set { id, meta, path, .. } => {
                assert_eq!(id, "m1");
                assert!(meta.duration.is_none());
                assert!(path.is_none());
            }
            other => panic!("expected set frame, got {:?}", other),
        }

        let chunk: ServerFrame = serde_json
            ::from_value(json!({ "type": "chunk", "id": "m1", "diff": { "content": "!" } }))
            .unwrap();
        assert!(matches!(chunk, ServerFrame::Chunk { .. }));
    }

    #[test]
    fn cancel_is_a_control_string() {
        assert_eq!(ClientFrame::Cancel(None).into_text().unwrap(), "cancel");
        assert_eq!(
            ClientFrame::Cancel(Some("c1".to_string())).into_text().unwrap(),
            "cancel:c1"
        );
    }

    #[test]
    fn query_omits_absent_response_to() {
        let frame = ClientFrame::Query(QueryPayload {
            query: "hello".to_string(),
            response_to: None,
            agent: "planner".to_string(),
        });
        let text = frame.into_text().unwrap();
        assert!(!text.contains("response_to"));
        assert!(text.contains("\"agent\":\"planner\""));
    }
}
