use log::warn;
use serde_json::Value;

use crate::error::ClientError;
use crate::merge::Delta;
use crate::models::chat::Meta;
use crate::models::websocket::ServerFrame;

/// Inbound frames, normalized for the store. The wire distinction between
/// "streaming just started" and "streaming finished" lives in
/// `meta.duration` on [`StreamEvent::Set`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Path {
        path: Vec<String>,
        meta: Meta,
    },
    Set {
        id: String,
        chat: Value,
        meta: Meta,
        path: Option<Vec<String>>,
    },
    Chunk {
        id: String,
        diff: Delta,
    },
}

/// Classify one raw text frame. Unrecognized shapes come back as
/// [`ClientError::Protocol`] so the socket loop can log and drop them;
/// nothing here may panic or close the connection.
pub fn decode(raw: &str) -> Result<StreamEvent, ClientError> {
    let frame: ServerFrame = serde_json
        ::from_str(raw)
        .map_err(|e| ClientError::Protocol(format!("unrecognized frame: {}", e)))?;
    Ok(match frame {
        ServerFrame::Path { path, meta } => StreamEvent::Path { path, meta },
        ServerFrame::Set { id, chat, meta, path } => StreamEvent::Set { id, chat, meta, path },
        ServerFrame::Chunk { id, diff } => StreamEvent::Chunk { id, diff: Delta::from(&diff) },
    })
}

/// Log-and-drop wrapper used by the socket read loop.
pub fn decode_or_drop(raw: &str) -> Option<StreamEvent> {
    match decode(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Dropping undecodable frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_path_set_chunk() {
        let path = decode(r#"{"type":"path","path":["root","c1"],"meta":{"agent":"planner"}}"#)
            .unwrap();
        match path {
            StreamEvent::Path { path, meta } => {
                assert_eq!(path, vec!["root", "c1"]);
                assert_eq!(meta.agent.as_deref(), Some("planner"));
            }
            other => panic!("expected path event, got {:?}", other),
        }

        let set = decode(r#"{"type":"set","id":"m1","chat":{"content":"hi"},"meta":{}}"#).unwrap();
        assert!(matches!(set, StreamEvent::Set { .. }));

        let chunk = decode(r#"{"type":"chunk","id":"m1","diff":{"content":" there"}}"#).unwrap();
        match chunk {
            StreamEvent::Chunk { id, diff } => {
                assert_eq!(id, "m1");
                assert!(matches!(diff, Delta::Nested(_)));
            }
            other => panic!("expected chunk event, got {:?}", other),
        }
    }

    #[test]
    fn unknown_frames_are_errors_not_panics() {
        // legacy protocol and garbage both surface as Protocol errors
        assert!(decode(r#"{"type":"start","conversation_id":"c1"}"#).is_err());
        assert!(decode("not json at all").is_err());
        assert!(decode_or_drop(r#"{"type":"end"}"#).is_none());
    }
}
