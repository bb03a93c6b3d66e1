use log::{ debug, info, warn };
use serde_json::Value;
use std::collections::HashMap;

use crate::decoder::StreamEvent;
use crate::merge::{ merge, Delta };
use crate::models::chat::{
    is_conversation_path,
    parent_id,
    Chat,
    ConversationView,
    FunctionCall,
    Message,
    Meta,
    ROOT_ID,
};

/// An in-progress message. The chat body stays untyped JSON while chunks
/// are still landing on it; it is parsed into a [`Chat`] on finalize (and
/// leniently for live display).
#[derive(Debug, Clone)]
pub struct StreamingMessage {
    pub path: Vec<String>,
    pub chat: Value,
    pub meta: Meta,
}

/// Messages currently streaming, in insertion order. Insertion order is
/// display order; ids only leave when their duration-carrying set frame
/// finalizes them (or a snapshot replaces the conversation).
#[derive(Debug, Default)]
pub struct StreamingState {
    messages: HashMap<String, StreamingMessage>,
    sorted_ids: Vec<String>,
}

impl StreamingState {
    fn upsert(&mut self, id: &str, message: StreamingMessage) {
        if !self.messages.contains_key(id) {
            self.sorted_ids.push(id.to_string());
        }
        self.messages.insert(id.to_string(), message);
    }

    fn remove(&mut self, id: &str) -> Option<StreamingMessage> {
        let removed = self.messages.remove(id);
        if removed.is_some() {
            self.sorted_ids.retain(|known| known != id);
        }
        removed
    }

    fn get(&self, id: &str) -> Option<&StreamingMessage> {
        self.messages.get(id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut StreamingMessage> {
        self.messages.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sorted_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StreamingMessage)> {
        self.sorted_ids
            .iter()
            .filter_map(|id| self.messages.get(id).map(|m| (id.as_str(), m)))
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.sorted_ids.clear();
    }

    fn remove_conversation(&mut self, conversation_id: &str) {
        let stale: Vec<String> = self
            .iter()
            .filter(|(_, m)| parent_id(&m.path) == Some(conversation_id))
            .map(|(id, _)| id.to_string())
            .collect();
        for id in stale {
            self.remove(&id);
        }
    }
}

fn chat_from_wire(value: &Value) -> Chat {
    match serde_json::from_value::<Chat>(value.clone()) {
        Ok(chat) => chat,
        Err(e) => {
            warn!("Chat body did not parse cleanly ({}); keeping raw content", e);
            Chat {
                content: value.clone(),
                ..Chat::default()
            }
        }
    }
}

/// The authoritative client-side conversation tree. REST snapshots and
/// streamed frames both land here; queries serve the presentation layer.
/// One store per session, cleared streaming state on reconnect — nothing
/// global.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<String, ConversationView>,
    /// Every announced id (conversation or message) to its immutable path.
    paths: HashMap<String, Vec<String>>,
    /// Message id (or `root`) to the conversation ids it spawned.
    children: HashMap<String, Vec<String>>,
    streaming: StreamingState,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the store's view of one conversation with an authoritative
    /// REST snapshot. Idempotent; also drops streaming entries for that
    /// conversation since the snapshot supersedes them.
    pub fn ingest_snapshot(&mut self, view: ConversationView) {
        let conversation_id = view.id().to_string();
        self.paths.insert(conversation_id.clone(), view.path.clone());
        for message in &view.messages {
            self.paths.insert(message.id().to_string(), message.path.clone());
            let spawned: Vec<String> = message
                .spawned_conversations()
                .map(str::to_string)
                .collect();
            for child in spawned {
                // the child conversation sits one level below its spawning message
                let mut child_path = message.path.clone();
                child_path.push(child.clone());
                self.paths.entry(child.clone()).or_insert(child_path);
                self.link_child(message.id(), &child);
            }
        }
        self.streaming.remove_conversation(&conversation_id);
        info!(
            "Snapshot for conversation {} with {} message(s)",
            conversation_id,
            view.messages.len()
        );
        self.conversations.insert(conversation_id, view);
    }

    /// Dispatch one decoded frame. Returns the id of the conversation that
    /// gained user-visible content, which drives attached auto-follow.
    pub fn apply(&mut self, event: StreamEvent) -> Option<String> {
        match event {
            StreamEvent::Path { path, meta } => self.apply_path_event(path, meta),
            StreamEvent::Set { id, chat, meta, path } => {
                self.apply_set_event(&id, chat, meta, path)
            }
            StreamEvent::Chunk { id, diff } => self.apply_chunk_event(&id, &diff),
        }
    }

    /// A new id is being initialized at `path`. Conversation announcements
    /// register the tree link and conversation meta; message announcements
    /// only pin the id's path (the set frame follows with the body).
    pub fn apply_path_event(&mut self, path: Vec<String>, meta: Meta) -> Option<String> {
        let Some(id) = path.last().cloned() else {
            warn!("Path announcement with empty path; dropping");
            return None;
        };
        let announces_conversation = self.path_is_conversation(&path);
        self.paths.insert(id.clone(), path.clone());
        if announces_conversation {
            let parent = parent_id(&path).unwrap_or(ROOT_ID).to_string();
            self.link_child(&parent, &id);
            match self.conversations.get_mut(&id) {
                Some(existing) => {
                    if meta.agent.is_some() {
                        existing.meta.agent = meta.agent;
                    }
                    for (key, value) in meta.extra {
                        existing.meta.extra.insert(key, value);
                    }
                }
                None => {
                    debug!("New conversation {} under message {}", id, parent);
                    self.conversations.insert(id.clone(), ConversationView {
                        path,
                        messages: Vec::new(),
                        meta,
                    });
                }
            }
            None
        } else {
            // a message is about to stream into its conversation
            Some(parent_id(&path).unwrap_or(ROOT_ID).to_string())
        }
    }

    /// A complete message snapshot. Without a duration the message (re)enters
    /// StreamingState; with one it finalizes exactly once into the owning
    /// conversation's message list.
    pub fn apply_set_event(
        &mut self,
        id: &str,
        chat: Value,
        meta: Meta,
        wire_path: Option<Vec<String>>
    ) -> Option<String> {
        let path = wire_path
            .or_else(|| self.paths.get(id).cloned())
            .or_else(|| self.streaming.get(id).map(|m| m.path.clone()));
        let Some(path) = path else {
            warn!("Set for {} with no known path; dropping (missed announcement)", id);
            return None;
        };
        self.paths.insert(id.to_string(), path.clone());
        let conversation_id = parent_id(&path).unwrap_or(ROOT_ID).to_string();

        if meta.duration.is_none() {
            debug!("Message {} streaming in conversation {}", id, conversation_id);
            self.streaming.upsert(id, StreamingMessage { path, chat, meta });
            return Some(conversation_id);
        }

        self.streaming.remove(id);
        let message = Message {
            path: path.clone(),
            chat: chat_from_wire(&chat),
            meta,
            children: Vec::new(),
        };
        let spawned: Vec<String> = message.spawned_conversations().map(str::to_string).collect();
        for child in &spawned {
            self.link_child(id, child);
        }
        // out-of-order completions may carry a causal placement hint
        let insert_after = message.meta.extra
            .get("insert_after")
            .and_then(Value::as_str)
            .map(str::to_string);
        let conversation = self.conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationView {
                path: path[..path.len() - 1].to_vec(),
                messages: Vec::new(),
                meta: Meta::default(),
            });
        if let Some(existing) = conversation.messages.iter_mut().find(|m| m.id() == id) {
            *existing = message;
        } else if
            let Some(position) = insert_after.and_then(|hint| {
                conversation.messages.iter().position(|m| m.id() == hint)
            })
        {
            conversation.messages.insert(position + 1, message);
        } else {
            conversation.messages.push(message);
        }
        info!("Message {} finalized in conversation {}", id, conversation_id);
        Some(conversation_id)
    }

    /// Merge an incremental diff into a message that already exists, in
    /// StreamingState or finalized. Unknown ids are a logged no-op: the set
    /// frame was missed or is still in flight, and fabricating a placeholder
    /// would hide the loss.
    pub fn apply_chunk_event(&mut self, id: &str, diff: &Delta) -> Option<String> {
        if let Some(entry) = self.streaming.get_mut(id) {
            let merged = merge(Some(&entry.chat), diff);
            entry.chat = merged;
            debug!("Chunk merged into streaming message {}", id);
            return Some(parent_id(&entry.path).unwrap_or(ROOT_ID).to_string());
        }
        if let Some(path) = self.paths.get(id).cloned() {
            let conversation_id = parent_id(&path).unwrap_or(ROOT_ID).to_string();
            if let Some(conversation) = self.conversations.get_mut(&conversation_id) {
                if let Some(message) = conversation.messages.iter_mut().find(|m| m.id() == id) {
                    let base = serde_json::to_value(&message.chat).ok();
                    let merged = merge(base.as_ref(), diff);
                    message.chat = chat_from_wire(&merged);
                    debug!("Chunk merged into finalized message {}", id);
                    return Some(conversation_id);
                }
            }
        }
        warn!("Chunk for unknown id {}; dropping (set frame missed or reordered)", id);
        None
    }

    /// Messages to render for a conversation: finalized first (deleted
    /// filtered out, seed messages unless requested), then still-streaming
    /// ones in stable append order.
    pub fn messages_for(&self, conversation_id: &str, include_initial: bool) -> Vec<Message> {
        let mut visible: Vec<Message> = self.conversations
            .get(conversation_id)
            .map(|conversation| {
                conversation.messages
                    .iter()
                    .filter(|m| !m.meta.deleted)
                    .filter(|m| include_initial || !m.meta.is_initial)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for (_, streaming) in self.streaming.iter() {
            if parent_id(&streaming.path) != Some(conversation_id) {
                continue;
            }
            if streaming.meta.deleted || (!include_initial && streaming.meta.is_initial) {
                continue;
            }
            visible.push(Message {
                path: streaming.path.clone(),
                chat: chat_from_wire(&streaming.chat),
                meta: streaming.meta.clone(),
                children: Vec::new(),
            });
        }
        visible
    }

    /// Conversation ids spawned by a message. Works for logically deleted
    /// messages too — deletion never breaks addressing.
    pub fn children_of(&self, message_id: &str) -> &[String] {
        self.children.get(message_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Registered path for any announced id, message or conversation.
    pub fn path_of(&self, id: &str) -> Option<&[String]> {
        self.paths.get(id).map(Vec::as_slice)
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&ConversationView> {
        self.conversations.get(conversation_id)
    }

    pub fn conversation_meta(&self, conversation_id: &str) -> Option<&Meta> {
        self.conversations.get(conversation_id).map(|c| &c.meta)
    }

    /// The conversation enclosing `conversation_id`: usually two levels up
    /// (past the spawning message), one level up for forked conversations,
    /// whose paths extend the parent conversation directly. Resolved by
    /// walking the path for the nearest known conversation, falling back to
    /// the alternation arithmetic and then to a reverse children lookup.
    pub fn parent_conversation_of(&self, conversation_id: &str) -> Option<String> {
        if conversation_id == ROOT_ID {
            return None;
        }
        if let Some(path) = self.paths.get(conversation_id) {
            if path.len() < 2 {
                return None;
            }
            for ancestor in path[..path.len() - 1].iter().rev() {
                if self.is_known_conversation(ancestor) {
                    return Some(ancestor.clone());
                }
            }
            return match path.len() {
                2 => Some(ROOT_ID.to_string()),
                n => path.get(n - 3).cloned(),
            };
        }
        let spawning_message = self.children
            .iter()
            .find(|(_, spawned)| spawned.iter().any(|c| c == conversation_id))
            .map(|(message_id, _)| message_id.clone())?;
        self.paths
            .get(&spawning_message)
            .and_then(|path| parent_id(path))
            .map(str::to_string)
    }

    /// Local application of a PUT /meta ack. Deletion is logical; the
    /// message stays addressable for forking and children lookups.
    pub fn set_deleted(&mut self, message_id: &str, deleted: bool) -> bool {
        self.update_meta(message_id, |meta| {
            meta.deleted = deleted;
        })
    }

    pub fn set_rating(&mut self, message_id: &str, rating: i8) -> bool {
        self.update_meta(message_id, |meta| {
            meta.rating = Some(rating);
        })
    }

    pub fn set_function_call(&mut self, message_id: &str, function_call: FunctionCall) -> bool {
        if let Some(message) = self.find_message_mut(message_id) {
            message.chat.function_call = Some(function_call);
            return true;
        }
        false
    }

    pub fn clear_streaming(&mut self) {
        self.streaming.clear();
    }

    pub fn streaming(&self) -> &StreamingState {
        &self.streaming
    }

    fn update_meta(&mut self, message_id: &str, update: impl FnOnce(&mut Meta)) -> bool {
        if let Some(message) = self.find_message_mut(message_id) {
            update(&mut message.meta);
            return true;
        }
        if let Some(streaming) = self.streaming.get_mut(message_id) {
            update(&mut streaming.meta);
            return true;
        }
        false
    }

    fn find_message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        let path = self.paths.get(message_id)?;
        let conversation_id = parent_id(path)?.to_string();
        self.conversations
            .get_mut(&conversation_id)?
            .messages.iter_mut()
            .find(|m| m.id() == message_id)
    }

    fn link_child(&mut self, parent: &str, conversation_id: &str) {
        let spawned = self.children.entry(parent.to_string()).or_default();
        if !spawned.iter().any(|c| c == conversation_id) {
            spawned.push(conversation_id.to_string());
        }
    }

    fn is_known_conversation(&self, id: &str) -> bool {
        id == ROOT_ID || self.conversations.contains_key(id)
    }

    fn is_known_message(&self, id: &str) -> bool {
        self.streaming.contains(id) || self.find_message(id).is_some()
    }

    fn find_message(&self, message_id: &str) -> Option<&Message> {
        let path = self.paths.get(message_id)?;
        let conversation_id = parent_id(path)?;
        self.conversations
            .get(conversation_id)?
            .messages.iter()
            .find(|m| m.id() == message_id)
    }

    /// Whether a path announcement names a conversation or a message. The
    /// structure alone cannot always tell (forked conversations extend the
    /// parent conversation's path directly), so the known tree decides
    /// first and path parity is the fallback for ids learned out of order.
    fn path_is_conversation(&self, path: &[String]) -> bool {
        match parent_id(path) {
            None => true,
            Some(ROOT_ID) => true,
            Some(parent) if self.is_known_message(parent) => true,
            Some(parent) if self.is_known_conversation(parent) => false,
            Some(_) => is_conversation_path(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn meta_with_duration(duration: f64) -> Meta {
        Meta {
            duration: Some(duration),
            ..Meta::default()
        }
    }

    fn announce(store: &mut ConversationStore, ids: &[&str]) {
        store.apply_path_event(path(ids), Meta::default());
    }

    #[test]
    fn set_chunk_set_lifecycle() {
        let mut store = ConversationStore::new();
        announce(&mut store, &["root", "c1", "m1"]);

        store.apply_set_event("m1", json!({ "role": "user", "content": "hi" }), Meta::default(), None);
        assert!(store.streaming().contains("m1"));
        assert_eq!(store.messages_for("c1", false).len(), 1);

        store.apply_chunk_event("m1", &Delta::from(&json!({ "content": " there" })));
        let live = store.messages_for("c1", false);
        assert_eq!(live[0].chat.content_text(), Some("hi there"));

        store.apply_set_event(
            "m1",
            json!({ "role": "user", "content": "hi there" }),
            meta_with_duration(1.2),
            None
        );
        assert!(!store.streaming().contains("m1"));
        let finalized = store.messages_for("c1", false);
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].chat.content_text(), Some("hi there"));
        assert_eq!(finalized[0].meta.duration, Some(1.2));
    }

    #[test]
    fn duration_set_finalizes_exactly_once_despite_chunks() {
        let mut store = ConversationStore::new();
        announce(&mut store, &["root", "c1", "m1"]);
        store.apply_set_event("m1", json!({ "content": "" }), Meta::default(), None);
        for _ in 0..5 {
            store.apply_chunk_event("m1", &Delta::from(&json!({ "content": "x" })));
        }
        store.apply_set_event("m1", json!({ "content": "xxxxx" }), meta_with_duration(0.4), None);
        // replay of the final set (idempotent replace, still exactly one)
        store.apply_set_event("m1", json!({ "content": "xxxxx" }), meta_with_duration(0.4), None);

        assert!(!store.streaming().contains("m1"));
        let messages = store.messages_for("c1", false);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].chat.content_text(), Some("xxxxx"));
    }

    #[test]
    fn chunk_for_unknown_id_is_a_noop() {
        let mut store = ConversationStore::new();
        announce(&mut store, &["root", "c1", "m1"]);
        store.apply_set_event("m1", json!({ "content": "a" }), Meta::default(), None);

        let owner = store.apply_chunk_event("ghost", &Delta::from(&json!({ "content": "b" })));
        assert!(owner.is_none());
        assert_eq!(store.streaming().len(), 1);
        let live = store.messages_for("c1", false);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].chat.content_text(), Some("a"));
    }

    #[test]
    fn set_without_any_path_is_dropped() {
        let mut store = ConversationStore::new();
        let owner = store.apply_set_event("orphan", json!({ "content": "?" }), Meta::default(), None);
        assert!(owner.is_none());
        assert!(store.streaming().is_empty());
    }

    #[test]
    fn wire_path_on_set_is_enough() {
        let mut store = ConversationStore::new();
        let owner = store.apply_set_event(
            "m1",
            json!({ "content": "replayed" }),
            meta_with_duration(0.1),
            Some(path(&["root", "c1", "m1"]))
        );
        assert_eq!(owner.as_deref(), Some("c1"));
        assert_eq!(store.messages_for("c1", false).len(), 1);
    }

    #[test]
    fn insert_after_hint_places_out_of_order_completion() {
        let mut store = ConversationStore::new();
        for id in ["m1", "m2"] {
            store.apply_set_event(
                id,
                json!({ "content": id }),
                meta_with_duration(0.1),
                Some(path(&["root", "c1", id]))
            );
        }
        // a tool result that finished late but belongs right after m1
        let mut meta = meta_with_duration(0.2);
        meta.extra.insert("insert_after".to_string(), json!("m1"));
        store.apply_set_event(
            "tool",
            json!({ "role": "function", "name": "bash", "content": "ok" }),
            meta,
            Some(path(&["root", "c1", "tool"]))
        );
        let order: Vec<String> = store
            .messages_for("c1", false)
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(order, vec!["m1", "tool", "m2"]);
    }

    #[test]
    fn snapshot_ingest_is_idempotent_and_supersedes_streaming() {
        let mut store = ConversationStore::new();
        announce(&mut store, &["root", "c1", "m9"]);
        store.apply_set_event("m9", json!({ "content": "partial" }), Meta::default(), None);

        let view: ConversationView = serde_json
            ::from_value(
                json!({
                "path": ["root", "c1"],
                "meta": { "agent": "planner" },
                "messages": [
                    { "path": ["root", "c1", "m1"], "chat": { "role": "user", "content": "hi" }, "meta": {} },
                    { "path": ["root", "c1", "m2"], "chat": { "role": "assistant", "content": "hello" }, "meta": {}, "children": ["s1"] }
                ]
            })
            )
            .unwrap();
        store.ingest_snapshot(view.clone());
        store.ingest_snapshot(view);

        assert!(store.streaming().is_empty());
        assert_eq!(store.messages_for("c1", false).len(), 2);
        assert_eq!(store.children_of("m2"), ["s1".to_string()]);
        assert_eq!(store.conversation_meta("c1").and_then(|m| m.agent.as_deref()), Some("planner"));
        assert_eq!(store.parent_conversation_of("s1").as_deref(), Some("c1"));
    }

    #[test]
    fn deleted_messages_hide_from_display_but_keep_children() {
        let mut store = ConversationStore::new();
        store.apply_path_event(path(&["root", "c1"]), Meta::default());
        let mut meta = meta_with_duration(0.1);
        meta.children = vec!["sub1".to_string()];
        store.apply_set_event(
            "m1",
            json!({ "role": "assistant", "content": "spawned a sub-task" }),
            meta,
            Some(path(&["root", "c1", "m1"]))
        );

        assert!(store.set_deleted("m1", true));
        assert!(store.messages_for("c1", false).is_empty());
        assert_eq!(store.children_of("m1"), ["sub1".to_string()]);
    }

    #[test]
    fn initial_messages_filtered_unless_requested() {
        let mut store = ConversationStore::new();
        let mut seed_meta = meta_with_duration(0.0);
        seed_meta.is_initial = true;
        store.apply_set_event(
            "seed",
            json!({ "role": "system", "content": "you are helpful" }),
            seed_meta,
            Some(path(&["root", "c1", "seed"]))
        );
        assert!(store.messages_for("c1", false).is_empty());
        assert_eq!(store.messages_for("c1", true).len(), 1);
    }

    #[test]
    fn conversation_announcements_build_the_tree() {
        let mut store = ConversationStore::new();
        let mut conv_meta = Meta::default();
        conv_meta.agent = Some("programmer".to_string());
        let owner = store.apply_path_event(path(&["root", "c1"]), conv_meta);
        assert!(owner.is_none());
        assert_eq!(store.children_of(ROOT_ID), ["c1".to_string()]);

        // sub-conversation spawned from message m1
        announce(&mut store, &["root", "c1", "m1"]);
        store.apply_path_event(path(&["root", "c1", "m1", "sub1"]), Meta::default());
        assert_eq!(store.children_of("m1"), ["sub1".to_string()]);
        assert_eq!(store.parent_conversation_of("sub1").as_deref(), Some("c1"));
        assert_eq!(store.parent_conversation_of("c1").as_deref(), Some(ROOT_ID));
    }

    #[test]
    fn streaming_after_finalized_in_display_order() {
        let mut store = ConversationStore::new();
        store.apply_set_event(
            "done",
            json!({ "content": "first" }),
            meta_with_duration(0.1),
            Some(path(&["root", "c1", "done"]))
        );
        store.apply_set_event(
            "live",
            json!({ "content": "second" }),
            Meta::default(),
            Some(path(&["root", "c1", "live"]))
        );
        let ids: Vec<String> = store
            .messages_for("c1", false)
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, vec!["done", "live"]);
    }
}
