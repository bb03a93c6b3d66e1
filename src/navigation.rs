use log::debug;

use crate::models::chat::ROOT_ID;
use crate::store::ConversationStore;

/// Auto-follow mode. Attached means the view tracks new streamed content
/// (including jumping into freshly spawned sub-conversations); detached
/// means the user has wandered off and the position must not move under
/// them. Driven by discrete events only — there is no scroll-position
/// sampling in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Attached,
    Detached,
}

/// The user's position in the conversation tree as a root-to-node chain of
/// conversation ids. The head is always the `root` sentinel.
#[derive(Debug)]
pub struct Navigator {
    path: Vec<String>,
    attachment: Attachment,
}

impl Default for Navigator {
    fn default() -> Self {
        Self::new()
    }
}

impl Navigator {
    pub fn new() -> Self {
        Self {
            path: vec![ROOT_ID.to_string()],
            attachment: Attachment::Attached,
        }
    }

    /// Current conversation id (the path tail).
    pub fn current(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or(ROOT_ID)
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn is_attached(&self) -> bool {
        self.attachment == Attachment::Attached
    }

    /// Append a conversation id. Idempotent when already at that id.
    pub fn push(&mut self, conversation_id: &str) {
        if self.current() == conversation_id {
            return;
        }
        debug!("Navigating into conversation {}", conversation_id);
        self.path.push(conversation_id.to_string());
    }

    /// Step back out. The root is never poppable.
    pub fn pop(&mut self) {
        if self.path.len() > 1 {
            self.path.pop();
        }
    }

    /// Jump two levels up the tree: into the conversation that contains the
    /// message which spawned the current one.
    pub fn jump_to_parent(&mut self, store: &ConversationStore) {
        if let Some(parent) = store.parent_conversation_of(self.current()) {
            self.push(&parent);
        }
    }

    /// Replace the whole position, e.g. with the path the backend returned
    /// for a fresh turn. The root sentinel is restored if the backend ever
    /// omitted it.
    pub fn navigate_to(&mut self, path: &[String]) {
        let mut next: Vec<String> = path.to_vec();
        if next.first().map(String::as_str) != Some(ROOT_ID) {
            next.insert(0, ROOT_ID.to_string());
        }
        self.path = next;
    }

    pub fn attach(&mut self) {
        self.attachment = Attachment::Attached;
    }

    pub fn detach(&mut self) {
        self.attachment = Attachment::Detached;
    }

    /// The user scrolled the viewport away from the bottom sentinel.
    pub fn on_user_scroll_away(&mut self) {
        self.detach();
    }

    /// Sending a message always re-attaches and moves to the turn's
    /// conversation path, detached or not.
    pub fn on_send(&mut self, turn_path: &[String]) {
        self.attach();
        self.navigate_to(turn_path);
    }

    /// New content arrived for `conversation_id`. While attached, follow it
    /// (auto-push when it differs from the tail) and report that the view
    /// should scroll to the bottom. While detached, do nothing.
    pub fn note_activity(&mut self, conversation_id: &str) -> bool {
        if !self.is_attached() {
            return false;
        }
        self.push(conversation_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Meta;

    fn path(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn push_is_idempotent_on_tail() {
        let mut nav = Navigator::new();
        nav.push("c1");
        nav.push("c1");
        assert_eq!(nav.path(), ["root", "c1"]);
        assert_eq!(nav.current(), "c1");
    }

    #[test]
    fn pop_never_removes_root() {
        let mut nav = Navigator::new();
        nav.pop();
        assert_eq!(nav.path(), ["root"]);
        nav.push("c1");
        nav.pop();
        nav.pop();
        assert_eq!(nav.path(), ["root"]);
    }

    #[test]
    fn attached_activity_pushes_exactly_one_tail_element() {
        let mut nav = Navigator::new();
        nav.push("c1");
        let follow = nav.note_activity("sub1");
        assert!(follow);
        assert_eq!(nav.path(), ["root", "c1", "sub1"]);

        // same conversation again: no growth, still scrolls
        assert!(nav.note_activity("sub1"));
        assert_eq!(nav.path(), ["root", "c1", "sub1"]);
    }

    #[test]
    fn detached_activity_leaves_position_alone() {
        let mut nav = Navigator::new();
        nav.push("c1");
        nav.on_user_scroll_away();
        assert!(!nav.note_activity("sub1"));
        assert_eq!(nav.path(), ["root", "c1"]);
    }

    #[test]
    fn send_reattaches_and_navigates() {
        let mut nav = Navigator::new();
        nav.detach();
        nav.on_send(&path(&["root", "m1"]));
        assert!(nav.is_attached());
        assert_eq!(nav.path(), ["root", "m1"]);
    }

    #[test]
    fn jump_to_parent_uses_the_store_tree() {
        let mut store = ConversationStore::new();
        store.apply_path_event(path(&["root", "c1"]), Meta::default());
        store.apply_path_event(path(&["root", "c1", "m1", "sub1"]), Meta::default());

        let mut nav = Navigator::new();
        nav.push("c1");
        nav.push("sub1");
        nav.jump_to_parent(&store);
        assert_eq!(nav.current(), "c1");
    }
}
