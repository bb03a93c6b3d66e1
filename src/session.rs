use log::{ info, warn };
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::AgentBackend;
use crate::decoder::StreamEvent;
use crate::error::ClientError;
use crate::models::chat::{ FunctionCall, Message, ROOT_ID };
use crate::navigation::Navigator;
use crate::store::ConversationStore;
use crate::websocket::{ ConnectionStatus, SocketSession };

/// One user-facing chat session: the conversation store, the navigation
/// position, and at most one live socket (the conversation currently being
/// viewed). All mutation funnels through `&mut self` methods called from a
/// single task, so handlers run to completion without interleaving writers.
pub struct ChatSession {
    backend: Arc<dyn AgentBackend>,
    store: ConversationStore,
    navigator: Navigator,
    agent: String,
    socket: Option<SocketSession>,
    socket_conversation: Option<String>,
    events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    fallback_status: ConnectionStatus,
    show_initial: bool,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn AgentBackend>, agent: String) -> Self {
        Self {
            backend,
            store: ConversationStore::new(),
            navigator: Navigator::new(),
            agent,
            socket: None,
            socket_conversation: None,
            events: None,
            fallback_status: ConnectionStatus::Closed,
            show_initial: false,
        }
    }

    pub fn set_show_initial(&mut self, show_initial: bool) {
        self.show_initial = show_initial;
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn position(&self) -> &[String] {
        self.navigator.path()
    }

    pub fn current_conversation(&self) -> &str {
        self.navigator.current()
    }

    pub fn is_attached(&self) -> bool {
        self.navigator.is_attached()
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn set_agent(&mut self, agent: String) {
        self.agent = agent;
    }

    /// Messages to render at the current position.
    pub fn visible_messages(&self) -> Vec<Message> {
        self.store.messages_for(self.navigator.current(), self.show_initial)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.socket
            .as_ref()
            .map(SocketSession::status)
            .unwrap_or(self.fallback_status)
    }

    /// Open a conversation as the active view: tear down the previous
    /// socket, clear streaming leftovers, ingest the authoritative REST
    /// snapshot, then connect a fresh socket (the backend refuses sockets
    /// for the root listing, which is REST-only).
    ///
    /// Only REST failures are errors; a socket that will not connect is
    /// surfaced through [`ChatSession::connection_status`] and left to the
    /// shell's reconnect policy.
    pub async fn open(&mut self, conversation_id: &str) -> Result<(), ClientError> {
        self.socket = None;
        self.events = None;
        self.socket_conversation = None;
        self.store.clear_streaming();

        let snapshot = if conversation_id == ROOT_ID {
            self.backend.root_by_agent(&self.agent).await?
        } else {
            self.backend.conversation(conversation_id).await?
        };
        self.store.ingest_snapshot(snapshot);
        self.navigator.push(conversation_id);

        if conversation_id == ROOT_ID {
            self.fallback_status = ConnectionStatus::Closed;
            return Ok(());
        }
        let url = self.backend.websocket_url(conversation_id)?;
        match SocketSession::connect(url, self.backend.token()).await {
            Ok((socket, events)) => {
                self.socket = Some(socket);
                self.events = Some(events);
                self.socket_conversation = Some(conversation_id.to_string());
            }
            Err(e) => {
                warn!("No live updates for {}: {}", conversation_id, e);
                self.fallback_status = ConnectionStatus::Error;
            }
        }
        Ok(())
    }

    /// Next decoded frame from the active socket. Pends forever while no
    /// socket is open, which makes it safe to park in a `select!` arm; a
    /// drained channel (socket gone) is dropped so the arm pends instead of
    /// spinning on `None`.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        match self.events.as_mut() {
            Some(events) => {
                let event = events.recv().await;
                if event.is_none() {
                    self.events = None;
                }
                event
            }
            None => std::future::pending().await,
        }
    }

    /// Feed one decoded frame through the store and the navigator. Returns
    /// true when the visible slice changed and the view should re-render
    /// (and, while attached, scroll to the bottom).
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        let Some(owner) = self.store.apply(event) else {
            return false;
        };
        if self.navigator.note_activity(&owner) {
            return true;
        }
        // detached, but the current view itself may still have changed
        owner == self.navigator.current()
    }

    /// Post a user turn. Re-attaches and navigates to the path the backend
    /// answers with, then opens the turn's conversation as the active view.
    pub async fn send(&mut self, query: &str) -> Result<Vec<String>, ClientError> {
        let response_to = match self.navigator.current() {
            ROOT_ID => None,
            current => Some(current.to_string()),
        };
        let path = self.backend.send_message(query, response_to.as_deref(), &self.agent).await?;
        info!("Turn accepted, conversation path {:?}", path);
        self.navigator.on_send(&path);
        let tail = self.navigator.current().to_string();
        if self.socket_conversation.as_deref() != Some(tail.as_str()) {
            self.open(&tail).await?;
        }
        Ok(path)
    }

    /// Interrupt the in-flight turn: in-band over the socket when it is
    /// open, otherwise through REST. Best effort either way.
    pub async fn cancel(&mut self) -> Result<(), ClientError> {
        let current = self.navigator.current().to_string();
        if let Some(socket) = &self.socket {
            if socket.status() == ConnectionStatus::Open {
                return socket.send_cancel(Some(current.as_str()));
            }
        }
        self.backend.cancel(&current).await
    }

    /// Clone the conversation from a message (deleted messages included —
    /// logical deletion never breaks addressing) and navigate into the
    /// clone.
    pub async fn fork(&mut self, message_id: &str) -> Result<Vec<String>, ClientError> {
        let path = self.store
            .path_of(message_id)
            .map(<[String]>::to_vec)
            .ok_or_else(|| {
                ClientError::Protocol(format!("unknown message for fork: {}", message_id))
            })?;
        let forked = self.backend.fork(&path).await?;
        let new_path = forked.path.clone();
        self.store.ingest_snapshot(forked);
        self.navigator.on_send(&new_path);
        let tail = self.navigator.current().to_string();
        self.open(&tail).await?;
        Ok(new_path)
    }

    pub async fn rate(&mut self, message_id: &str, rating: i8) -> Result<(), ClientError> {
        self.backend.update_meta(message_id, json!({ "rating": rating })).await?;
        self.store.set_rating(message_id, rating);
        Ok(())
    }

    /// Logical deletion: hidden from rendering, still addressable.
    pub async fn delete(&mut self, message_id: &str) -> Result<(), ClientError> {
        self.backend.update_meta(message_id, json!({ "deleted": true })).await?;
        self.store.set_deleted(message_id, true);
        Ok(())
    }

    pub async fn update_function_call(
        &mut self,
        message_id: &str,
        function_call: FunctionCall
    ) -> Result<(), ClientError> {
        self.backend.update_chat(message_id, &function_call).await?;
        self.store.set_function_call(message_id, function_call);
        Ok(())
    }

    /// Execute code in a cell, inserted after the given message.
    pub async fn run_cell(&mut self, message_id: &str, code: &str) -> Result<(), ClientError> {
        let path = self.insert_after_path(message_id)?;
        self.backend.run_cell(code, "python", &path).await
    }

    pub async fn create_cell(&mut self, message_id: &str, code: &str) -> Result<(), ClientError> {
        let path = self.insert_after_path(message_id)?;
        self.backend.create_cell(code, &path).await
    }

    pub async fn share(&self) -> Result<String, ClientError> {
        self.backend.share(self.navigator.current(), "view").await
    }

    /// Step into a sub-conversation already flowing over the current
    /// socket. No reconnect: the socket for the opened conversation carries
    /// every nested stream beneath it.
    pub fn enter(&mut self, conversation_id: &str) {
        self.navigator.push(conversation_id);
    }

    pub fn back(&mut self) {
        self.navigator.pop();
    }

    pub fn jump_to_parent(&mut self) {
        self.navigator.jump_to_parent(&self.store);
    }

    pub fn attach(&mut self) {
        self.navigator.attach();
    }

    pub fn detach(&mut self) {
        self.navigator.detach();
    }

    pub fn on_user_scroll_away(&mut self) {
        self.navigator.on_user_scroll_away();
    }

    fn insert_after_path(&self, message_id: &str) -> Result<Vec<String>, ClientError> {
        self.store
            .path_of(message_id)
            .map(<[String]>::to_vec)
            .ok_or_else(|| ClientError::Protocol(format!("unknown message: {}", message_id)))
    }
}
