use futures::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };
use tokio::sync::{ mpsc, watch };
use tokio::task::JoinHandle;
use tokio::time::{ interval, Duration };
use tokio_tungstenite::{ connect_async, tungstenite::protocol::Message };
use url::Url;

use crate::decoder::{ decode_or_drop, StreamEvent };
use crate::error::ClientError;
use crate::models::websocket::{ ClientFrame, QueryPayload };

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Connection state exposed to the host shell. The core never retries on
/// its own; the shell owns the reconnect/reload policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
    Error,
}

/// One socket per viewed conversation. Dropping the session tears down its
/// tasks and with them the connection, so a socket lifetime is exactly one
/// "viewing this conversation" lifetime.
pub struct SocketSession {
    outbound: mpsc::UnboundedSender<Message>,
    status: watch::Receiver<ConnectionStatus>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl SocketSession {
    /// Open the socket for a conversation and perform the handshake: the
    /// socket protocol has no header auth, so the bearer token goes out as
    /// the first text frame. Returns the session and the stream of decoded
    /// events for the store.
    pub async fn connect(
        url: Url,
        token: &str
    ) -> Result<(Self, mpsc::UnboundedReceiver<StreamEvent>), ClientError> {
        info!("Connecting socket: {}", url);
        let mut ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                error!("Socket connect failed for {}: {}", url, e);
                return Err(e.into());
            }
        };
        ws.send(Message::Text(token.to_string())).await?;

        let (mut sink, mut stream) = ws.split();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Open);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<StreamEvent>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("Socket send failed, connection gone: {}", e);
                    break;
                }
            }
        });

        let pong_tx = outbound_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = decode_or_drop(&text) {
                            if event_tx.send(event).is_err() {
                                // receiver gone: the view navigated away
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if pong_tx.send(Message::Pong(data)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Server closed the socket");
                        let _ = status_tx.send(ConnectionStatus::Closed);
                        return;
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Binary(_)) => {
                        warn!("Ignoring binary frame");
                    }
                    Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        match e {
                            | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => {
                                info!("Socket closed: {}", e);
                                let _ = status_tx.send(ConnectionStatus::Closed);
                            }
                            tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                                io_err.kind() == std::io::ErrorKind::ConnectionReset
                            => {
                                info!("Socket reset by peer");
                                let _ = status_tx.send(ConnectionStatus::Error);
                            }
                            other => {
                                error!("Socket receive error: {}", other);
                                let _ = status_tx.send(ConnectionStatus::Error);
                            }
                        }
                        return;
                    }
                }
            }
            let _ = status_tx.send(ConnectionStatus::Closed);
        });

        // keep intermediaries from idling the connection out
        let heartbeat_tx = outbound_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = match ClientFrame::Heartbeat.into_text() {
                    Ok(text) => Message::Text(text),
                    Err(_) => {
                        break;
                    }
                };
                if heartbeat_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        let session = Self {
            outbound: outbound_tx,
            status: status_rx,
            reader,
            writer,
            heartbeat,
        };
        Ok((session, event_rx))
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Start a turn over the socket.
    pub fn send_query(
        &self,
        query: &str,
        response_to: Option<&str>,
        agent: &str
    ) -> Result<(), ClientError> {
        let frame = ClientFrame::Query(QueryPayload {
            query: query.to_string(),
            response_to: response_to.map(str::to_string),
            agent: agent.to_string(),
        });
        self.send_frame(frame)
    }

    /// Ask the backend to interrupt the in-flight turn. Best effort: the
    /// backend may have finished already.
    pub fn send_cancel(&self, conversation_id: Option<&str>) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::Cancel(conversation_id.map(str::to_string)))
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<(), ClientError> {
        let text = frame.into_text()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::Transport("socket already closed".to_string()))
    }

    /// Explicit teardown; equivalent to dropping the session.
    pub fn close(self) {}
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.writer.abort();
        self.reader.abort();
    }
}
