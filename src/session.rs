//! One live companion-server session over a WebSocket.
//!
//! A spawned wire task owns the socket. Requests are JSON frames stamped
//! with a sequence number plus the player credentials; the matching
//! response is routed back to the caller through a oneshot. Unsolicited
//! broadcasts (team chat, marker pushes) are forwarded as events to
//! whoever holds the receiver. When the socket dies the task fails every
//! pending call instead of leaving callers hanging.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use crate::pairing::ServerCredentials;

/// Interval between protocol-level pings keeping NATs from closing an
/// otherwise quiet socket.
const PING_INTERVAL: Duration = Duration::from_secs(20);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type CallReply = oneshot::Sender<Result<Value, SessionError>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("session closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("server no longer accepts the paired credentials")]
    InvalidSession,
}

/// Events pushed by the wire task without being asked.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Error(String),
    TeamMessage(TeamMessage),
    /// The server pushed a marker update; the regular refresh cycle will
    /// pick the content up.
    MarkersChanged,
}

/// One inbound team-chat message.
#[derive(Debug, Clone)]
pub struct TeamMessage {
    pub sender: String,
    pub message: String,
}

pub(crate) enum WireCommand {
    Call { body: Value, reply: CallReply },
    Disconnect,
}

/// Cloneable handle to one live session. All clones talk to the same
/// wire task; once that task exits every call fails with `Closed`.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<WireCommand>,
}

impl SessionHandle {
    /// Send one request body and await the correlated response.
    pub async fn call(&self, body: Value, timeout: Duration) -> Result<Value, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(WireCommand::Call {
                body,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            // Wire task dropped the reply sender while shutting down.
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// One-time server info (name, map size, player counts).
    pub async fn get_info(&self, timeout: Duration) -> Result<Value, SessionError> {
        self.call(json!({"getInfo": {}}), timeout).await
    }

    /// Full map-marker dump, vending machines included.
    pub async fn get_map_markers(&self, timeout: Duration) -> Result<Value, SessionError> {
        self.call(json!({"getMapMarkers": {}}), timeout).await
    }

    /// Cheap request used as a liveness probe. Any response, success or
    /// error, proves the link is alive.
    pub async fn check_subscription(&self, timeout: Duration) -> Result<Value, SessionError> {
        self.call(json!({"checkSubscription": {}}), timeout).await
    }

    /// Post one line to team chat.
    pub async fn send_team_message(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.call(json!({"sendTeamMessage": {"message": text}}), timeout)
            .await
            .map(|_| ())
    }

    /// Ask the wire task to close the socket. Pending and subsequent
    /// calls fail with `Closed`.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(WireCommand::Disconnect).await;
    }
}

/// Open a WebSocket to the paired server and spawn the wire task.
///
/// Returns the handle plus the event stream the connection manager
/// consumes. The wire emits `Connected` first, `Disconnected` last.
pub async fn connect(
    creds: &ServerCredentials,
) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), SessionError> {
    // The host comes from the credential file; validate before dialing.
    let url = Url::parse(&format!("ws://{}:{}", creds.host, creds.port))
        .map_err(|e| SessionError::Connect(format!("bad server address: {e}")))?;
    let (ws, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| SessionError::Connect(e.to_string()))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(64);
    tokio::spawn(run_wire(ws, creds.clone(), cmd_rx, event_tx));

    Ok((SessionHandle { cmd_tx }, event_rx))
}

/// Handle wired to an in-memory command channel instead of a socket.
#[cfg(test)]
pub(crate) fn in_memory(buffer: usize) -> (SessionHandle, mpsc::Receiver<WireCommand>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(buffer);
    (SessionHandle { cmd_tx }, cmd_rx)
}

async fn run_wire(
    ws: WsStream,
    creds: ServerCredentials,
    mut cmd_rx: mpsc::Receiver<WireCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let (mut write, mut read) = ws.split();
    let mut pending: HashMap<u64, CallReply> = HashMap::new();
    let mut seq: u64 = 0;

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // first tick is immediate; skip it

    let _ = event_tx.send(SessionEvent::Connected).await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(WireCommand::Call { body, reply }) => {
                    seq += 1;
                    let frame = request_frame(seq, &creds, &body);
                    match write.send(Message::Text(frame.to_string().into())).await {
                        Ok(()) => {
                            pending.insert(seq, reply);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(SessionError::Transport(e.to_string())));
                            let _ = event_tx.send(SessionEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                }
                Some(WireCommand::Disconnect) | None => break,
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(text.as_str(), &mut pending, &event_tx).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        handle_frame(text, &mut pending, &event_tx).await;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = event_tx.send(SessionEvent::Error(e.to_string())).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(Bytes::new())).await {
                    let _ = event_tx.send(SessionEvent::Error(e.to_string())).await;
                    break;
                }
            }
        }
    }

    let _ = write.send(Message::Close(None)).await;
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(SessionError::Closed));
    }
    let _ = event_tx.send(SessionEvent::Disconnected).await;
    debug!("wire task finished");
}

/// Build one outbound frame: sequence number, credentials, request body.
fn request_frame(seq: u64, creds: &ServerCredentials, body: &Value) -> Value {
    let mut frame = json!({
        "seq": seq,
        "playerId": creds.player_id,
        "playerToken": creds.player_token,
    });
    if let (Some(obj), Some(extra)) = (frame.as_object_mut(), body.as_object()) {
        for (key, value) in extra {
            obj.insert(key.clone(), value.clone());
        }
    }
    frame
}

async fn handle_frame(
    text: &str,
    pending: &mut HashMap<u64, CallReply>,
    event_tx: &mpsc::Sender<SessionEvent>,
) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "discarding unparseable frame");
            return;
        }
    };

    if let Some(seq) = frame.get("seq").and_then(Value::as_u64) {
        if let Some(reply) = pending.remove(&seq) {
            let response = frame.get("response").cloned().unwrap_or(Value::Null);
            let _ = reply.send(classify_response(response));
        } else {
            debug!(seq, "response for unknown or timed-out call");
        }
        return;
    }

    if let Some(broadcast) = frame.get("broadcast") {
        if let Some(event) = parse_broadcast(broadcast) {
            let _ = event_tx.send(event).await;
        }
    }
}

/// Map an explicit error response into the session error taxonomy;
/// anything else passes through untouched.
fn classify_response(response: Value) -> Result<Value, SessionError> {
    let code = response
        .get("error")
        .and_then(|e| e.get("error"))
        .and_then(Value::as_str);
    match code {
        Some("invalid_session") => Err(SessionError::InvalidSession),
        Some(other) => Err(SessionError::Server(other.to_string())),
        None => Ok(response),
    }
}

fn parse_broadcast(broadcast: &Value) -> Option<SessionEvent> {
    if let Some(msg) = broadcast.pointer("/teamMessage/message") {
        let sender = msg
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = msg
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if message.is_empty() {
            warn!("team message broadcast without text");
            return None;
        }
        return Some(SessionEvent::TeamMessage(TeamMessage { sender, message }));
    }
    if broadcast.get("mapMarkers").is_some() {
        return Some(SessionEvent::MarkersChanged);
    }
    None
}
