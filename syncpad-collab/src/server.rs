//! WebSocket session server: the serialization point for note edits.
//!
//! Architecture:
//! ```text
//! Client A ──┐   /ws/notes/{id}?user_id=&username=&token=
//!             ├── Session (note id) ── content + seq ── broadcast channel
//! Client B ──┘        │                                    │
//!                     ├── NoteStore (load / log / persist) │
//!                     │                        ┌───────────┼───────────┐
//!                     ▼                        ▼           ▼           ▼
//!               AccessPolicy               Client A    Client B    Client C
//! ```
//!
//! Per connection:
//! 1. Parse the handshake path and query, resolve identity, check read access
//!    (closed with 1008 "Access denied" otherwise).
//! 2. Join the session, broadcast `user_joined` to the others, send
//!    `user_list` to the newcomer.
//! 3. Serve `get_content`, `edit`, `cursor` and `ping` in arrival order while
//!    forwarding the session broadcast, minus frames this connection caused.
//! 4. On close, leave the session and broadcast `user_left`. The last leave
//!    persists the content.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::access::{Access, AccessPolicy, Identity, OpenAccess};
use crate::protocol::{ClientMessage, CollabError, RemoteCursor, ServerMessage, CODE_SESSION_FULL};
use crate::registry::{Participant, Session, SessionRegistry};
use crate::storage::{open_store, MemoryStore, NoteStore, StoreError};

const NOTES_PATH_PREFIX: &str = "/ws/notes/";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per note session
    pub max_participants_per_session: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Note store path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            max_participants_per_session: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Closed for lack of read access or a full session
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub edits_applied: u64,
    pub active_sessions: usize,
}

/// Handshake parameters taken from the request path and query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub note_id: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub token: Option<String>,
}

impl JoinRequest {
    /// Parse `/ws/notes/{note_id}` plus its query string. The note id is
    /// used exactly as it appears in the path.
    pub fn parse(path: &str, query: Option<&str>) -> Option<Self> {
        let note_id = path.strip_prefix(NOTES_PATH_PREFIX)?.trim_end_matches('/');
        if note_id.is_empty() || note_id.contains('/') {
            return None;
        }

        let mut request = Self {
            note_id: note_id.to_string(),
            user_id: None,
            username: None,
            token: None,
        };
        let pairs = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes());
        for (key, value) in pairs {
            let value = Some(value.into_owned()).filter(|v| !v.is_empty());
            match key.as_ref() {
                "user_id" => request.user_id = value,
                "username" => request.username = value,
                "token" => request.token = value,
                _ => {}
            }
        }
        Some(request)
    }

    /// Who is connecting. A token only fills in what the query left out;
    /// with no user id at all an anonymous identity is minted.
    pub fn resolve_identity(&self, policy: &dyn AccessPolicy) -> Identity {
        let from_token = self.token.as_deref().and_then(|t| policy.resolve_token(t));
        let user_id = self
            .user_id
            .clone()
            .or_else(|| from_token.as_ref().map(|i| i.user_id.clone()));

        match user_id {
            Some(user_id) => {
                let username = self
                    .username
                    .clone()
                    .or_else(|| from_token.map(|i| i.username))
                    .unwrap_or_else(|| "Anonymous".to_string());
                Identity::new(user_id, username)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                let username = format!("Anonymous-{}", &id[..8]);
                Identity::new(id, username)
            }
        }
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send_message(sink: &mut WsSink, msg: &ServerMessage) -> bool {
    match msg.to_json() {
        Ok(text) => sink.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            log::error!("Failed to encode {}: {}", msg.type_name(), e);
            false
        }
    }
}

/// Fan `msg` out to everyone in the session except `origin`. Returns the
/// number of receivers, 0 when the message could not be sent.
fn announce(session: &Session, origin: Uuid, msg: &ServerMessage) -> usize {
    match session.broadcast(Some(origin), msg) {
        Ok(receivers) => receivers,
        Err(e) => {
            log::error!(
                "Failed to broadcast {} in note {}: {}",
                msg.type_name(),
                session.note_id(),
                e
            );
            0
        }
    }
}

async fn close_with(sink: &mut WsSink, code: CloseCode, reason: &str) {
    let frame = CloseFrame { code, reason: reason.to_string().into() };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

/// Shared state handed to every connection task.
#[derive(Clone)]
struct ServerContext {
    registry: Arc<SessionRegistry>,
    policy: Arc<dyn AccessPolicy>,
    stats: Arc<RwLock<ServerStats>>,
}

/// One joined connection.
struct Member {
    participant: Participant,
    access: Access,
    session: Arc<Session>,
}

/// The session server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: ServerContext,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        policy: Arc<dyn AccessPolicy>,
        store: Arc<dyn NoteStore>,
    ) -> Self {
        let registry = SessionRegistry::new(
            store,
            config.broadcast_capacity,
            config.max_participants_per_session,
        );
        Self {
            config,
            ctx: ServerContext {
                registry: Arc::new(registry),
                policy,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Open the store named by `config.storage_path` (memory if unset).
    pub fn from_config(config: ServerConfig, policy: Arc<dyn AccessPolicy>) -> Result<Self, StoreError> {
        let store = open_store(&config)?;
        Ok(Self::new(config, policy, store))
    }

    /// Default configuration, in-memory store, everyone premium.
    pub fn with_defaults() -> Self {
        Self::new(
            ServerConfig::default(),
            Arc::new(OpenAccess::premium()),
            Arc::new(MemoryStore::new()),
        )
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn store(&self) -> &Arc<dyn NoteStore> {
        self.ctx.registry.store()
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ServerContext,
) -> Result<(), CollabError> {
    let mut join: Option<JoinRequest> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match JoinRequest::parse(req.uri().path(), req.uri().query()) {
            Some(request) => {
                join = Some(request);
                Ok(resp)
            }
            None => {
                let mut error = ErrorResponse::new(Some("Not found".to_string()));
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some(request) = join else {
        return Ok(());
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let identity = request.resolve_identity(ctx.policy.as_ref());
    let access = ctx.policy.access(&request.note_id, &identity.user_id);
    if !access.read {
        log::info!(
            "Denied {} ({}) access to note {}",
            identity.username,
            identity.user_id,
            request.note_id
        );
        close_with(&mut ws_sender, CloseCode::Policy, "Access denied").await;
        finish(&ctx, true).await;
        return Ok(());
    }

    let participant = Participant::new(identity.user_id, identity.username);
    let connection_id = participant.connection_id;
    let (session, mut broadcast_rx) = match ctx.registry.join(&request.note_id, participant.clone()).await {
        Ok(joined) => joined,
        Err(e) => {
            log::warn!("Join of note {} from {addr} refused: {e}", request.note_id);
            let code = match e {
                CollabError::SessionFull { .. } => CODE_SESSION_FULL,
                _ => "join_failed",
            };
            send_message(&mut ws_sender, &ServerMessage::error(e.to_string(), code)).await;
            close_with(&mut ws_sender, CloseCode::Again, "Join refused").await;
            finish(&ctx, true).await;
            return Ok(());
        }
    };
    ctx.stats.write().await.active_sessions = ctx.registry.session_count().await;

    let member = Member { participant, access, session };
    announce(&member.session, connection_id, &ServerMessage::UserJoined(member.participant.info()));
    let users = member.session.participant_infos().await;
    send_message(&mut ws_sender, &ServerMessage::UserList { users }).await;

    loop {
        tokio::select! {
            // Incoming WebSocket message
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = ctx.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += text.len() as u64;
                        }
                        if let Some(reply) = handle_message(&ctx, &member, text.as_str()).await {
                            if !send_message(&mut ws_sender, &reply).await {
                                break;
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }

                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Session broadcast
            outbound = broadcast_rx.recv() => {
                match outbound {
                    Ok(frame) => {
                        if !frame.is_for(connection_id) {
                            continue;
                        }
                        if ws_sender.send(Message::Text(frame.payload.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // Missed edits cannot be replayed; the client
                        // reconnects and fetches a fresh snapshot.
                        log::warn!("Connection {connection_id} lagged by {n} messages, closing");
                        close_with(&mut ws_sender, CloseCode::Again, "Lagged").await;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    drop(broadcast_rx);
    if let Some(departure) = ctx.registry.leave(&request.note_id, connection_id).await {
        if !departure.closed {
            announce(&departure.session, connection_id, &ServerMessage::UserLeft(departure.participant.info()));
        }
    }
    finish(&ctx, false).await;
    Ok(())
}

async fn finish(ctx: &ServerContext, rejected: bool) {
    let sessions = ctx.registry.session_count().await;
    let mut s = ctx.stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_sessions = sessions;
    if rejected {
        s.rejected_connections += 1;
    }
}

/// Serve one client message. Returns the direct reply, if any.
async fn handle_message(ctx: &ServerContext, member: &Member, text: &str) -> Option<ServerMessage> {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Dropping malformed message from {}: {e}", member.participant.connection_id);
            ctx.stats.write().await.malformed_messages += 1;
            return None;
        }
    };

    match msg {
        ClientMessage::GetContent => {
            // Edits up to `seq` may still be queued on this connection's
            // broadcast receiver; the client skips them by sequence number.
            let (content, seq) = member.session.snapshot().await;
            Some(ServerMessage::Content { content, seq: Some(seq) })
        }

        ClientMessage::Edit(payload) => {
            if !member.access.premium {
                return Some(ServerMessage::premium_required());
            }
            if !member.access.write {
                return Some(ServerMessage::write_required());
            }
            match member
                .session
                .apply_edit(&member.participant, &payload.to_operation())
                .await
            {
                Ok(applied) => {
                    log::debug!(
                        "Applied {} seq {} on note {} from {}",
                        applied.operation.kind().as_str(),
                        applied.seq,
                        member.session.note_id(),
                        member.participant.username
                    );
                    ctx.stats.write().await.edits_applied += 1;
                    None
                }
                Err(e) => {
                    log::error!("Failed to apply edit on note {}: {e}", member.session.note_id());
                    None
                }
            }
        }

        ClientMessage::Cursor { position, selection_end } => {
            if !member.access.premium {
                return Some(ServerMessage::premium_required());
            }
            let cursor = ServerMessage::Cursor(RemoteCursor {
                user_id: member.participant.user_id.clone(),
                username: member.participant.username.clone(),
                position,
                selection_end,
            });
            announce(&member.session, member.participant.connection_id, &cursor);
            None
        }

        ClientMessage::Ping => Some(ServerMessage::Pong),

        ClientMessage::Unknown => {
            log::debug!("Ignoring unknown message type from {}", member.participant.connection_id);
            None
        }
    }
}
