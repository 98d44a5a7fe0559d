//! Connection manager: one owned WebSocket connection to a note session.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with linear backoff)
//! - JSON envelope send/receive, translated to [`SessionEvent`]s
//! - Event subscription through the shared [`EventBus`]
//!
//! ```text
//!   connect() ──► Connecting ──► Open ──► (close/error) ──► Reconnecting
//!                     ▲                                         │
//!                     └──────────── base × attempt ◄────────────┘
//!                                   (attempt > max ──► Closed)
//! ```
//!
//! The manager is an owned handle. Dropping it tears the connection down.
//! `connect` must be called from within a Tokio runtime.
//!
//! Every `connect` and `disconnect` starts a new generation. A driver task
//! only changes state, installs its writer or emits events while its
//! generation is current, so a driver that is still running when it gets
//! cancelled cannot reopen a closed manager.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::edit::{EditKind, EditOperation};
use crate::events::{EventBus, EventKind, SessionEvent, Subscription};
use crate::protocol::{ClientMessage, CollabError, EditPayload, ServerMessage};

/// Client-side connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base server URL, e.g. `ws://127.0.0.1:8000`.
    pub server_url: String,
    /// Reconnect attempts after a close before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay unit for linear backoff.
    pub reconnect_base_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self { server_url: server_url.into(), ..Self::default() }
    }
}

/// Which session to join and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub note_id: String,
    pub user_id: String,
    pub username: String,
    pub token: Option<String>,
}

impl SessionTarget {
    pub fn new(
        note_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            note_id: note_id.into(),
            user_id: user_id.into(),
            username: username.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Build `{server}/ws/notes/{note_id}?user_id=..&username=..[&token=..]`.
pub fn session_url(server_url: &str, target: &SessionTarget) -> Result<Url, CollabError> {
    let mut url = Url::parse(server_url)
        .map_err(|e| CollabError::Transport(format!("invalid server url {server_url:?}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| CollabError::Transport(format!("server url {server_url:?} cannot be a base")))?
        .pop_if_empty()
        .extend(["ws", "notes", target.note_id.as_str()]);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("user_id", &target.user_id);
        query.append_pair("username", &target.username);
        if let Some(token) = &target.token {
            query.append_pair("token", token);
        }
    }
    Ok(url)
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

/// Linear reconnect backoff: the n-th retry waits `base * n`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts, attempts: 0 }
    }

    /// Delay before the next retry, or `None` once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.base * self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// How long a dropped connection's writer may keep flushing.
const WRITER_GRACE: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the handle and its driver task.
struct Shared {
    state: RwLock<ConnectionState>,
    /// Lock order: `generation` before `outgoing`.
    generation: Mutex<u64>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    target: Mutex<Option<SessionTarget>>,
    bus: EventBus,
}

impl Shared {
    /// Run `f` while `generation` is current. `disconnect` waits for it, so
    /// handlers called from `f` must not disconnect.
    fn if_current<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let current = lock(&self.generation);
        (*current == generation).then(f)
    }

    /// Install the writer of a fresh connection and announce it.
    fn attach(&self, generation: u64, tx: mpsc::UnboundedSender<Message>) -> bool {
        self.if_current(generation, || {
            *lock(&self.outgoing) = Some(tx);
            self.set_state(ConnectionState::Open);
            log::info!("WebSocket connected");
            self.bus.emit(&SessionEvent::Connected);
        })
        .is_some()
    }

    /// Drop the writer after a connection ended and announce it.
    fn detach(&self, generation: u64, next: ConnectionState) -> bool {
        self.if_current(generation, || {
            lock(&self.outgoing).take();
            self.set_state(next);
            self.bus.emit(&SessionEvent::Disconnected);
        })
        .is_some()
    }

    fn emit(&self, generation: u64, event: &SessionEvent) -> bool {
        self.if_current(generation, || self.bus.emit(event)).is_some()
    }

    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn send(&self, msg: &ClientMessage) -> bool {
        if self.state() != ConnectionState::Open {
            log::warn!("WebSocket is not connected, dropping {}", msg.type_name());
            return false;
        }
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode {}: {}", msg.type_name(), e);
                return false;
            }
        };
        match lock(&self.outgoing).as_ref() {
            Some(tx) => tx.send(Message::Text(text.into())).is_ok(),
            None => {
                log::warn!("WebSocket is not connected, dropping {}", msg.type_name());
                false
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(msg) => {
                let type_name = msg.type_name();
                match SessionEvent::from_server(msg) {
                    Some(event) => self.bus.emit(&event),
                    None => log::debug!("Ignoring message of type {}", type_name),
                }
            }
            Err(e) => log::warn!("Dropping malformed message: {}", e),
        }
    }
}

/// Owned handle to one session connection.
pub struct ConnectionManager {
    config: ClientConfig,
    shared: Arc<Shared>,
    driver: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Closed),
                generation: Mutex::new(0),
                outgoing: Mutex::new(None),
                target: Mutex::new(None),
                bus: EventBus::new(),
            }),
            driver: None,
        }
    }

    /// Start connecting to `target`, replacing any previous connection.
    ///
    /// Returns once the driver task is spawned; the outcome is reported
    /// through `Connected`, `Error` and `Disconnected` events.
    pub fn connect(&mut self, target: SessionTarget) -> Result<(), CollabError> {
        let url = session_url(&self.config.server_url, &target)?;
        self.disconnect();

        log::info!(
            "Connecting to note {} as {} ({})",
            target.note_id,
            target.username,
            target.user_id
        );
        *lock(&self.shared.target) = Some(target);
        let generation = {
            let current = lock(&self.shared.generation);
            self.shared.set_state(ConnectionState::Connecting);
            *current
        };

        let backoff = Backoff::new(
            self.config.reconnect_base_delay,
            self.config.max_reconnect_attempts,
        );
        self.driver = Some(tokio::spawn(drive(url, self.shared.clone(), generation, backoff)));
        Ok(())
    }

    /// Close the transport and stop reconnecting. Listeners stay registered.
    pub fn disconnect(&mut self) {
        let was_open = {
            let mut generation = lock(&self.shared.generation);
            *generation += 1;
            let was_open = self.shared.state() == ConnectionState::Open;
            if let Some(tx) = lock(&self.shared.outgoing).take() {
                if tx.send(Message::Close(None)).is_err() {
                    log::debug!("Writer already stopped, no close frame sent");
                }
            }
            self.shared.set_state(ConnectionState::Closed);
            was_open
        };
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if let Some(target) = lock(&self.shared.target).take() {
            log::info!("Disconnected from note {}", target.note_id);
        }
        if was_open {
            self.shared.bus.emit(&SessionEvent::Disconnected);
        }
    }

    /// Transmit a message if the connection is open. Returns whether the
    /// message was handed to the writer; delivery is never confirmed.
    pub fn send(&self, msg: &ClientMessage) -> bool {
        self.shared.send(msg)
    }

    pub fn send_edit(
        &self,
        kind: EditKind,
        position: usize,
        content: Option<&str>,
        length: Option<usize>,
    ) -> bool {
        self.send(&ClientMessage::Edit(EditPayload {
            operation: kind,
            position,
            content: content.map(str::to_owned),
            length,
        }))
    }

    pub fn send_operation(&self, op: &EditOperation) -> bool {
        self.send(&ClientMessage::edit(op))
    }

    pub fn send_cursor(&self, position: usize, selection_end: usize) -> bool {
        self.send(&ClientMessage::Cursor { position, selection_end })
    }

    pub fn request_content(&self) -> bool {
        self.send(&ClientMessage::GetContent)
    }

    pub fn ping(&self) -> bool {
        self.send(&ClientMessage::Ping)
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.bus.on(kind, handler)
    }

    pub fn off(&self, sub: Subscription) -> bool {
        self.shared.bus.off(sub)
    }

    pub fn subscribe(&self) -> (Subscription, mpsc::UnboundedReceiver<SessionEvent>) {
        self.shared.bus.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn target(&self) -> Option<SessionTarget> {
        lock(&self.shared.target).clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Connect, run, and reconnect until the backoff ceiling is reached or the
/// generation goes stale.
async fn drive(url: Url, shared: Arc<Shared>, generation: u64, mut backoff: Backoff) {
    loop {
        if shared
            .if_current(generation, || shared.set_state(ConnectionState::Connecting))
            .is_none()
        {
            return;
        }
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                backoff.reset();
                run_connection(ws, &shared, generation).await;
            }
            Err(e) => {
                log::warn!("WebSocket connect to {} failed: {}", url.path(), e);
                shared.emit(generation, &SessionEvent::transport_error("WebSocket error occurred"));
            }
        }

        let delay = backoff.next_delay();
        let next = match delay {
            Some(_) => ConnectionState::Reconnecting,
            None => ConnectionState::Closed,
        };
        if !shared.detach(generation, next) {
            log::debug!("Connection driver superseded, exiting");
            return;
        }

        match delay {
            Some(delay) => {
                log::info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay,
                    backoff.attempts(),
                    backoff.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                log::info!("Giving up after {} reconnect attempts", backoff.max_attempts);
                return;
            }
        }
    }
}

/// Writer task of one connection. Dropping the guard gives the writer
/// [`WRITER_GRACE`] to flush a pending close frame, then aborts it.
struct WriterGuard(Option<JoinHandle<()>>);

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let Some(mut writer) = self.0.take() else { return };
        if writer.is_finished() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if timeout(WRITER_GRACE, &mut writer).await.is_err() {
                        log::debug!("Writer did not finish in {:?}, aborting", WRITER_GRACE);
                        writer.abort();
                    }
                });
            }
            Err(_) => writer.abort(),
        }
    }
}

/// Pump one open connection until it closes, fails or is superseded.
async fn run_connection(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    shared: &Shared,
    generation: u64,
) {
    let (mut sink, mut stream) = ws.split();

    // Writer task: forward outgoing channel to WebSocket
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let _writer = WriterGuard(Some(tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    })));

    if !shared.attach(generation, tx) {
        return;
    }
    shared.send(&ClientMessage::GetContent);

    // Inbound frames are handled strictly in arrival order.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if shared
                    .if_current(generation, || shared.dispatch(text.as_str()))
                    .is_none()
                {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                log::debug!("Server closed connection: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("WebSocket error: {}", e);
                shared.emit(generation, &SessionEvent::transport_error("WebSocket error occurred"));
                break;
            }
        }
    }
}
