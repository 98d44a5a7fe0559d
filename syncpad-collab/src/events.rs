//! Typed publish/subscribe surface of the connection manager.
//!
//! Listeners are either callbacks keyed by [`EventKind`] or unbounded
//! channels that receive every event. Each registration returns a
//! [`Subscription`] handle which removes exactly that listener when passed
//! to [`EventBus::off`]. Listeners outlive individual connections, so a
//! reconnect or a fresh `connect` keeps delivering to the same handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::protocol::{ParticipantInfo, RemoteCursor, RemoteEdit, ServerMessage};

/// Event type key used for callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    Content,
    Edit,
    Cursor,
    UserJoined,
    UserLeft,
    UserList,
    Pong,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Error => "error",
            EventKind::Content => "content",
            EventKind::Edit => "edit",
            EventKind::Cursor => "cursor",
            EventKind::UserJoined => "user_joined",
            EventKind::UserLeft => "user_left",
            EventKind::UserList => "user_list",
            EventKind::Pong => "pong",
        }
    }
}

/// Where an `Error` event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// The local transport failed.
    Transport,
    /// The server sent an `error` message.
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Error {
        message: String,
        code: Option<String>,
        origin: ErrorOrigin,
    },
    /// Full content snapshot.
    Content {
        content: String,
        seq: Option<u64>,
    },
    Edit(RemoteEdit),
    Cursor(RemoteCursor),
    UserJoined(ParticipantInfo),
    UserLeft(ParticipantInfo),
    UserList(Vec<ParticipantInfo>),
    Pong,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Connected => EventKind::Connected,
            SessionEvent::Disconnected => EventKind::Disconnected,
            SessionEvent::Error { .. } => EventKind::Error,
            SessionEvent::Content { .. } => EventKind::Content,
            SessionEvent::Edit(_) => EventKind::Edit,
            SessionEvent::Cursor(_) => EventKind::Cursor,
            SessionEvent::UserJoined(_) => EventKind::UserJoined,
            SessionEvent::UserLeft(_) => EventKind::UserLeft,
            SessionEvent::UserList(_) => EventKind::UserList,
            SessionEvent::Pong => EventKind::Pong,
        }
    }

    pub(crate) fn transport_error(message: impl Into<String>) -> Self {
        SessionEvent::Error {
            message: message.into(),
            code: None,
            origin: ErrorOrigin::Transport,
        }
    }

    /// Map an inbound server message. Unknown types yield `None`.
    pub fn from_server(msg: ServerMessage) -> Option<Self> {
        let event = match msg {
            ServerMessage::Content { content, seq } => SessionEvent::Content { content, seq },
            ServerMessage::Edit(edit) => SessionEvent::Edit(edit),
            ServerMessage::Cursor(cursor) => SessionEvent::Cursor(cursor),
            ServerMessage::UserJoined(info) => SessionEvent::UserJoined(info),
            ServerMessage::UserLeft(info) => SessionEvent::UserLeft(info),
            ServerMessage::UserList { users } => SessionEvent::UserList(users),
            ServerMessage::Error { message, code } => SessionEvent::Error {
                message,
                code,
                origin: ErrorOrigin::Server,
            },
            ServerMessage::Pong => SessionEvent::Pong,
            ServerMessage::Unknown => return None,
        };
        Some(event)
    }
}

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Clone)]
enum Listener {
    Callback { kind: EventKind, handler: Handler },
    Channel(mpsc::UnboundedSender<SessionEvent>),
}

/// Multi-subscriber fan-out. Handlers for the same kind run in registration
/// order; handlers run outside the internal lock, so a handler may register
/// or remove listeners.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(Subscription, Listener)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(Subscription, Listener)>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, listener: Listener) -> Subscription {
        let sub = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((sub, listener));
        sub
    }

    /// Register a callback for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(Listener::Callback { kind, handler: Arc::new(handler) })
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn off(&self, sub: Subscription) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != sub);
        listeners.len() != before
    }

    /// Receive every event on a channel. The listener is dropped
    /// automatically once the receiver is gone.
    pub fn subscribe(&self) -> (Subscription, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(Listener::Channel(tx)), rx)
    }

    pub fn emit(&self, event: &SessionEvent) {
        let kind = event.kind();
        let snapshot: Vec<(Subscription, Listener)> = self
            .listeners()
            .iter()
            .filter(|(_, listener)| match listener {
                Listener::Callback { kind: k, .. } => *k == kind,
                Listener::Channel(_) => true,
            })
            .cloned()
            .collect();

        let mut closed = Vec::new();
        for (sub, listener) in snapshot {
            match listener {
                Listener::Callback { handler, .. } => handler(event),
                Listener::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(sub);
                    }
                }
            }
        }

        if !closed.is_empty() {
            log::trace!("Pruning {} closed event channels", closed.len());
            self.listeners().retain(|(id, _)| !closed.contains(id));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
