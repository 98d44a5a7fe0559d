//! # syncpad-collab: Real-time collaborative note sessions
//!
//! Clients attached to the same note exchange positional edits, presence
//! events and content snapshots over one WebSocket each. The server applies
//! edits for a note one at a time and relays them to every other
//! participant.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     JSON frames      ┌─────────────┐
//! │ EditorSession    │ ◄──────────────────► │ SyncServer  │
//! │  ConnectionMgr   │  /ws/notes/{id}?...  │ (per note   │
//! │  SyncController  │                      │  Session)   │
//! │  PresenceTracker │                      └──────┬──────┘
//! └──────────────────┘                             │
//!                                          ┌───────┴───────┐
//!                                          │ NoteStore     │
//!                                          │ AccessPolicy  │
//!                                          └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`edit`]: Edit operations, clamped application, buffer diff
//! - [`protocol`]: JSON wire envelopes and [`CollabError`]
//! - [`events`]: Typed publish/subscribe with explicit unsubscribe
//! - [`client`]: Connection manager with linear reconnect backoff
//! - [`presence`]: Participant list and remote cursor cache
//! - [`sync`]: Sync controller for local diffing, remote application, tier gating
//! - [`session`]: Owned editor session tying the client pieces together
//! - [`registry`]: Server-side note sessions and ordered fan-out
//! - [`access`]: Identity and permission collaborator
//! - [`server`]: WebSocket session server
//! - [`storage`]: Note store collaborator (memory, RocksDB behind `rocks`)

pub mod access;
pub mod client;
pub mod edit;
pub mod events;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use access::{Access, AccessPolicy, Identity, OpenAccess, StaticAccess};
pub use client::{Backoff, ClientConfig, ConnectionManager, ConnectionState, SessionTarget};
pub use edit::{diff, EditKind, EditOperation};
pub use events::{ErrorOrigin, EventBus, EventKind, SessionEvent, Subscription};
pub use presence::{CursorPosition, PresenceNotice, PresenceTracker};
pub use protocol::{ClientMessage, CollabError, ParticipantInfo, RemoteCursor, RemoteEdit, ServerMessage};
pub use registry::{Participant, Session, SessionRegistry};
pub use server::{JoinRequest, ServerConfig, ServerStats, SyncServer};
pub use session::{EditorSession, Update};
pub use storage::{MemoryStore, NoteStore, OperationRecord, StoreError};
pub use sync::{EditSink, LocalEdit, NoteSaver, Notice, SyncController};
