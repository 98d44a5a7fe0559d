//! Server-side session registry: note id → live session.
//!
//! A session exists while at least one connection is attached. It owns the
//! authoritative content, the participant list and a broadcast channel that
//! fans every outbound message to all attached connections. Each connection
//! filters out messages it originated, so a sender never sees its own edit.
//!
//! Edits for one session are applied under a single document lock and
//! broadcast before the lock is released, which makes the session the
//! serialization point: every participant observes edits in receipt order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::edit::EditOperation;
use crate::protocol::{CollabError, ParticipantInfo, RemoteEdit, ServerMessage};
use crate::storage::{NoteStore, OperationRecord};

/// One live connection attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub connection_id: Uuid,
    pub user_id: String,
    pub username: String,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id: user_id.into(),
            username: username.into(),
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo::new(self.user_id.clone(), self.username.clone())
    }
}

/// A pre-encoded frame on a session's broadcast channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Connection that caused the message; it is not delivered back there.
    pub origin: Option<Uuid>,
    pub payload: Arc<str>,
}

impl Outbound {
    pub fn is_for(&self, connection_id: Uuid) -> bool {
        self.origin != Some(connection_id)
    }
}

/// An edit as the session applied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEdit {
    pub seq: u64,
    /// The operation after clamping to the session content.
    pub operation: EditOperation,
    /// Connections the edit was fanned out to, sender included.
    pub receivers: usize,
}

#[derive(Debug)]
struct SessionDocument {
    content: String,
    seq: u64,
    /// Holds real-time edits not yet written to the store.
    dirty: bool,
}

pub struct Session {
    note_id: String,
    store: Arc<dyn NoteStore>,
    sender: broadcast::Sender<Outbound>,
    participants: RwLock<Vec<Participant>>,
    document: Mutex<SessionDocument>,
    messages_sent: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("note_id", &self.note_id).finish_non_exhaustive()
    }
}

impl Session {
    fn new(note_id: &str, content: String, seq: u64, store: Arc<dyn NoteStore>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            note_id: note_id.to_string(),
            store,
            sender,
            participants: RwLock::new(Vec::new()),
            document: Mutex::new(SessionDocument { content, seq, dirty: false }),
            messages_sent: AtomicU64::new(0),
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    /// Send to every attached connection except `origin`.
    /// Returns the number of receivers, `origin` included.
    pub fn broadcast(&self, origin: Option<Uuid>, msg: &ServerMessage) -> Result<usize, CollabError> {
        let payload: Arc<str> = msg.to_json()?.into();
        Ok(self.broadcast_raw(Outbound { origin, payload }))
    }

    pub fn broadcast_raw(&self, frame: Outbound) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Apply an edit to the authoritative content, log it and fan it out,
    /// all under the document lock.
    pub async fn apply_edit(
        &self,
        author: &Participant,
        op: &EditOperation,
    ) -> Result<AppliedEdit, CollabError> {
        let mut doc = self.document.lock().await;
        let operation = op.clamped(&doc.content);
        let seq = doc.seq + 1;
        let msg = ServerMessage::Edit(RemoteEdit::new(&operation, &author.info(), seq));
        let payload: Arc<str> = msg.to_json()?.into();

        operation.apply_to(&mut doc.content);
        doc.seq = seq;
        doc.dirty = true;

        let record = OperationRecord::new(seq, &author.user_id, &author.username, &operation);
        if let Err(e) = self.store.append_operation(&self.note_id, &record) {
            log::warn!("Failed to log edit {} on note {}: {}", seq, self.note_id, e);
        }

        let receivers = self.broadcast_raw(Outbound {
            origin: Some(author.connection_id),
            payload,
        });
        Ok(AppliedEdit { seq, operation, receivers })
    }

    /// Content and sequence number for a `get_content` reply, read under
    /// one lock. Without unpersisted edits the store copy wins, so explicit
    /// saves made elsewhere become visible.
    pub async fn snapshot(&self) -> (String, u64) {
        let mut doc = self.document.lock().await;
        if !doc.dirty {
            match self.store.load_content(&self.note_id) {
                Ok(Some(stored)) => doc.content = stored,
                Ok(None) => {}
                Err(e) => log::warn!("Failed to reload note {}: {}", self.note_id, e),
            }
        }
        (doc.content.clone(), doc.seq)
    }

    pub async fn content(&self) -> String {
        self.document.lock().await.content.clone()
    }

    pub async fn seq(&self) -> u64 {
        self.document.lock().await.seq
    }

    /// Write unpersisted edits to the store.
    pub async fn persist(&self) -> Result<bool, CollabError> {
        let mut doc = self.document.lock().await;
        if !doc.dirty {
            return Ok(false);
        }
        self.store.save_content(&self.note_id, &doc.content)?;
        doc.dirty = false;
        log::info!("Persisted note {} at seq {}", self.note_id, doc.seq);
        if let Err(e) = self.store.compact_operations(&self.note_id, doc.seq) {
            log::warn!("Failed to compact operation log of note {}: {}", self.note_id, e);
        }
        Ok(true)
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.participants.read().await.clone()
    }

    pub async fn participant_infos(&self) -> Vec<ParticipantInfo> {
        self.participants.read().await.iter().map(Participant::info).collect()
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

/// Result of a connection leaving its session.
pub struct Departure {
    pub participant: Participant,
    pub session: Arc<Session>,
    /// The session was destroyed because nobody is left.
    pub closed: bool,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    store: Arc<dyn NoteStore>,
    broadcast_capacity: usize,
    max_participants: usize,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn NoteStore>, broadcast_capacity: usize, max_participants: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            broadcast_capacity,
            max_participants,
        }
    }

    /// Attach a participant, creating the session from the store on first
    /// join. The returned receiver is subscribed before this returns, so it
    /// sees every message broadcast afterwards.
    pub async fn join(
        &self,
        note_id: &str,
        participant: Participant,
    ) -> Result<(Arc<Session>, broadcast::Receiver<Outbound>), CollabError> {
        let mut sessions = self.sessions.write().await;
        let (session, created) = match sessions.get(note_id) {
            Some(session) => (session.clone(), false),
            None => {
                let content = self.store.load_content(note_id)?.unwrap_or_default();
                // Continue the operation log where the last session stopped.
                let seq = self.store.last_seq(note_id)?;
                let session =
                    Session::new(note_id, content, seq, self.store.clone(), self.broadcast_capacity);
                (Arc::new(session), true)
            }
        };

        let rx = {
            let mut participants = session.participants.write().await;
            if participants.len() >= self.max_participants {
                return Err(CollabError::SessionFull {
                    note_id: note_id.to_string(),
                    limit: self.max_participants,
                });
            }
            log::info!(
                "{} ({}) joined note {} as {}",
                participant.username,
                participant.user_id,
                note_id,
                participant.connection_id
            );
            participants.push(participant);
            session.sender.subscribe()
        };

        if created {
            log::info!("Opened session for note {}", note_id);
            sessions.insert(note_id.to_string(), session.clone());
        }
        Ok((session, rx))
    }

    /// Detach a connection. The last leave persists and destroys the session.
    pub async fn leave(&self, note_id: &str, connection_id: Uuid) -> Option<Departure> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get(note_id)?.clone();

        let (participant, remaining) = {
            let mut participants = session.participants.write().await;
            let index = participants.iter().position(|p| p.connection_id == connection_id)?;
            let participant = participants.remove(index);
            (participant, participants.len())
        };
        log::info!("{} left note {}", participant.username, note_id);

        let closed = remaining == 0;
        if closed {
            sessions.remove(note_id);
            if let Err(e) = session.persist().await {
                log::error!("Failed to persist note {}: {}", note_id, e);
            }
            log::info!("Closed session for note {}", note_id);
        }
        Some(Departure { participant, session, closed })
    }

    pub async fn get(&self, note_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(note_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_notes(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub fn store(&self) -> &Arc<dyn NoteStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn registry_with(store: MemoryStore, max: usize) -> SessionRegistry {
        SessionRegistry::new(Arc::new(store), 16, max)
    }

    #[tokio::test]
    async fn test_first_join_loads_from_store() {
        let registry = registry_with(MemoryStore::new().with_note("n", "seed"), 8);
        let (session, _rx) = registry.join("n", Participant::new("a", "A")).await.unwrap();
        assert_eq!(session.content().await, "seed");
        assert_eq!(registry.session_count().await, 1);

        let (again, _rx2) = registry.join("n", Participant::new("b", "B")).await.unwrap();
        assert!(Arc::ptr_eq(&session, &again));
        assert_eq!(session.participant_count().await, 2);
    }

    #[tokio::test]
    async fn test_same_user_twice_is_two_participants() {
        let registry = registry_with(MemoryStore::new(), 8);
        let first = Participant::new("a", "A");
        let second = Participant::new("a", "A");
        assert_ne!(first.connection_id, second.connection_id);
        registry.join("n", first).await.unwrap();
        let (session, _rx) = registry.join("n", second).await.unwrap();
        assert_eq!(session.participant_count().await, 2);
    }

    #[tokio::test]
    async fn test_edit_fans_out_with_origin() {
        let registry = registry_with(MemoryStore::new().with_note("n", "hello"), 8);
        let alice = Participant::new("a", "Alice");
        let bob = Participant::new("b", "Bob");
        let (session, mut rx_a) = registry.join("n", alice.clone()).await.unwrap();
        let (_, mut rx_b) = registry.join("n", bob.clone()).await.unwrap();

        let applied = session
            .apply_edit(&alice, &EditOperation::insert(5, "!"))
            .await
            .unwrap();
        assert_eq!(applied.seq, 1);
        assert_eq!(applied.receivers, 2);
        assert_eq!(session.content().await, "hello!");

        let frame = rx_a.recv().await.unwrap();
        assert!(!frame.is_for(alice.connection_id));
        let frame = rx_b.recv().await.unwrap();
        assert!(frame.is_for(bob.connection_id));
        match ServerMessage::parse(&frame.payload).unwrap() {
            ServerMessage::Edit(edit) => {
                assert_eq!(edit.seq, Some(1));
                assert_eq!(edit.username.as_deref(), Some("Alice"));
            }
            other => panic!("expected edit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_edits_are_clamped_sequenced_and_logged() {
        let store = Arc::new(MemoryStore::new().with_note("n", "abc"));
        let registry = SessionRegistry::new(store.clone(), 16, 8);
        let alice = Participant::new("a", "A");
        let (session, _rx) = registry.join("n", alice.clone()).await.unwrap();

        let first = session.apply_edit(&alice, &EditOperation::delete(1, 99)).await.unwrap();
        assert_eq!(first.operation, EditOperation::delete(1, 2));
        let second = session.apply_edit(&alice, &EditOperation::insert(50, "z")).await.unwrap();
        assert_eq!(second.operation, EditOperation::insert(1, "z"));
        assert_eq!(second.seq, 2);
        assert_eq!(session.content().await, "az");

        let log = store.operations("n").unwrap();
        assert_eq!(log.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(log[0].operation(), EditOperation::delete(1, 2));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = registry_with(MemoryStore::new(), 1);
        registry.join("n", Participant::new("a", "A")).await.unwrap();
        let err = registry.join("n", Participant::new("b", "B")).await.unwrap_err();
        assert_eq!(err, CollabError::SessionFull { note_id: "n".into(), limit: 1 });
    }

    #[tokio::test]
    async fn test_last_leave_persists_and_closes() {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(store.clone(), 16, 8);
        let alice = Participant::new("a", "A");
        let bob = Participant::new("b", "B");
        let (session, _ra) = registry.join("n", alice.clone()).await.unwrap();
        registry.join("n", bob.clone()).await.unwrap();
        session.apply_edit(&alice, &EditOperation::insert(0, "hi")).await.unwrap();

        let departure = registry.leave("n", alice.connection_id).await.unwrap();
        assert!(!departure.closed);
        assert_eq!(departure.participant, alice);
        assert_eq!(store.load_content("n").unwrap(), None);
        assert_eq!(store.operations("n").unwrap().len(), 1);

        let departure = registry.leave("n", bob.connection_id).await.unwrap();
        assert!(departure.closed);
        assert_eq!(store.load_content("n").unwrap().as_deref(), Some("hi"));
        // Saved content covers the log.
        assert!(store.operations("n").unwrap().is_empty());
        assert_eq!(registry.session_count().await, 0);
        assert!(registry.leave("n", bob.connection_id).await.is_none());
    }

    #[tokio::test]
    async fn test_reopened_session_continues_sequence() {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(store.clone(), 16, 8);
        let alice = Participant::new("a", "A");

        let (session, _rx) = registry.join("n", alice.clone()).await.unwrap();
        session.apply_edit(&alice, &EditOperation::insert(0, "ab")).await.unwrap();
        registry.leave("n", alice.connection_id).await.unwrap();
        assert!(store.operations("n").unwrap().is_empty());

        let (session, _rx) = registry.join("n", alice.clone()).await.unwrap();
        assert_eq!(session.seq().await, 1);
        let applied = session.apply_edit(&alice, &EditOperation::insert(2, "c")).await.unwrap();
        assert_eq!(applied.seq, 2);
        assert_eq!(store.last_seq("n").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_reloads_only_when_clean() {
        let store = Arc::new(MemoryStore::new().with_note("n", "v1"));
        let registry = SessionRegistry::new(store.clone(), 16, 8);
        let alice = Participant::new("a", "A");
        let (session, _rx) = registry.join("n", alice.clone()).await.unwrap();

        store.save_content("n", "v2").unwrap();
        assert_eq!(session.snapshot().await, ("v2".to_string(), 0));

        session.apply_edit(&alice, &EditOperation::insert(2, "+")).await.unwrap();
        store.save_content("n", "v3").unwrap();
        assert_eq!(session.snapshot().await, ("v2+".to_string(), 1));
    }
}
