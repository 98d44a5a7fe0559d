//! Editor session: one owned connection driving one sync controller.
//!
//! The session is what an editor view holds for as long as a note is open.
//! Creating it connects, dropping it disconnects. Inbound events are
//! consumed one at a time on the caller's task, so local and remote edits
//! never touch the buffer concurrently.

use tokio::sync::mpsc;

use crate::client::{ClientConfig, ConnectionManager, ConnectionState, SessionTarget};
use crate::events::{SessionEvent, Subscription};
use crate::protocol::CollabError;
use crate::sync::{LocalEdit, NoteSaver, Notice, SyncController};

/// One processed inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub event: SessionEvent,
    pub notice: Option<Notice>,
}

pub struct EditorSession {
    connection: ConnectionManager,
    controller: SyncController,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    subscription: Subscription,
}

impl EditorSession {
    /// Connect to `target`. Must be called from within a Tokio runtime.
    pub fn open(
        config: ClientConfig,
        target: SessionTarget,
        premium: bool,
        can_write: bool,
    ) -> Result<Self, CollabError> {
        let mut connection = ConnectionManager::new(config);
        let (subscription, events) = connection.subscribe();
        let controller =
            SyncController::new(target.note_id.clone(), target.user_id.clone(), premium, can_write);
        connection.connect(target)?;
        Ok(Self { connection, controller, events, subscription })
    }

    /// Wait for the next inbound event and apply it.
    ///
    /// Returns `None` only if the event channel is gone.
    pub async fn next_update(&mut self) -> Option<Update> {
        let event = self.events.recv().await?;
        Some(self.process(event))
    }

    /// Apply every event that is already queued, without waiting.
    pub fn pump(&mut self) -> Vec<Update> {
        let mut updates = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            updates.push(self.process(event));
        }
        updates
    }

    fn process(&mut self, event: SessionEvent) -> Update {
        let notice = self.controller.handle_event(&event);
        if let Some(Notice::UpgradeRequired { message } | Notice::Failure { message }) = &notice {
            log::warn!("Note {}: {}", self.controller.note_id(), message);
        }
        Update { event, notice }
    }

    /// Leave the current note and join another with fresh state.
    pub fn switch_to(
        &mut self,
        target: SessionTarget,
        premium: bool,
        can_write: bool,
    ) -> Result<(), CollabError> {
        self.connection.disconnect();
        while self.events.try_recv().is_ok() {}
        self.controller =
            SyncController::new(target.note_id.clone(), target.user_id.clone(), premium, can_write);
        self.connection.connect(target)
    }

    pub fn edit(&mut self, new_content: &str, cursor: Option<usize>) -> Result<LocalEdit, CollabError> {
        self.controller.local_edit(new_content, cursor, &self.connection)
    }

    pub fn cursor(&self, position: usize, selection_end: usize) -> bool {
        self.controller.local_cursor(position, selection_end, &self.connection)
    }

    pub fn save<S: NoteSaver + ?Sized>(&mut self, saver: &S) -> Result<(), CollabError> {
        self.controller.save(saver)
    }

    pub fn content(&self) -> &str {
        self.controller.content()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn controller(&self) -> &SyncController {
        &self.controller
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Disconnect and drop the event subscription.
    pub fn close(mut self) {
        self.connection.disconnect();
        self.connection.off(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_with_bad_url_fails() {
        let result = EditorSession::open(
            ClientConfig::new("nonsense"),
            SessionTarget::new("n", "u", "U"),
            true,
            true,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_switch_discards_queued_events() {
        let config = ClientConfig {
            max_reconnect_attempts: 0,
            ..ClientConfig::new("ws://127.0.0.1:9")
        };
        let mut session =
            EditorSession::open(config, SessionTarget::new("a", "u", "U"), true, true).unwrap();
        session.switch_to(SessionTarget::new("b", "u", "U"), false, true).unwrap();
        assert_eq!(session.controller().note_id(), "b");
        assert!(!session.controller().is_premium());
        session.close();
    }
}
