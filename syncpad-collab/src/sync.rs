//! Sync controller: the client-side core of a note session.
//!
//! Bridges local edit intent and remote edit delivery:
//!
//! ```text
//! local buffer change ──► diff(baseline, new, cursor) ──► EditOperation
//!                                                           │
//!                          premium ──► EditSink::send_edit ◄┘
//!                          free    ──► buffered until save()
//!
//! content ──► replace buffer + baseline
//! edit    ──► (premium only) apply to buffer, move baseline
//! error   ──► upgrade prompt or generic failure
//! ```
//!
//! Remote edits are applied last-applied-wins in arrival order. The server
//! stamps each edit with a session sequence number; a gap is logged but the
//! edit is still applied.

use crate::client::ConnectionManager;
use crate::edit::{self, EditOperation};
use crate::events::SessionEvent;
use crate::presence::{PresenceNotice, PresenceTracker};
use crate::protocol::{is_upgrade_prompt, CollabError, RemoteEdit};
use crate::storage::NoteStore;

/// Message for the user produced by an incoming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected,
    Disconnected,
    Presence(PresenceNotice),
    /// A premium-only feature was refused.
    UpgradeRequired { message: String },
    Failure { message: String },
    /// A snapshot replaced a buffer holding unsaved local edits.
    UnsavedChangesDiscarded,
}

/// Outbound side of the controller, normally a [`ConnectionManager`].
pub trait EditSink {
    /// Returns whether the edit was handed to an open connection.
    fn send_edit(&self, op: &EditOperation) -> bool;
    fn send_cursor(&self, position: usize, selection_end: usize) -> bool;
}

impl EditSink for ConnectionManager {
    fn send_edit(&self, op: &EditOperation) -> bool {
        self.send_operation(op)
    }

    fn send_cursor(&self, position: usize, selection_end: usize) -> bool {
        ConnectionManager::send_cursor(self, position, selection_end)
    }
}

/// Explicit save path for buffered content.
pub trait NoteSaver {
    fn save_note(&self, note_id: &str, content: &str) -> Result<(), CollabError>;
}

impl<T: NoteStore + ?Sized> NoteSaver for T {
    fn save_note(&self, note_id: &str, content: &str) -> Result<(), CollabError> {
        Ok(self.save_content(note_id, content)?)
    }
}

/// What happened to a local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    Unchanged,
    /// Sent over the connection.
    Streamed(EditOperation),
    /// Premium, but the connection was not open. Kept locally and marked
    /// dirty so an explicit save still persists it.
    Unsent(EditOperation),
    /// Free tier: kept locally until saved.
    Buffered(EditOperation),
}

pub const WRITE_PERMISSION_MESSAGE: &str = "You do not have write permission";

#[derive(Debug, Clone)]
pub struct SyncController {
    note_id: String,
    premium: bool,
    can_write: bool,
    content: String,
    /// Last known content, the base of the next diff.
    baseline: String,
    dirty: bool,
    presence: PresenceTracker,
    last_seq: Option<u64>,
}

impl SyncController {
    pub fn new(
        note_id: impl Into<String>,
        local_user_id: impl Into<String>,
        premium: bool,
        can_write: bool,
    ) -> Self {
        Self {
            note_id: note_id.into(),
            premium,
            can_write,
            content: String::new(),
            baseline: String::new(),
            dirty: false,
            presence: PresenceTracker::new(local_user_id),
            last_seq: None,
        }
    }

    /// Record a local buffer change and decide whether to stream it.
    ///
    /// `cursor` is the caret position after the change, used to anchor
    /// edits inside repeated text.
    pub fn local_edit<S: EditSink + ?Sized>(
        &mut self,
        new_content: &str,
        cursor: Option<usize>,
        sink: &S,
    ) -> Result<LocalEdit, CollabError> {
        if !self.can_write {
            return Err(CollabError::Permission(WRITE_PERMISSION_MESSAGE.to_string()));
        }
        let Some(op) = edit::diff(&self.baseline, new_content, cursor) else {
            return Ok(LocalEdit::Unchanged);
        };

        self.content = new_content.to_string();
        self.baseline = new_content.to_string();

        if !self.premium {
            self.dirty = true;
            return Ok(LocalEdit::Buffered(op));
        }
        if sink.send_edit(&op) {
            Ok(LocalEdit::Streamed(op))
        } else {
            self.dirty = true;
            Ok(LocalEdit::Unsent(op))
        }
    }

    /// Share the local caret. Free-tier sessions never send cursors.
    pub fn local_cursor<S: EditSink + ?Sized>(
        &self,
        position: usize,
        selection_end: usize,
        sink: &S,
    ) -> bool {
        self.premium && sink.send_cursor(position, selection_end)
    }

    pub fn handle_event(&mut self, event: &SessionEvent) -> Option<Notice> {
        match event {
            SessionEvent::Connected => Some(Notice::Connected),
            SessionEvent::Disconnected => {
                self.presence.clear();
                Some(Notice::Disconnected)
            }
            SessionEvent::Content { content, seq } => self
                .apply_snapshot(content, *seq)
                .then_some(Notice::UnsavedChangesDiscarded),
            SessionEvent::Edit(remote) => {
                self.apply_remote(remote);
                None
            }
            SessionEvent::Error { message, code, .. } => {
                if is_upgrade_prompt(message, code.as_deref()) {
                    Some(Notice::UpgradeRequired { message: message.clone() })
                } else {
                    Some(Notice::Failure { message: message.clone() })
                }
            }
            SessionEvent::Pong => None,
            SessionEvent::Cursor(_)
            | SessionEvent::UserJoined(_)
            | SessionEvent::UserLeft(_)
            | SessionEvent::UserList(_) => self.presence.handle_event(event).map(Notice::Presence),
        }
    }

    /// Replace buffer and baseline wholesale. `seq` is the last edit the
    /// snapshot already contains; relayed edits up to it are skipped.
    ///
    /// Returns true when unsaved local edits were thrown away.
    pub fn apply_snapshot(&mut self, content: &str, seq: Option<u64>) -> bool {
        let discarded = self.dirty && self.content != content;
        if discarded {
            log::warn!(
                "Snapshot of note {} replaced unsaved local changes",
                self.note_id
            );
        }
        log::debug!(
            "Loaded snapshot of note {} at seq {:?} ({} chars)",
            self.note_id,
            seq,
            edit::char_len(content)
        );
        self.content = content.to_string();
        self.baseline = content.to_string();
        self.dirty = false;
        self.last_seq = seq;
        discarded
    }

    /// Apply a relayed edit. Returns false when ignored, either on the free
    /// tier or because the current content already contains it.
    pub fn apply_remote(&mut self, remote: &RemoteEdit) -> bool {
        if !self.premium {
            log::debug!("Ignoring remote edit on free tier");
            return false;
        }

        if let Some(seq) = remote.seq {
            if let Some(last) = self.last_seq {
                if seq <= last {
                    log::debug!(
                        "Skipping edit {} on note {}, already at seq {}",
                        seq,
                        self.note_id,
                        last
                    );
                    return false;
                }
                if seq != last + 1 {
                    log::warn!(
                        "Edit sequence gap on note {}: expected {}, got {}",
                        self.note_id,
                        last + 1,
                        seq
                    );
                }
            }
            self.last_seq = Some(seq);
        }

        let op = remote.to_operation();
        if !op.is_in_bounds(&self.content) {
            log::warn!("Clamping out-of-range {} at {}", op.kind().as_str(), op.position());
        }
        op.apply_to(&mut self.content);
        self.baseline = self.content.clone();
        true
    }

    /// Persist the current buffer through `saver` and clear the dirty flag.
    pub fn save<S: NoteSaver + ?Sized>(&mut self, saver: &S) -> Result<(), CollabError> {
        if !self.can_write {
            return Err(CollabError::Permission(WRITE_PERMISSION_MESSAGE.to_string()));
        }
        saver.save_note(&self.note_id, &self.content)?;
        self.dirty = false;
        log::info!("Saved note {}", self.note_id);
        Ok(())
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    /// Whether the buffer holds changes that only an explicit save persists.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_premium(&self) -> bool {
        self.premium
    }

    pub fn set_premium(&mut self, premium: bool) {
        self.premium = premium;
    }

    pub fn can_write(&self) -> bool {
        self.can_write
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }
}
