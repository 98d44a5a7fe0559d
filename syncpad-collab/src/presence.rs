//! Presence tracking for a note session.
//!
//! Keeps the locally known participant list and the last reported cursor of
//! each remote user. The tracker is a cache of the session's view: it never
//! pushes state to the server, it only reacts to `user_joined`, `user_left`,
//! `user_list` and `cursor` messages.
//!
//! ```text
//! user_list   ──► replace wholesale ──► "N user(s) already in this session"
//! user_joined ──► append if new     ──► "<name> joined"
//! user_left   ──► drop every entry with that user_id
//! ```

use std::collections::HashMap;

use crate::events::SessionEvent;
use crate::protocol::{ParticipantInfo, RemoteCursor};

// ───────────────────────────────────────────────────────────────────
// Types
// ───────────────────────────────────────────────────────────────────

/// Caret and selection end of a remote user, in char offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    pub position: usize,
    pub selection_end: usize,
}

impl CursorPosition {
    pub fn has_selection(&self) -> bool {
        self.position != self.selection_end
    }
}

/// User-facing notification produced by a presence change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceNotice {
    Joined { username: String },
    Left { username: String },
    /// Other participants were already present when we joined.
    AlreadyPresent { count: usize },
}

impl PresenceNotice {
    pub fn message(&self) -> String {
        match self {
            PresenceNotice::Joined { username } => format!("{username} joined"),
            PresenceNotice::Left { username } => format!("{username} left"),
            PresenceNotice::AlreadyPresent { count } => {
                format!("{count} user(s) already in this session")
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_user_id: String,
    participants: Vec<ParticipantInfo>,
    cursors: HashMap<String, CursorPosition>,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            participants: Vec::new(),
            cursors: HashMap::new(),
        }
    }

    pub fn handle_joined(&mut self, info: ParticipantInfo) -> Option<PresenceNotice> {
        if self.contains(&info.user_id) {
            return None;
        }
        log::debug!("Participant joined: {} ({})", info.username, info.user_id);
        let username = info.username.clone();
        self.participants.push(info);
        Some(PresenceNotice::Joined { username })
    }

    /// Remove every participant with `info.user_id`, plus their cursor.
    pub fn handle_left(&mut self, info: &ParticipantInfo) -> Option<PresenceNotice> {
        let before = self.participants.len();
        self.participants.retain(|p| p.user_id != info.user_id);
        self.cursors.remove(&info.user_id);
        if self.participants.len() == before {
            return None;
        }
        log::debug!("Participant left: {} ({})", info.username, info.user_id);
        Some(PresenceNotice::Left { username: info.username.clone() })
    }

    /// Replace the list wholesale. Reports the other users once, if any.
    pub fn handle_list(&mut self, users: Vec<ParticipantInfo>) -> Option<PresenceNotice> {
        self.participants = users;
        self.cursors.retain(|user_id, _| {
            self.participants.iter().any(|p| &p.user_id == user_id)
        });
        let count = self.others().count();
        (count > 0).then_some(PresenceNotice::AlreadyPresent { count })
    }

    pub fn handle_cursor(&mut self, cursor: &RemoteCursor) {
        if cursor.user_id.is_empty() || cursor.user_id == self.local_user_id {
            return;
        }
        self.cursors.insert(
            cursor.user_id.clone(),
            CursorPosition {
                position: cursor.position,
                selection_end: cursor.selection_end,
            },
        );
    }

    /// Feed any session event; non-presence events are ignored.
    pub fn handle_event(&mut self, event: &SessionEvent) -> Option<PresenceNotice> {
        match event {
            SessionEvent::UserJoined(info) => self.handle_joined(info.clone()),
            SessionEvent::UserLeft(info) => self.handle_left(info),
            SessionEvent::UserList(users) => self.handle_list(users.clone()),
            SessionEvent::Cursor(cursor) => {
                self.handle_cursor(cursor);
                None
            }
            _ => None,
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    /// Participants other than the local user.
    pub fn others(&self) -> impl Iterator<Item = &ParticipantInfo> {
        self.participants
            .iter()
            .filter(move |p| p.user_id != self.local_user_id)
    }

    pub fn cursor(&self, user_id: &str) -> Option<CursorPosition> {
        self.cursors.get(user_id).copied()
    }

    pub fn cursors(&self) -> &HashMap<String, CursorPosition> {
        &self.cursors
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> ParticipantInfo {
        ParticipantInfo::new(id, id.to_uppercase())
    }

    #[test]
    fn test_join_join_leave_converges() {
        let mut tracker = PresenceTracker::new("me");
        tracker.handle_joined(user("a"));
        tracker.handle_joined(user("b"));
        tracker.handle_left(&user("a"));
        assert_eq!(tracker.participants(), &[user("b")]);
    }

    #[test]
    fn test_duplicate_join_is_ignored() {
        let mut tracker = PresenceTracker::new("me");
        assert_eq!(
            tracker.handle_joined(user("a")),
            Some(PresenceNotice::Joined { username: "A".into() })
        );
        assert_eq!(tracker.handle_joined(user("a")), None);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_leave_removes_all_entries_for_user() {
        let mut tracker = PresenceTracker::new("me");
        tracker.handle_list(vec![user("a"), user("b"), user("a")]);
        assert_eq!(tracker.len(), 3);
        let notice = tracker.handle_left(&user("a"));
        assert_eq!(notice, Some(PresenceNotice::Left { username: "A".into() }));
        assert_eq!(tracker.participants(), &[user("b")]);
        assert_eq!(tracker.handle_left(&user("zz")), None);
    }

    #[test]
    fn test_list_replaces_and_counts_others() {
        let mut tracker = PresenceTracker::new("me");
        tracker.handle_joined(user("stale"));
        let notice = tracker.handle_list(vec![user("me"), user("a"), user("b")]);
        assert_eq!(notice, Some(PresenceNotice::AlreadyPresent { count: 2 }));
        assert!(!tracker.contains("stale"));
        assert_eq!(
            notice.unwrap().message(),
            "2 user(s) already in this session"
        );
    }

    #[test]
    fn test_list_with_only_self_is_silent() {
        let mut tracker = PresenceTracker::new("me");
        assert_eq!(tracker.handle_list(vec![user("me")]), None);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_cursor_cache() {
        let mut tracker = PresenceTracker::new("me");
        tracker.handle_joined(user("a"));
        tracker.handle_cursor(&RemoteCursor {
            user_id: "a".into(),
            username: "A".into(),
            position: 2,
            selection_end: 5,
        });
        tracker.handle_cursor(&RemoteCursor {
            user_id: "me".into(),
            username: "ME".into(),
            position: 0,
            selection_end: 0,
        });

        let cursor = tracker.cursor("a").unwrap();
        assert!(cursor.has_selection());
        assert_eq!(cursor.position, 2);
        assert!(tracker.cursor("me").is_none());

        tracker.handle_left(&user("a"));
        assert!(tracker.cursor("a").is_none());
    }

    #[test]
    fn test_handle_event_routes_presence() {
        let mut tracker = PresenceTracker::new("me");
        let notice = tracker.handle_event(&SessionEvent::UserJoined(user("a")));
        assert!(matches!(notice, Some(PresenceNotice::Joined { .. })));
        assert_eq!(tracker.handle_event(&SessionEvent::Pong), None);
        assert_eq!(tracker.others().count(), 1);
    }
}
