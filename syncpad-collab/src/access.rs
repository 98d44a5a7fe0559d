//! Identity and permission collaborator consulted by the session server.
//!
//! The server asks two questions: who does a bearer token belong to, and
//! what may a user do with a note. Real deployments answer them from an
//! identity provider and a subscription service; the policies here cover
//! development servers and tests.

use std::collections::{HashMap, HashSet};

/// A resolved user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), username: username.into() }
    }
}

/// What a user may do in a note session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    /// Real-time edit and cursor streaming.
    pub premium: bool,
}

impl Access {
    pub const DENIED: Access = Access { read: false, write: false, premium: false };

    pub fn read_only(premium: bool) -> Self {
        Self { read: true, write: false, premium }
    }

    pub fn read_write(premium: bool) -> Self {
        Self { read: true, write: true, premium }
    }
}

pub trait AccessPolicy: Send + Sync {
    /// Resolve a bearer token. `None` means the token is unknown.
    fn resolve_token(&self, token: &str) -> Option<Identity>;

    fn access(&self, note_id: &str, user_id: &str) -> Access;
}

/// Everyone may read and write every note.
#[derive(Debug, Clone, Copy)]
pub struct OpenAccess {
    premium: bool,
}

impl OpenAccess {
    pub fn premium() -> Self {
        Self { premium: true }
    }

    pub fn free() -> Self {
        Self { premium: false }
    }
}

impl AccessPolicy for OpenAccess {
    fn resolve_token(&self, _token: &str) -> Option<Identity> {
        None
    }

    fn access(&self, _note_id: &str, _user_id: &str) -> Access {
        Access::read_write(self.premium)
    }
}

/// Fixed tables of tokens, premium users, read-only users and private notes.
///
/// ```
/// use syncpad_collab::access::{AccessPolicy, StaticAccess};
///
/// let policy = StaticAccess::new()
///     .premium_user("ann")
///     .read_only_user("bo")
///     .private_note("secret", ["ann"]);
///
/// assert!(policy.access("n1", "ann").premium);
/// assert!(!policy.access("n1", "bo").write);
/// assert!(!policy.access("secret", "bo").read);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticAccess {
    tokens: HashMap<String, Identity>,
    /// Every user is premium, not just the listed ones.
    all_premium: bool,
    premium_users: HashSet<String>,
    read_only_users: HashSet<String>,
    private_notes: HashMap<String, HashSet<String>>,
}

impl StaticAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    /// Grant the premium tier to everyone. Read-only and private-note
    /// restrictions still apply.
    pub fn all_premium(mut self, all_premium: bool) -> Self {
        self.all_premium = all_premium;
        self
    }

    pub fn premium_user(mut self, user_id: impl Into<String>) -> Self {
        self.premium_users.insert(user_id.into());
        self
    }

    pub fn premium_users<I, S>(mut self, user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.premium_users.extend(user_ids.into_iter().map(Into::into));
        self
    }

    pub fn read_only_user(mut self, user_id: impl Into<String>) -> Self {
        self.read_only_users.insert(user_id.into());
        self
    }

    /// Restrict `note_id` to the listed users.
    pub fn private_note<I, S>(mut self, note_id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.private_notes
            .insert(note_id.into(), members.into_iter().map(Into::into).collect());
        self
    }
}

impl AccessPolicy for StaticAccess {
    fn resolve_token(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }

    fn access(&self, note_id: &str, user_id: &str) -> Access {
        if let Some(members) = self.private_notes.get(note_id) {
            if !members.contains(user_id) {
                return Access::DENIED;
            }
        }
        let premium = self.all_premium || self.premium_users.contains(user_id);
        if self.read_only_users.contains(user_id) {
            Access::read_only(premium)
        } else {
            Access::read_write(premium)
        }
    }
}
