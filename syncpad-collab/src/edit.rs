//! Positional edit operations over a plain text buffer.
//!
//! Offsets count Unicode scalar values (`char`s), never bytes, so an
//! operation produced against one buffer means the same thing to every
//! recipient regardless of encoding.
//!
//! ```text
//! insert(p, t)     buffer[..p] + t + buffer[p..]
//! delete(p, n)     buffer[..p] + buffer[p+n..]
//! replace(p, t, n) buffer[..p] + t + buffer[p+n..]
//! ```
//!
//! Application is last-applied-wins on raw offsets: there is no version
//! vector and no rebasing, so every recipient must apply operations in the
//! order the session owner received them. Out-of-range offsets are clamped
//! into the buffer instead of faulting.

use serde::{Deserialize, Serialize};

/// The three operation kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
}

impl EditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditKind::Insert => "insert",
            EditKind::Delete => "delete",
            EditKind::Replace => "replace",
        }
    }
}

/// A single positional edit against the *previous* content of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOperation {
    Insert { position: usize, content: String },
    Delete { position: usize, length: usize },
    Replace { position: usize, content: String, length: usize },
}

impl EditOperation {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self::Insert { position, content: content.into() }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self::Delete { position, length }
    }

    pub fn replace(position: usize, content: impl Into<String>, length: usize) -> Self {
        Self::Replace { position, content: content.into(), length }
    }

    /// Build an operation from loose wire parts. Missing text reads as empty
    /// and a missing length reads as zero.
    pub fn from_parts(
        kind: EditKind,
        position: usize,
        content: Option<String>,
        length: Option<usize>,
    ) -> Self {
        match kind {
            EditKind::Insert => Self::insert(position, content.unwrap_or_default()),
            EditKind::Delete => Self::delete(position, length.unwrap_or(0)),
            EditKind::Replace => {
                Self::replace(position, content.unwrap_or_default(), length.unwrap_or(0))
            }
        }
    }

    pub fn kind(&self) -> EditKind {
        match self {
            Self::Insert { .. } => EditKind::Insert,
            Self::Delete { .. } => EditKind::Delete,
            Self::Replace { .. } => EditKind::Replace,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Self::Insert { position, .. }
            | Self::Delete { position, .. }
            | Self::Replace { position, .. } => *position,
        }
    }

    /// Inserted text, present for insert and replace.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Insert { content, .. } | Self::Replace { content, .. } => Some(content),
            Self::Delete { .. } => None,
        }
    }

    /// Removed span length, present for delete and replace.
    pub fn length(&self) -> Option<usize> {
        match self {
            Self::Delete { length, .. } | Self::Replace { length, .. } => Some(*length),
            Self::Insert { .. } => None,
        }
    }

    /// Whether `position + length` stays inside `buffer`.
    pub fn is_in_bounds(&self, buffer: &str) -> bool {
        let len = char_len(buffer);
        self.position()
            .checked_add(self.length().unwrap_or(0))
            .is_some_and(|end| end <= len)
    }

    /// The same operation with its offsets clamped into `buffer`.
    pub fn clamped(&self, buffer: &str) -> Self {
        let len = char_len(buffer);
        let position = self.position().min(len);
        let available = len - position;
        match self {
            Self::Insert { content, .. } => Self::insert(position, content.clone()),
            Self::Delete { length, .. } => Self::delete(position, (*length).min(available)),
            Self::Replace { content, length, .. } => {
                Self::replace(position, content.clone(), (*length).min(available))
            }
        }
    }

    /// Apply to `buffer`, returning the new content.
    pub fn apply(&self, buffer: &str) -> String {
        let (removed, inserted) = match self {
            Self::Insert { content, .. } => (0, content.as_str()),
            Self::Delete { length, .. } => (*length, ""),
            Self::Replace { content, length, .. } => (*length, content.as_str()),
        };
        splice(buffer, self.position(), removed, inserted)
    }

    /// Apply to `buffer` in place.
    pub fn apply_to(&self, buffer: &mut String) {
        *buffer = self.apply(buffer);
    }
}

/// Number of chars in `s`.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte index of char offset `pos`, clamped to the end of `s`.
fn byte_index(s: &str, pos: usize) -> usize {
    s.char_indices().nth(pos).map_or(s.len(), |(i, _)| i)
}

fn splice(buffer: &str, position: usize, removed: usize, inserted: &str) -> String {
    let len = char_len(buffer);
    let start = position.min(len);
    let end = start.saturating_add(removed).min(len);
    let start_byte = byte_index(buffer, start);
    let end_byte = byte_index(buffer, end);

    let mut out = String::with_capacity(buffer.len() - (end_byte - start_byte) + inserted.len());
    out.push_str(&buffer[..start_byte]);
    out.push_str(inserted);
    out.push_str(&buffer[end_byte..]);
    out
}

/// Compute the single operation that turns `old` into `new`.
///
/// Assumes one contiguous change between the two observations; disjoint
/// edits collapse into one replace spanning all of them.
///
/// Tie-break rules:
/// 1. The changed span is the shortest possible (longest common prefix and
///    suffix).
/// 2. When that span can sit at several anchors (edits inside a run of
///    repeated text), the anchor implied by `cursor` wins if it is one of
///    them. `cursor` is the caret after the edit, so the implied anchor is
///    `cursor - inserted_len`.
/// 3. Otherwise the earliest anchor wins.
///
/// The kind follows the span shape: nothing removed is an insert, nothing
/// inserted is a delete, anything else is a replace. Returns `None` when the
/// buffers are equal.
pub fn diff(old: &str, new: &str, cursor: Option<usize>) -> Option<EditOperation> {
    if old == new {
        return None;
    }

    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix_free = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let suffix = suffix_free.min(a.len().min(b.len()) - prefix);

    let removed = a.len() - prefix - suffix;
    let inserted = b.len() - prefix - suffix;

    // Any anchor in [earliest, prefix] reproduces `new` with the same span.
    let earliest = (a.len() - removed).saturating_sub(suffix_free);
    let anchor = cursor
        .and_then(|c| c.checked_sub(inserted))
        .filter(|c| (earliest..=prefix).contains(c))
        .unwrap_or(earliest);

    let text: String = b[anchor..anchor + inserted].iter().collect();
    Some(match (removed, inserted) {
        (0, _) => EditOperation::insert(anchor, text),
        (_, 0) => EditOperation::delete(anchor, removed),
        _ => EditOperation::replace(anchor, text, removed),
    })
}
