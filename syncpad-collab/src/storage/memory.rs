//! In-process note store. Default backend; contents vanish with the process.
//!
//! The operation log only holds edits not yet covered by saved content.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{NoteStore, OperationRecord, StoreError};

#[derive(Debug, Default)]
struct Notes {
    contents: HashMap<String, String>,
    operations: HashMap<String, Vec<OperationRecord>>,
    last_seqs: HashMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    notes: RwLock<Notes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a note, builder style.
    pub fn with_note(self, note_id: impl Into<String>, content: impl Into<String>) -> Self {
        self.write().contents.insert(note_id.into(), content.into());
        self
    }

    pub fn note_count(&self) -> usize {
        self.read().contents.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Notes> {
        self.notes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Notes> {
        self.notes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NoteStore for MemoryStore {
    fn load_content(&self, note_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read().contents.get(note_id).cloned())
    }

    fn save_content(&self, note_id: &str, content: &str) -> Result<(), StoreError> {
        self.write()
            .contents
            .insert(note_id.to_string(), content.to_string());
        Ok(())
    }

    fn append_operation(&self, note_id: &str, record: &OperationRecord) -> Result<(), StoreError> {
        let mut notes = self.write();
        let last = notes.last_seqs.entry(note_id.to_string()).or_default();
        *last = (*last).max(record.seq);
        notes
            .operations
            .entry(note_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn operations(&self, note_id: &str) -> Result<Vec<OperationRecord>, StoreError> {
        Ok(self.read().operations.get(note_id).cloned().unwrap_or_default())
    }

    fn last_seq(&self, note_id: &str) -> Result<u64, StoreError> {
        Ok(self.read().last_seqs.get(note_id).copied().unwrap_or(0))
    }

    fn compact_operations(&self, note_id: &str, up_to_seq: u64) -> Result<(), StoreError> {
        let mut notes = self.write();
        if let Some(log) = notes.operations.get_mut(note_id) {
            log.retain(|r| r.seq > up_to_seq);
            if log.is_empty() {
                notes.operations.remove(note_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::EditOperation;

    #[test]
    fn test_save_and_load() {
        let store = MemoryStore::new();
        assert_eq!(store.load_content("n1").unwrap(), None);
        store.save_content("n1", "hello").unwrap();
        store.save_content("n1", "hello world").unwrap();
        assert_eq!(store.load_content("n1").unwrap().as_deref(), Some("hello world"));
        assert_eq!(store.note_count(), 1);
    }

    #[test]
    fn test_seeded_note() {
        let store = MemoryStore::new().with_note("n1", "seed");
        assert_eq!(store.load_content("n1").unwrap().as_deref(), Some("seed"));
    }

    #[test]
    fn test_operations_keep_append_order_per_note() {
        let store = MemoryStore::new();
        for seq in 1..=3 {
            let record = OperationRecord::new(seq, "u", "U", &EditOperation::insert(0, "x"));
            store.append_operation("a", &record).unwrap();
        }
        store
            .append_operation("b", &OperationRecord::new(1, "u", "U", &EditOperation::delete(0, 1)))
            .unwrap();

        let seqs: Vec<u64> = store.operations("a").unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(store.operations("b").unwrap().len(), 1);
        assert!(store.operations("c").unwrap().is_empty());
    }

    #[test]
    fn test_compaction_drops_saved_edits_and_keeps_seq() {
        let store = MemoryStore::new();
        for seq in 1..=4 {
            let record = OperationRecord::new(seq, "u", "U", &EditOperation::insert(0, "x"));
            store.append_operation("a", &record).unwrap();
        }
        assert_eq!(store.last_seq("a").unwrap(), 4);

        store.compact_operations("a", 3).unwrap();
        let seqs: Vec<u64> = store.operations("a").unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![4]);

        store.compact_operations("a", 4).unwrap();
        assert!(store.operations("a").unwrap().is_empty());
        assert_eq!(store.last_seq("a").unwrap(), 4);
        assert_eq!(store.last_seq("b").unwrap(), 0);
    }
}
