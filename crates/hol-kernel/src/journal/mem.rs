use std::sync::{Arc, Mutex, PoisonError};

use super::{Journal, JournalEntry, JournalError, JournalSeq, OwnedJournalEntry};

/// In-memory journal for tests and isolated recipe replays.
#[derive(Debug, Default, Clone)]
pub struct MemJournal {
    entries: Arc<Mutex<Vec<OwnedJournalEntry>>>,
}

impl MemJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[OwnedJournalEntry]) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries.to_vec())),
        }
    }

    pub fn entries(&self) -> Vec<OwnedJournalEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Journal for MemJournal {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError> {
        let mut guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = guard.len() as JournalSeq;
        guard.push(OwnedJournalEntry {
            seq,
            kind: entry.kind,
            payload: entry.payload.to_vec(),
        });
        Ok(seq)
    }

    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        Ok(self
            .entries()
            .into_iter()
            .filter(|entry| entry.seq >= from)
            .collect())
    }

    fn next_seq(&self) -> JournalSeq {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len() as JournalSeq
    }
}
