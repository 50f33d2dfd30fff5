//! Recognizing our own writes when the watcher reports them.
//!
//! Every successful write records the digest of the bytes it put on disk.
//! When the watcher later reports that collection, the file is hashed again:
//! if it still holds exactly what we wrote, the event is our own echo.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use schema::Collection;

use crate::files::WriteReceipt;

/// Last write made by this process to one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoEntry {
    /// Monotonic write counter across all collections.
    pub generation: u64,
    /// Digest of the bytes written.
    pub digest: String,
}

/// Per-collection record of our latest writes.
#[derive(Debug, Default)]
pub struct EchoLedger {
    inner: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    next_generation: u64,
    entries: HashMap<Collection, EchoEntry>,
}

impl EchoLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a write. Returns its generation.
    pub fn record(&self, collection: Collection, receipt: &WriteReceipt) -> u64 {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_generation += 1;
        let generation = state.next_generation;
        state.entries.insert(
            collection,
            EchoEntry {
                generation,
                digest: receipt.digest.clone(),
            },
        );
        generation
    }

    /// Whether a file whose content hashes to `digest` is our latest write.
    pub fn is_echo(&self, collection: Collection, digest: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(&collection)
            .is_some_and(|entry| entry.digest == digest)
    }

    /// Latest write to `collection`, if any.
    pub fn last(&self, collection: Collection) -> Option<EchoEntry> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(&collection)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::digest;
    use std::path::PathBuf;

    fn receipt(content: &[u8]) -> WriteReceipt {
        WriteReceipt {
            path: PathBuf::from("contacts.json"),
            bytes: content.len() as u64,
            digest: digest(content),
        }
    }

    #[test]
    fn test_own_write_is_echo() {
        let ledger = EchoLedger::new();
        ledger.record(Collection::Contacts, &receipt(b"[]"));

        assert!(ledger.is_echo(Collection::Contacts, &digest(b"[]")));
        assert!(!ledger.is_echo(Collection::Contacts, &digest(b"[1]")));
        assert!(!ledger.is_echo(Collection::Servers, &digest(b"[]")));
    }

    #[test]
    fn test_only_latest_write_counts() {
        let ledger = EchoLedger::new();
        let first = ledger.record(Collection::Groups, &receipt(b"{}"));
        let second = ledger.record(Collection::Groups, &receipt(b"{\"a\":[]}"));

        assert!(second > first);
        assert!(!ledger.is_echo(Collection::Groups, &digest(b"{}")));
        assert_eq!(ledger.last(Collection::Groups).unwrap().generation, second);
    }
}
