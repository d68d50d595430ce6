//! In-memory [`DocumentStore`] for tests and ephemeral sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{DocumentMetadata, DocumentStore, StoreError};

#[derive(Default)]
struct StoredDocument {
    snapshot: Option<Vec<u8>>,
    deltas: BTreeMap<u64, Vec<u8>>,
    meta: Option<DocumentMetadata>,
}

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, StoredDocument>>,
    /// Writes to reject before succeeding again.
    failures: AtomicUsize,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Successful write batches so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn docs(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredDocument>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DocumentStore for MemoryStore {
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.docs().get(doc_id).and_then(|d| d.snapshot.clone()))
    }

    fn save_snapshot(&self, doc_id: &str, snapshot: &[u8], up_to_seq: u64) -> Result<DocumentMetadata, StoreError> {
        self.check_write()?;
        let mut docs = self.docs();
        let doc = docs.entry(doc_id.to_string()).or_default();
        doc.snapshot = Some(snapshot.to_vec());
        doc.deltas.retain(|seq, _| *seq > up_to_seq);

        let meta = doc.meta.get_or_insert_with(|| DocumentMetadata::new(doc_id));
        meta.snapshot_seq = up_to_seq;
        meta.last_seq = meta.last_seq.max(up_to_seq);
        meta.delta_count = doc.deltas.len() as u64;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = snapshot.len() as u64;
        meta.touch();
        Ok(meta.clone())
    }

    fn append_deltas(&self, doc_id: &str, deltas: &[(u64, Vec<u8>)]) -> Result<(), StoreError> {
        if deltas.is_empty() {
            return Ok(());
        }
        self.check_write()?;
        let mut docs = self.docs();
        let doc = docs.entry(doc_id.to_string()).or_default();
        for (seq, delta) in deltas {
            doc.deltas.insert(*seq, delta.clone());
        }
        let meta = doc.meta.get_or_insert_with(|| DocumentMetadata::new(doc_id));
        meta.last_seq = deltas.iter().map(|(seq, _)| *seq).fold(meta.last_seq, u64::max);
        meta.delta_count = doc.deltas.len() as u64;
        meta.touch();
        Ok(())
    }

    fn load_deltas(&self, doc_id: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        Ok(self
            .docs()
            .get(doc_id)
            .map(|d| d.deltas.iter().map(|(seq, delta)| (*seq, delta.clone())).collect())
            .unwrap_or_default())
    }

    fn metadata(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        Ok(self.docs().get(doc_id).and_then(|d| d.meta.clone()))
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.docs().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.docs().remove(doc_id);
        Ok(())
    }
}
