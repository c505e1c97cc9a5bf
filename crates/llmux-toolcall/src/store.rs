use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::Record;

/// Idempotency store keyed by `call_id`.
///
/// `begin` atomically claims the id: the first caller stores the seed record
/// and sees `None`; later callers get the stored record back.
pub trait RecordStore: Send + Sync {
    fn begin(&self, seed: Record) -> Option<Record>;
    fn complete(&self, record: Record);
    fn get(&self, call_id: &str) -> Option<Record>;
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn begin(&self, seed: Record) -> Option<Record> {
        if seed.call_id.is_empty() {
            return None;
        }
        let mut records = self.records.lock().expect("toolcall store lock");
        if let Some(existing) = records.get(&seed.call_id) {
            return Some(existing.clone());
        }
        records.insert(seed.call_id.clone(), seed);
        None
    }

    fn complete(&self, record: Record) {
        if record.call_id.is_empty() {
            return;
        }
        self.records
            .lock()
            .expect("toolcall store lock")
            .insert(record.call_id.clone(), record);
    }

    fn get(&self, call_id: &str) -> Option<Record> {
        if call_id.is_empty() {
            return None;
        }
        self.records
            .lock()
            .expect("toolcall store lock")
            .get(call_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::types::{Envelope, Status};

    fn record(call_id: &str, status: Status) -> Record {
        Record {
            call_id: call_id.to_string(),
            tool_name: "echo".to_string(),
            args_hash: "abc".to_string(),
            status,
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
            error_code: None,
            envelope: Envelope::default(),
        }
    }

    #[test]
    fn begin_claims_once_and_returns_existing() {
        let store = MemoryStore::new();
        assert!(store.begin(record("c1", Status::Started)).is_none());
        let existing = store.begin(record("c1", Status::Started)).expect("duplicate");
        assert_eq!(existing.status, Status::Started);
    }

    #[test]
    fn complete_overwrites_seed() {
        let store = MemoryStore::new();
        store.begin(record("c1", Status::Started));
        store.complete(record("c1", Status::Succeeded));
        assert_eq!(store.get("c1").map(|rec| rec.status), Some(Status::Succeeded));
    }

    #[test]
    fn empty_call_id_is_ignored() {
        let store = MemoryStore::new();
        assert!(store.begin(record("", Status::Started)).is_none());
        assert!(store.get("").is_none());
    }
}
