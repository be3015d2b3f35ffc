use crate::cache::CacheStore;
use crate::clock::ManualClock;
use crate::invalidator::ExpiryPolicy;
use crate::models::MessageRecord;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

pub fn message(
    id: &str,
    folder: &str,
    subject: &str,
    sender: &str,
    ts: DateTime<Utc>,
) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        folder: folder.to_string(),
        subject: subject.to_string(),
        sender: sender.to_string(),
        recipients: vec!["me@x.com".to_string()],
        timestamp: ts,
        thread_id: id.to_string(),
        provider_thread_id: None,
        references: Vec::new(),
        preview: format!("body of {}", id),
        importance: None,
        labels: BTreeSet::new(),
        category: None,
        response_time: None,
        first_seen: ts,
        last_updated: ts,
    }
}

pub fn open_store() -> (tempfile::TempDir, Arc<ManualClock>, CacheStore) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::fixed());
    let store = CacheStore::open(
        &dir.path().join("store.redb"),
        ExpiryPolicy::default(),
        clock.clone(),
    )
    .unwrap();
    (dir, clock, store)
}
