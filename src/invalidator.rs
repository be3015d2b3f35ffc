use crate::cache::{CacheStore, META_ANALYSIS_FINGERPRINT};
use crate::config::{AnalysisConfig, CacheConfig};
use crate::error::StoreError;
use crate::models::{MessageRecord, SmartFolderRecord, ThreadRecord};
use crate::priority::WEIGHTS;
use crate::threads::ThreadGraphBuilder;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Time-based expiry. An expired row is hidden from default queries and
/// removed by the next sweep.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    pub message_ttl: Duration,
    pub thread_ttl: Duration,
    pub smart_folder_ttl: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        ExpiryPolicy {
            message_ttl: Duration::hours(24),
            thread_ttl: Duration::hours(12),
            smart_folder_ttl: Duration::hours(48),
        }
    }
}

impl ExpiryPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        ExpiryPolicy {
            message_ttl: config.message_ttl,
            thread_ttl: config.thread_ttl,
            smart_folder_ttl: config.smart_folder_ttl,
        }
    }

    pub fn message_expired(&self, msg: &MessageRecord, now: DateTime<Utc>) -> bool {
        now - msg.last_updated > self.message_ttl
    }

    /// Measured from the record's last recomputation (`updated_at`), not from
    /// `last_activity`: a thread of week-old mail recomputed an hour ago is
    /// live. Recomputation happens whenever a member changes, and an expired
    /// record is rebuilt from its members on `get_thread`.
    pub fn thread_expired(&self, thread: &ThreadRecord, now: DateTime<Utc>) -> bool {
        now - thread.updated_at > self.thread_ttl
    }

    pub fn smart_folder_expired(&self, folder: &SmartFolderRecord, now: DateTime<Utc>) -> bool {
        now - folder.touched_at() > self.smart_folder_ttl
    }
}

/// Hash of every tunable that feeds scores and categories.
pub fn analysis_fingerprint(config: &AnalysisConfig) -> String {
    let canonical = format!(
        "v1|sender={}|domain={}|history={}|half_life={}|active={}|dup={}|threads={}|priority={}|owners={}|weights={:?}",
        config.sender_threshold,
        config.domain_threshold,
        config.history_window.num_seconds(),
        config.recency_half_life_hours,
        config.active_window.num_seconds(),
        config.duplicate_window.num_seconds(),
        config.thread_analysis,
        config.priority_scoring,
        config.owner_addresses.join(","),
        WEIGHTS,
    );
    Sha256::digest(canonical.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub messages: usize,
    pub threads: usize,
    pub smart_folders: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.messages + self.threads + self.smart_folders
    }
}

pub struct Invalidator {
    store: Arc<CacheStore>,
    threads: Arc<ThreadGraphBuilder>,
}

impl Invalidator {
    pub fn new(store: Arc<CacheStore>, threads: Arc<ThreadGraphBuilder>) -> Self {
        Invalidator { store, threads }
    }

    /// Physically remove every expired row. Threads that lost members are
    /// recomputed in the same transaction.
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        let report = self.store.write(|txn| {
            let now = txn.now();
            let policy = *txn.expiry();
            let mut report = SweepReport::default();

            let expired: Vec<String> = txn
                .all_messages()?
                .into_iter()
                .filter(|m| policy.message_expired(m, now))
                .map(|m| m.id)
                .collect();
            let removed = txn.delete_messages(&expired)?;
            report.messages = removed.len();

            for thread in txn.all_threads()? {
                if policy.thread_expired(&thread, now) && txn.delete_thread(&thread.thread_id)? {
                    report.threads += 1;
                }
            }
            for folder in txn.all_smart_folders()? {
                if policy.smart_folder_expired(&folder, now) && txn.delete_smart_folder(&folder.name)? {
                    report.smart_folders += 1;
                }
            }

            if !removed.is_empty() {
                let touched: BTreeSet<String> =
                    removed.into_iter().map(|m| m.thread_id).collect();
                self.threads.rebuild(txn, &BTreeSet::new(), &touched)?;
            }
            Ok::<_, StoreError>(report)
        })?;
        if report.total() > 0 {
            info!(
                "[Invalidator] sweep removed {} messages, {} threads, {} smart folders",
                report.messages, report.threads, report.smart_folders
            );
        }
        Ok(report)
    }

    /// Folder renamed or deleted upstream: drop everything cached for it.
    pub fn purge_folder(&self, folder: &str) -> Result<usize, StoreError> {
        let removed = self.store.write(|txn| {
            let ids: Vec<String> = txn
                .all_messages()?
                .into_iter()
                .filter(|m| m.folder == folder)
                .map(|m| m.id)
                .collect();
            let removed = txn.delete_messages(&ids)?;
            txn.delete_processing_state(folder)?;
            let touched: BTreeSet<String> = removed.iter().map(|m| m.thread_id.clone()).collect();
            self.threads.rebuild(txn, &BTreeSet::new(), &touched)?;
            Ok::<_, StoreError>(removed.len())
        })?;
        info!("[Invalidator] purged folder '{}' ({} messages)", folder, removed);
        Ok(removed)
    }

    /// Analysis parameters changed: clear score and category so they are
    /// recomputed on next read. Base metadata is left alone. `None` means
    /// every message.
    pub fn invalidate_analysis(&self, ids: Option<&[String]>) -> Result<usize, StoreError> {
        let cleared = self.store.write(|txn| {
            let targets = match ids {
                Some(ids) => {
                    let mut found = Vec::with_capacity(ids.len());
                    for id in ids {
                        if let Some(m) = txn.get_message(id)? {
                            found.push(m);
                        }
                    }
                    found
                }
                None => txn.all_messages()?,
            };
            let mut cleared = 0;
            for mut msg in targets {
                if msg.importance.is_some() || msg.category.is_some() {
                    msg.importance = None;
                    msg.category = None;
                    txn.put_message(&msg)?;
                    cleared += 1;
                }
            }
            Ok::<_, StoreError>(cleared)
        })?;
        if cleared > 0 {
            self.store.mark_derived_stale();
        }
        info!("[Invalidator] cleared analysis fields on {} messages", cleared);
        Ok(cleared)
    }

    /// Compare the stored parameter fingerprint with `config`. On mismatch
    /// invalidate every message and store the new fingerprint. Returns
    /// whether invalidation happened.
    pub fn check_analysis_fingerprint(&self, config: &AnalysisConfig) -> Result<bool, StoreError> {
        let current = analysis_fingerprint(config);
        let stored = self.store.get_meta(META_ANALYSIS_FINGERPRINT)?;
        if stored.as_deref() == Some(current.as_str()) {
            return Ok(false);
        }
        let changed = stored.is_some() || self.store.message_count()? > 0;
        if changed {
            info!("[Invalidator] analysis parameters changed; invalidating scores and categories");
            self.invalidate_analysis(None)?;
        }
        self.store.set_meta(META_ANALYSIS_FINGERPRINT, &current)?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProcessingState, RuleDef};
    use crate::testutil::{message, open_store};

    fn invalidator(store: CacheStore) -> (Arc<CacheStore>, Invalidator) {
        let store = Arc::new(store);
        let threads = Arc::new(ThreadGraphBuilder::new(&AnalysisConfig::default()));
        (store.clone(), Invalidator::new(store, threads))
    }

    #[test]
    fn test_sweep_removes_expired_rows_only() {
        let (_dir, clock, store) = open_store();
        let (store, inv) = invalidator(store);
        let t = clock.now();
        store
            .write(|txn| {
                txn.upsert_message(message("old", "INBOX", "Old", "a@x.com", t))?;
                txn.put_smart_folder(&SmartFolderRecord {
                    name: "stale".into(),
                    description: String::new(),
                    rules: vec![RuleDef {
                        field: "from".into(),
                        operator: "contains".into(),
                        value: "x".into(),
                    }],
                    priority: 0,
                    created_at: t,
                    last_applied: None,
                    match_count: 0,
                    active: true,
                })
            })
            .unwrap();
        store
            .write(|txn| inv.threads.rebuild_all(txn))
            .unwrap();

        clock.advance(Duration::hours(20));
        store
            .write(|txn| txn.upsert_message(message("fresh", "INBOX", "Fresh", "b@x.com", t)))
            .unwrap();

        clock.advance(Duration::hours(5));
        let report = inv.sweep().unwrap();
        assert_eq!(report.messages, 1);
        assert_eq!(report.threads, 1);
        assert_eq!(report.smart_folders, 0);
        assert!(store.get_message("old").unwrap().is_none());
        assert!(store.get_message("fresh").unwrap().is_some());
        assert!(store.get_thread("old").unwrap().is_none());

        clock.advance(Duration::hours(24));
        let report = inv.sweep().unwrap();
        assert_eq!(report.smart_folders, 1);

        // Idempotent.
        let report = inv.sweep().unwrap();
        assert_eq!(report.total(), 0);
    }

    #[test]
    fn test_thread_expiry_counts_from_recomputation() {
        let (_dir, clock, store) = open_store();
        let (store, inv) = invalidator(store);
        let policy = ExpiryPolicy::default();
        let sent = clock.now() - Duration::days(3);
        store
            .write(|txn| {
                txn.upsert_message(message("m1", "INBOX", "Old news", "a@x.com", sent))?;
                inv.threads.rebuild_all(txn)
            })
            .unwrap();
        let thread = store.get_thread("m1").unwrap().unwrap();
        assert_eq!(thread.last_activity, sent);
        assert!(!policy.thread_expired(&thread, clock.now()));

        clock.advance(Duration::hours(13));
        assert!(policy.thread_expired(&thread, clock.now()));

        store.write(|txn| inv.threads.rebuild_all(txn)).unwrap();
        let thread = store.get_thread("m1").unwrap().unwrap();
        assert!(!policy.thread_expired(&thread, clock.now()));
    }

    #[test]
    fn test_purge_folder_drops_rows_and_cursor() {
        let (_dir, clock, store) = open_store();
        let (store, inv) = invalidator(store);
        let t = clock.now();
        store
            .write(|txn| {
                txn.upsert_message(message("a", "Old", "s", "a@x.com", t))?;
                txn.upsert_message(message("b", "INBOX", "t", "a@x.com", t))?;
                txn.set_processing_state(&ProcessingState {
                    folder: "Old".into(),
                    last_success: true,
                    ..Default::default()
                })
            })
            .unwrap();
        assert_eq!(inv.purge_folder("Old").unwrap(), 1);
        assert!(store.get_message("a").unwrap().is_none());
        assert!(store.get_message("b").unwrap().is_some());
        assert!(store.get_processing_state("Old").unwrap().is_none());
        assert_eq!(inv.purge_folder("Old").unwrap(), 0);
    }

    #[test]
    fn test_invalidate_analysis_keeps_base_metadata() {
        let (_dir, clock, store) = open_store();
        let (store, inv) = invalidator(store);
        let t = clock.now();
        let mut m = message("a", "INBOX", "Subject", "a@x.com", t);
        m.importance = Some(0.7);
        m.category = Some("business".into());
        store.write(|txn| txn.upsert_message(m)).unwrap();

        assert_eq!(inv.invalidate_analysis(None).unwrap(), 1);
        let rec = store.get_message("a").unwrap().unwrap();
        assert_eq!(rec.importance, None);
        assert_eq!(rec.category, None);
        assert_eq!(rec.subject, "Subject");
        assert_eq!(rec.last_updated, t);
        assert!(store.take_derived_stale());
        assert_eq!(inv.invalidate_analysis(None).unwrap(), 0);
    }

    #[test]
    fn test_fingerprint_change_triggers_invalidation() {
        let (_dir, clock, store) = open_store();
        let (store, inv) = invalidator(store);
        let config = AnalysisConfig::default();
        assert!(!inv.check_analysis_fingerprint(&config).unwrap());

        let mut m = message("a", "INBOX", "s", "a@x.com", clock.now());
        m.importance = Some(0.4);
        store.write(|txn| txn.upsert_message(m)).unwrap();
        assert!(!inv.check_analysis_fingerprint(&config).unwrap());
        assert_eq!(store.get_message("a").unwrap().unwrap().importance, Some(0.4));

        let changed = AnalysisConfig {
            sender_threshold: 3,
            ..AnalysisConfig::default()
        };
        assert_ne!(analysis_fingerprint(&config), analysis_fingerprint(&changed));
        assert!(inv.check_analysis_fingerprint(&changed).unwrap());
        assert_eq!(store.get_message("a").unwrap().unwrap().importance, None);
    }
}
