//! Operations exposed to the tool-dispatch layer. Each is a synchronous call
//! over the local store.

use crate::cache::{CacheStore, MessageFilter, SortOrder};
use crate::classify::Classifier;
use crate::config::AnalysisConfig;
use crate::duplicates::{DuplicateDetector, DuplicateGroup};
use crate::error::{ServiceError, StoreError};
use crate::ingest::{IngestReport, Ingestor, RawMessage};
use crate::invalidator::Invalidator;
use crate::models::{
    MessageRecord, ProcessingState, RuleDef, SmartFolderRecord, ThreadRecord, SEEN_LABEL,
};
use crate::priority::PriorityScorer;
use crate::rules::{FolderEvaluation, SmartFolderRuleEngine};
use crate::sync::{LeaseSync, SyncStatus};
use crate::threads::ThreadGraphBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_LIMIT: usize = 50;
const TOP_N: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    pub thread: ThreadRecord,
    /// Oldest first.
    pub messages: Vec<MessageRecord>,
}

/// Selection for `batch_process`. At least one field must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchCriteria {
    pub folder: Option<String>,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub label: Option<String>,
}

impl BatchCriteria {
    fn is_empty(&self) -> bool {
        self.folder.is_none()
            && self.sender.is_none()
            && self.subject.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
            && self.label.is_none()
    }

    fn to_filter(&self) -> MessageFilter {
        MessageFilter {
            folder: self.folder.clone(),
            sender: self.sender.clone(),
            label: self.label.clone(),
            since: self.date_from,
            until: self.date_to,
            ..Default::default()
        }
    }

    fn matches_subject(&self, msg: &MessageRecord) -> bool {
        self.subject.as_ref().map_or(true, |s| {
            msg.subject.to_lowercase().contains(&s.to_lowercase())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchAction {
    Move { folder: String },
    Delete,
    Label { label: String },
    MarkRead,
    MarkUnread,
}

/// Ids acted on locally, for the mailbox collaborator to mirror upstream.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub action: BatchAction,
    pub message_ids: Vec<String>,
    pub changed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DateRange {
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Count {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderSummary {
    pub folder: Option<String>,
    pub total: usize,
    pub unread: usize,
    pub date_range: Option<DateRange>,
    pub top_senders: Vec<Count>,
    pub top_domains: Vec<Count>,
    pub categories: BTreeMap<String, usize>,
    pub uncategorized: usize,
    pub threads: usize,
    pub active_threads: usize,
    pub duplicate_groups: usize,
    pub average_importance: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub store_path: String,
    pub recovered: bool,
    pub messages: u64,
    pub threads: usize,
    pub smart_folders: usize,
    pub folders: Vec<ProcessingState>,
    pub sync: Option<SyncStatus>,
}

fn top_counts(counts: HashMap<String, usize>) -> Vec<Count> {
    let mut out: Vec<Count> = counts
        .into_iter()
        .map(|(name, count)| Count { name, count })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    out.truncate(TOP_N);
    out
}

pub struct MailCache {
    store: Arc<CacheStore>,
    invalidator: Arc<Invalidator>,
    threads: Arc<ThreadGraphBuilder>,
    scorer: Arc<PriorityScorer>,
    duplicates: DuplicateDetector,
    rules: SmartFolderRuleEngine,
    ingestor: Ingestor,
    sync: Option<Arc<LeaseSync>>,
}

impl MailCache {
    pub fn new(
        store: Arc<CacheStore>,
        invalidator: Arc<Invalidator>,
        threads: Arc<ThreadGraphBuilder>,
        scorer: Arc<PriorityScorer>,
        classifier: Arc<dyn Classifier>,
        analysis: &AnalysisConfig,
        sync: Option<Arc<LeaseSync>>,
    ) -> Self {
        MailCache {
            duplicates: DuplicateDetector::new(analysis),
            rules: SmartFolderRuleEngine::new(store.clone()),
            ingestor: Ingestor::new(
                store.clone(),
                threads.clone(),
                scorer.clone(),
                classifier,
            ),
            store,
            invalidator,
            threads,
            scorer,
            sync,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Rows merged in from the remote copy or invalidated since the last
    /// derived read: re-classify, relink and rescore everything once.
    fn ensure_derived(&self) -> Result<(), StoreError> {
        if !self.store.take_derived_stale() {
            return Ok(());
        }
        info!("[Service] recomputing threads, categories and scores");
        let result = self.ingestor.classify_pending().and_then(|_| {
            self.store.write(|txn| {
                let report = self.threads.rebuild_all(txn)?;
                let ids: BTreeSet<String> =
                    txn.all_messages()?.into_iter().map(|m| m.id).collect();
                self.scorer.score_messages(txn, &ids)?;
                self.threads.refresh(txn, &report.thread_ids)?;
                Ok::<_, StoreError>(())
            })
        });
        if result.is_err() {
            self.store.mark_derived_stale();
        }
        result
    }

    /// Score rows read without an importance value and patch them in place.
    fn fill_scores(&self, records: &mut [MessageRecord]) -> Result<(), StoreError> {
        if !self.scorer.enabled() {
            return Ok(());
        }
        let missing: BTreeSet<String> = records
            .iter()
            .filter(|m| m.importance.is_none())
            .map(|m| m.id.clone())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let scores = self.store.write(|txn| {
            let scope = self.scorer.thread_scope(txn, &missing)?;
            self.scorer.score_messages(txn, &scope)?;
            let mut scores = HashMap::new();
            let mut thread_ids = BTreeSet::new();
            for id in &missing {
                if let Some(m) = txn.get_message(id)? {
                    thread_ids.insert(m.thread_id.clone());
                    scores.insert(m.id, m.importance);
                }
            }
            self.threads.refresh(txn, &thread_ids)?;
            Ok::<_, StoreError>(scores)
        })?;
        debug!("[Service] lazily scored {} messages", scores.len());
        for rec in records.iter_mut() {
            if let Some(score) = scores.get(&rec.id) {
                rec.importance = *score;
            }
        }
        Ok(())
    }

    fn collect(&self, filter: MessageFilter) -> Result<Vec<MessageRecord>, ServiceError> {
        self.ensure_derived()?;
        let mut records = self
            .store
            .query_messages(filter)?
            .collect::<Result<Vec<_>, _>>()?;
        self.fill_scores(&mut records)?;
        Ok(records)
    }

    pub fn list_messages(&self, mut filter: MessageFilter) -> Result<Vec<MessageRecord>, ServiceError> {
        filter.limit = Some(filter.limit.unwrap_or(DEFAULT_LIMIT));
        self.collect(filter)
    }

    pub fn search_messages(
        &self,
        query: &str,
        folder: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::InvalidInput("search query is empty".into()));
        }
        self.collect(MessageFilter {
            text: Some(query.to_string()),
            folder: folder.map(str::to_string),
            limit: Some(limit.unwrap_or(DEFAULT_LIMIT)),
            ..Default::default()
        })
    }

    pub fn get_message(&self, id: &str) -> Result<MessageRecord, ServiceError> {
        self.ensure_derived()?;
        let now = self.store.now();
        let record = self
            .store
            .get_message(id)?
            .filter(|m| !self.store.expiry().message_expired(m, now))
            .ok_or_else(|| ServiceError::NotFound(format!("message '{}'", id)))?;
        let mut records = vec![record];
        self.fill_scores(&mut records)?;
        Ok(records.remove(0))
    }

    /// Thread by thread id or by the id of any member message. A missing or
    /// expired record is rebuilt from its members.
    pub fn get_thread(&self, id: &str) -> Result<ThreadView, ServiceError> {
        self.ensure_derived()?;
        let thread_id = match self.store.get_thread(id)? {
            Some(t) => t.thread_id,
            None => self
                .store
                .get_message(id)?
                .map_or_else(|| id.to_string(), |m| m.thread_id),
        };
        let mut messages = self
            .store
            .query_messages(MessageFilter {
                thread_id: Some(thread_id.clone()),
                order: SortOrder::Ascending,
                ..Default::default()
            })?
            .collect::<Result<Vec<_>, _>>()?;
        if messages.is_empty() {
            return Err(ServiceError::NotFound(format!("thread '{}'", id)));
        }
        self.fill_scores(&mut messages)?;

        let now = self.store.now();
        let thread = match self.store.get_thread(&thread_id)? {
            Some(t) if !self.store.expiry().thread_expired(&t, now) => t,
            _ => {
                debug!("[Service] rebuilding thread record {}", thread_id);
                let ids = BTreeSet::from([thread_id.clone()]);
                self.store
                    .write(|txn| self.threads.refresh(txn, &ids))?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ServiceError::NotFound(format!("thread '{}'", id)))?
            }
        };
        Ok(ThreadView { thread, messages })
    }

    pub fn create_smart_folder(
        &self,
        name: &str,
        description: &str,
        rules: Vec<RuleDef>,
        priority: i32,
    ) -> Result<SmartFolderRecord, ServiceError> {
        self.rules.create(name, description, rules, priority)
    }

    pub fn apply_smart_folder(
        &self,
        name: &str,
        scope: MessageFilter,
    ) -> Result<FolderEvaluation, ServiceError> {
        self.rules.apply(name, scope)
    }

    pub fn list_smart_folders(&self) -> Result<Vec<SmartFolderRecord>, ServiceError> {
        Ok(self.rules.list()?)
    }

    /// Apply `action` locally to every live message matching `criteria`.
    pub fn batch_process(
        &self,
        criteria: &BatchCriteria,
        action: BatchAction,
    ) -> Result<BatchResult, ServiceError> {
        if criteria.is_empty() {
            return Err(ServiceError::InvalidInput(
                "batch criteria must set at least one field".into(),
            ));
        }
        if let BatchAction::Move { folder } | BatchAction::Label { label: folder } = &action {
            if folder.trim().is_empty() {
                return Err(ServiceError::InvalidInput("target must not be empty".into()));
            }
        }

        let selected: Vec<MessageRecord> = self
            .store
            .query_messages(criteria.to_filter())?
            .filter(|m| m.as_ref().map_or(true, |m| criteria.matches_subject(m)))
            .collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<String> = selected.iter().map(|m| m.id.clone()).collect();

        let changed = self.store.write(|txn| {
            if action == BatchAction::Delete {
                let removed = txn.delete_messages(&ids)?;
                let touched: BTreeSet<String> =
                    removed.iter().map(|m| m.thread_id.clone()).collect();
                self.threads.rebuild(txn, &BTreeSet::new(), &touched)?;
                return Ok::<_, StoreError>(removed.len());
            }
            let mut changed = 0;
            for msg in &selected {
                let mut updated = msg.clone();
                match &action {
                    BatchAction::Move { folder } => updated.folder = folder.clone(),
                    BatchAction::Label { label } => {
                        updated.labels.insert(label.clone());
                    }
                    BatchAction::MarkRead => {
                        updated.labels.insert(SEEN_LABEL.to_string());
                    }
                    BatchAction::MarkUnread => {
                        updated.labels.remove(SEEN_LABEL);
                    }
                    BatchAction::Delete => {}
                }
                if updated != *msg {
                    txn.upsert_message(updated)?;
                    changed += 1;
                }
            }
            Ok(changed)
        })?;
        info!(
            "[Service] batch {:?}: {} matched, {} changed",
            action,
            ids.len(),
            changed
        );
        Ok(BatchResult {
            action,
            message_ids: ids,
            changed,
        })
    }

    pub fn folder_summary(&self, folder: Option<&str>) -> Result<FolderSummary, ServiceError> {
        let messages = self.collect(MessageFilter {
            folder: folder.map(str::to_string),
            ..Default::default()
        })?;

        let mut senders: HashMap<String, usize> = HashMap::new();
        let mut domains: HashMap<String, usize> = HashMap::new();
        let mut categories: BTreeMap<String, usize> = BTreeMap::new();
        let mut threads: BTreeSet<&str> = BTreeSet::new();
        let mut uncategorized = 0;
        let mut unread = 0;
        let mut importance_sum = 0.0;
        let mut scored = 0usize;
        for msg in &messages {
            *senders.entry(msg.sender_address()).or_default() += 1;
            if let Some(domain) = msg.sender_domain() {
                *domains.entry(domain).or_default() += 1;
            }
            match &msg.category {
                Some(c) => *categories.entry(c.clone()).or_default() += 1,
                None => uncategorized += 1,
            }
            if !msg.is_read() {
                unread += 1;
            }
            if let Some(score) = msg.importance {
                importance_sum += score;
                scored += 1;
            }
            threads.insert(msg.thread_id.as_str());
        }

        let now = self.store.now();
        let mut active_threads = 0;
        for id in &threads {
            if let Some(t) = self.store.get_thread(id)? {
                if t.active && !self.store.expiry().thread_expired(&t, now) {
                    active_threads += 1;
                }
            }
        }

        // Newest first.
        let date_range = match (messages.last(), messages.first()) {
            (Some(oldest), Some(newest)) => Some(DateRange {
                oldest: oldest.timestamp,
                newest: newest.timestamp,
            }),
            _ => None,
        };

        Ok(FolderSummary {
            folder: folder.map(str::to_string),
            total: messages.len(),
            unread,
            date_range,
            top_senders: top_counts(senders),
            top_domains: top_counts(domains),
            categories,
            uncategorized,
            threads: threads.len(),
            active_threads,
            duplicate_groups: self.duplicates.detect(&messages).len(),
            average_importance: (scored > 0).then(|| importance_sum / scored as f64),
        })
    }

    pub fn find_duplicates(&self, folder: Option<&str>) -> Result<Vec<DuplicateGroup>, ServiceError> {
        Ok(self.duplicates.find(&self.store, folder)?)
    }

    pub fn ingest(
        &self,
        folder: &str,
        messages: Vec<RawMessage>,
        sync_token: Option<String>,
    ) -> Result<IngestReport, ServiceError> {
        let folder = folder.trim();
        if folder.is_empty() {
            return Err(ServiceError::InvalidInput("folder must not be empty".into()));
        }
        Ok(self.ingestor.ingest_pushed(folder, messages, sync_token)?)
    }

    pub fn processing_state(&self, folder: Option<&str>) -> Result<Vec<ProcessingState>, ServiceError> {
        match folder {
            Some(folder) => Ok(self.store.get_processing_state(folder)?.into_iter().collect()),
            None => Ok(self.store.all_processing_states()?),
        }
    }

    pub fn purge_folder(&self, folder: &str) -> Result<usize, ServiceError> {
        Ok(self.invalidator.purge_folder(folder)?)
    }

    pub fn invalidate_analysis(&self, ids: Option<&[String]>) -> Result<usize, ServiceError> {
        Ok(self.invalidator.invalidate_analysis(ids)?)
    }

    pub fn status(&self) -> Result<ServiceStatus, ServiceError> {
        let threads = self.store.all_threads()?.len();
        let smart_folders = self.store.all_smart_folders()?.len();
        let sync = self.sync.as_ref().map(|s| s.status());
        if let Some(s) = &sync {
            if s.degraded {
                warn!("[Service] remote sync degraded: {:?}", s.last_error);
            }
        }
        Ok(ServiceStatus {
            store_path: self.store.path().display().to_string(),
            recovered: self.store.recovered(),
            messages: self.store.message_count()?,
            threads,
            smart_folders,
            folders: self.store.all_processing_states()?,
            sync,
        })
    }
}
