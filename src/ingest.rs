use crate::cache::{CacheStore, UpsertOutcome};
use crate::classify::{classify_message, Classifier};
use crate::error::StoreError;
use crate::models::{MessageRecord, ProcessingState};
use crate::priority::PriorityScorer;
use crate::threads::ThreadGraphBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PREVIEW_CHARS: usize = 500;
const HTML_WIDTH: usize = 100;

/// Message metadata as the mailbox collaborator delivers it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub labels: Vec<String>,
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Plain body if present, otherwise the HTML body rendered to text.
pub fn extract_preview(raw: &RawMessage) -> String {
    let text = match (&raw.text_body, &raw.html_body) {
        (Some(text), _) if !text.trim().is_empty() => collapse_whitespace(text),
        (_, Some(html)) => match html2text::from_read(html.as_bytes(), HTML_WIDTH) {
            Ok(rendered) => collapse_whitespace(&rendered),
            Err(e) => {
                debug!("[Ingest] could not render html body of {}: {}", raw.id, e);
                String::new()
            }
        },
        _ => String::new(),
    };
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Build the base row for `raw`. Bookkeeping timestamps are set by the
/// store on upsert.
pub fn to_record(raw: &RawMessage, folder: &str, now: DateTime<Utc>) -> MessageRecord {
    let id = raw.id.trim().to_string();
    let mut references: Vec<String> = Vec::new();
    for r in raw.references.iter().chain(raw.in_reply_to.iter()) {
        let r = r.trim();
        if !r.is_empty() && r != id && !references.iter().any(|x| x == r) {
            references.push(r.to_string());
        }
    }
    let provider_thread_id = raw
        .thread_id
        .as_ref()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    MessageRecord {
        thread_id: provider_thread_id.clone().unwrap_or_else(|| id.clone()),
        id,
        folder: folder.to_string(),
        subject: raw.subject.trim().to_string(),
        sender: raw.from.trim().to_string(),
        recipients: raw
            .to
            .iter()
            .chain(raw.cc.iter())
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect(),
        timestamp: raw.date.unwrap_or(now),
        provider_thread_id,
        references,
        preview: extract_preview(raw),
        importance: None,
        labels: raw.labels.iter().cloned().collect(),
        category: None,
        response_time: None,
        first_seen: now,
        last_updated: now,
    }
}

#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub moved: usize,
    pub skipped: usize,
    pub classification_failures: usize,
    pub threads_touched: usize,
    pub scored: usize,
    /// Newest message of the batch by (timestamp, id).
    pub last_message_id: Option<String>,
}

pub struct Ingestor {
    store: Arc<CacheStore>,
    threads: Arc<ThreadGraphBuilder>,
    scorer: Arc<PriorityScorer>,
    classifier: Arc<dyn Classifier>,
}

impl Ingestor {
    pub fn new(
        store: Arc<CacheStore>,
        threads: Arc<ThreadGraphBuilder>,
        scorer: Arc<PriorityScorer>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Ingestor {
            store,
            threads,
            scorer,
            classifier,
        }
    }

    /// Store one fetched batch. Upserts, thread recomputation and scoring
    /// commit together; readers see the batch entirely or not at all.
    pub fn ingest_batch(
        &self,
        folder: &str,
        raws: Vec<RawMessage>,
    ) -> Result<IngestReport, StoreError> {
        let now = self.store.now();
        let mut report = IngestReport::default();
        let mut records = Vec::with_capacity(raws.len());
        for raw in &raws {
            if raw.id.trim().is_empty() {
                warn!("[Ingest] skipping message without id in '{}'", folder);
                report.skipped += 1;
                continue;
            }
            let mut rec = to_record(raw, folder, now);
            match classify_message(self.classifier.as_ref(), &rec) {
                Ok(category) => rec.category = Some(category),
                Err(e) => {
                    warn!(
                        "[Ingest] {} classification failed for {} in '{}': {}",
                        self.classifier.name(),
                        rec.id,
                        folder,
                        e
                    );
                    report.classification_failures += 1;
                }
            }
            records.push(rec);
        }
        report.last_message_id = records
            .iter()
            .max_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)))
            .map(|r| r.id.clone());
        if records.is_empty() {
            return Ok(report);
        }

        let ids: BTreeSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let result = self.store.write(|txn| {
            for outcome in txn.upsert_batch(records)? {
                match outcome {
                    UpsertOutcome::Inserted => report.inserted += 1,
                    UpsertOutcome::Updated => report.updated += 1,
                    UpsertOutcome::Moved { .. } => report.moved += 1,
                }
            }
            let mut threads = BTreeSet::new();
            for id in &ids {
                if let Some(msg) = txn.get_message(id)? {
                    threads.insert(msg.thread_id);
                }
            }
            let rebuild = self.threads.rebuild(txn, &ids, &threads)?;
            // New history can shift scores of stored mail outside the batch.
            let scope = self.scorer.rescore_scope(txn, &ids)?;
            let scored = self.scorer.score_messages(txn, &scope)?;
            report.scored = scored.len();
            let mut refresh = rebuild.thread_ids.clone();
            for id in &scored {
                if let Some(msg) = txn.get_message(id)? {
                    refresh.insert(msg.thread_id);
                }
            }
            self.threads.refresh(txn, &refresh)?;
            report.threads_touched = rebuild.thread_ids.len();
            Ok::<_, StoreError>(())
        });
        if let Err(e) = result {
            warn!(
                "[Ingest] batch of {} messages for '{}' rolled back: {}",
                ids.len(),
                folder,
                e
            );
            return Err(e);
        }

        info!(
            "[Ingest] '{}': {} new, {} updated, {} moved, {} threads",
            folder, report.inserted, report.updated, report.moved, report.threads_touched
        );
        Ok(report)
    }

    fn cursor(&self, folder: &str) -> Result<ProcessingState, StoreError> {
        Ok(self
            .store
            .get_processing_state(folder)?
            .unwrap_or_else(|| ProcessingState {
                folder: folder.to_string(),
                ..Default::default()
            }))
    }

    /// Ingest a batch delivered by the caller and record the outcome on the
    /// folder's cursor: on success the batch's newest id, the time and the
    /// provider's `sync_token` (when given); on failure only the error, so
    /// the position stays where it was. A folder without a cursor has never
    /// been ingested and needs a full fetch.
    pub fn ingest_pushed(
        &self,
        folder: &str,
        messages: Vec<RawMessage>,
        sync_token: Option<String>,
    ) -> Result<IngestReport, StoreError> {
        let mut state = self.cursor(folder)?;
        if state.last_message_id.is_none() {
            info!("[Ingest] no cursor for '{}', treating batch as a full fetch", folder);
        }
        let outcome = self.ingest_batch(folder, messages);
        match &outcome {
            Ok(report) => {
                if report.last_message_id.is_some() {
                    state.last_message_id = report.last_message_id.clone();
                }
                state.last_processed_date = Some(self.store.now());
                state.last_success = true;
                state.last_error = None;
                if sync_token.is_some() {
                    state.sync_token = sync_token;
                }
            }
            Err(e) => {
                warn!("[Ingest] batch for '{}' failed: {}", folder, e);
                state.last_success = false;
                state.last_error = Some(e.to_string());
            }
        }
        self.store.write(|txn| txn.set_processing_state(&state))?;
        outcome
    }

    /// Retry classification for every message without a category. Thread
    /// aggregates are left for the caller to refresh.
    pub fn classify_pending(&self) -> Result<usize, StoreError> {
        let pending: Vec<MessageRecord> = self
            .store
            .all_messages()?
            .into_iter()
            .filter(|m| m.category.is_none())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let mut classified = Vec::new();
        for mut msg in pending {
            match classify_message(self.classifier.as_ref(), &msg) {
                Ok(category) => {
                    msg.category = Some(category);
                    classified.push(msg);
                }
                Err(e) => debug!("[Ingest] {} still unclassified: {}", msg.id, e),
            }
        }
        let count = classified.len();
        self.store.write(|txn| {
            for msg in &classified {
                // Row may have changed since it was read; only fill the gap.
                if let Some(mut current) = txn.get_message(&msg.id)? {
                    if current.category.is_none() {
                        current.category = msg.category.clone();
                        txn.put_message(&current)?;
                    }
                }
            }
            Ok::<_, StoreError>(())
        })?;
        if count > 0 {
            info!("[Ingest] classified {} pending messages", count);
        }
        Ok(count)
    }
}
