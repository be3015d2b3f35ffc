use crate::clock::Clock;
use crate::error::{ConflictError, StoreError};
use crate::invalidator::ExpiryPolicy;
use crate::models::{
    MessageRecord, ProcessingState, SmartFolderRecord, StoreSnapshot, ThreadRecord,
    SNAPSHOT_VERSION,
};
use chrono::{DateTime, Duration, Utc};
use redb::{
    Database, ReadOnlyTable, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
// Key: sortable millis + '\x1f' + message id. Empty value.
const MESSAGE_TIME: TableDefinition<&str, &[u8]> = TableDefinition::new("message_time");
const THREADS: TableDefinition<&str, &[u8]> = TableDefinition::new("threads");
const SMART_FOLDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("smart_folders");
const PROCESSING_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("processing_state");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const META_ANALYSIS_FINGERPRINT: &str = "analysis_fingerprint";
pub const META_REMOTE_ETAG: &str = "remote_etag";

const EMPTY: &[u8] = &[];
const PAGE_SIZE: usize = 64;
const KEY_SEP: char = '\u{1f}';

fn time_prefix(ts: DateTime<Utc>) -> String {
    // Flip the sign bit so negative millis sort before positive ones.
    let ms = ts.timestamp_millis() as u64 ^ (1u64 << 63);
    format!("{:020}", ms)
}

fn time_key(ts: DateTime<Utc>, id: &str) -> String {
    format!("{}{}{}", time_prefix(ts), KEY_SEP, id)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn get_row<T, Tb>(table: &Tb, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(value) => Ok(Some(decode(value.value())?)),
        None => Ok(None),
    }
}

fn all_rows<T, Tb>(table: &Tb) -> Result<Vec<T>, StoreError>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        out.push(decode(value.value())?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Descending,
    Ascending,
}

/// Criteria for `CacheStore::query_messages`. Every set field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessageFilter {
    pub folder: Option<String>,
    /// Case-insensitive substring of the sender.
    pub sender: Option<String>,
    pub thread_id: Option<String>,
    /// Case-insensitive substring of subject, sender or preview.
    pub text: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub label: Option<String>,
    pub include_expired: bool,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn folder(folder: &str) -> Self {
        MessageFilter {
            folder: Some(folder.to_string()),
            ..Default::default()
        }
    }

    fn matches(&self, rec: &MessageRecord) -> bool {
        if let Some(folder) = &self.folder {
            if &rec.folder != folder {
                return false;
            }
        }
        if let Some(thread_id) = &self.thread_id {
            if &rec.thread_id != thread_id {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if !rec.sender.to_lowercase().contains(&sender.to_lowercase()) {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if !rec.labels.contains(label) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let hit = rec.subject.to_lowercase().contains(&needle)
                || rec.sender.to_lowercase().contains(&needle)
                || rec.preview.to_lowercase().contains(&needle);
            if !hit {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Moved { from: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub messages: usize,
    pub threads: usize,
    pub smart_folders: usize,
    pub processing_state: usize,
}

pub struct CacheStore {
    db: Database,
    path: PathBuf,
    clock: Arc<dyn Clock>,
    expiry: ExpiryPolicy,
    recovered: bool,
    derived_stale: AtomicBool,
}

impl CacheStore {
    /// Open or create the store. A file redb cannot read is discarded and a
    /// fresh store created in its place; `recovered()` then reports true.
    pub fn open(
        path: &Path,
        expiry: ExpiryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<CacheStore, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let (db, recovered) = match Database::create(path) {
            Ok(db) => (db, false),
            Err(e @ redb::DatabaseError::DatabaseAlreadyOpen) => return Err(e.into()),
            Err(e) => {
                warn!(
                    "[Cache] store at {} is unreadable ({}); discarding local copy",
                    path.display(),
                    e
                );
                std::fs::remove_file(path)?;
                (Database::create(path)?, true)
            }
        };

        let txn = db.begin_write()?;
        {
            txn.open_table(MESSAGES)?;
            txn.open_table(MESSAGE_TIME)?;
            txn.open_table(THREADS)?;
            txn.open_table(SMART_FOLDERS)?;
            txn.open_table(PROCESSING_STATE)?;
            txn.open_table(META)?;
        }
        txn.commit()?;

        debug!("[Cache] opened {}", path.display());
        Ok(CacheStore {
            db,
            path: path.to_path_buf(),
            clock,
            expiry,
            recovered,
            derived_stale: AtomicBool::new(false),
        })
    }

    /// Delete the store file. Used by `--clear-cache`.
    pub fn remove_file(path: &Path) -> Result<bool, StoreError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn recovered(&self) -> bool {
        self.recovered
    }

    pub fn expiry(&self) -> &ExpiryPolicy {
        &self.expiry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Derived thread and score fields no longer match the base rows, e.g.
    /// after rows were merged in from the remote copy.
    pub fn mark_derived_stale(&self) {
        self.derived_stale.store(true, Ordering::SeqCst);
    }

    pub fn take_derived_stale(&self) -> bool {
        self.derived_stale.swap(false, Ordering::SeqCst)
    }

    /// Run one logical operation in one write transaction. The transaction
    /// commits only if `f` returns `Ok`; an error drops (aborts) it.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&StoreTxn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let txn = self.db.begin_write().map_err(StoreError::from)?;
        let scope = StoreTxn {
            txn,
            store: self,
            now: self.clock.now(),
        };
        let out = f(&scope)?;
        scope.txn.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    fn read_table(
        &self,
        def: TableDefinition<&'static str, &'static [u8]>,
    ) -> Result<ReadOnlyTable<&'static str, &'static [u8]>, StoreError> {
        let txn = self.db.begin_read()?;
        Ok(txn.open_table(def)?)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        get_row(&self.read_table(MESSAGES)?, id)
    }

    pub fn all_messages(&self) -> Result<Vec<MessageRecord>, StoreError> {
        all_rows(&self.read_table(MESSAGES)?)
    }

    pub fn message_count(&self) -> Result<u64, StoreError> {
        Ok(self.read_table(MESSAGES)?.len()?)
    }

    /// Lazy, one-shot scan over the time index. Rows are read from a single
    /// MVCC snapshot so a concurrent batch is either fully visible or not at
    /// all.
    pub fn query_messages(&self, filter: MessageFilter) -> Result<MessageQuery, StoreError> {
        let txn = self.db.begin_read()?;
        let index = txn.open_table(MESSAGE_TIME)?;
        let messages = txn.open_table(MESSAGES)?;
        let lower = filter.since.map(time_prefix);
        let upper = filter
            .until
            .map(|until| time_prefix(until + Duration::milliseconds(1)));
        let done = matches!((&lower, &upper), (Some(l), Some(u)) if l >= u)
            || filter.limit == Some(0);
        Ok(MessageQuery {
            index,
            messages,
            expiry: self.expiry,
            now: self.clock.now(),
            filter,
            lower,
            upper,
            cursor: None,
            pending: VecDeque::new(),
            yielded: 0,
            done,
        })
    }

    pub fn get_thread(&self, id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        get_row(&self.read_table(THREADS)?, id)
    }

    pub fn all_threads(&self) -> Result<Vec<ThreadRecord>, StoreError> {
        all_rows(&self.read_table(THREADS)?)
    }

    pub fn get_smart_folder(&self, name: &str) -> Result<Option<SmartFolderRecord>, StoreError> {
        get_row(&self.read_table(SMART_FOLDERS)?, name)
    }

    pub fn all_smart_folders(&self) -> Result<Vec<SmartFolderRecord>, StoreError> {
        all_rows(&self.read_table(SMART_FOLDERS)?)
    }

    pub fn get_processing_state(&self, folder: &str) -> Result<Option<ProcessingState>, StoreError> {
        get_row(&self.read_table(PROCESSING_STATE)?, folder)
    }

    pub fn all_processing_states(&self) -> Result<Vec<ProcessingState>, StoreError> {
        all_rows(&self.read_table(PROCESSING_STATE)?)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        get_row(&self.read_table(META)?, key)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(|txn| txn.set_meta(key, value))
    }

    pub fn export_snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let txn = self.db.begin_read()?;
        Ok(StoreSnapshot {
            version: SNAPSHOT_VERSION,
            analysis_fingerprint: get_row(&txn.open_table(META)?, META_ANALYSIS_FINGERPRINT)?,
            messages: all_rows(&txn.open_table(MESSAGES)?)?,
            threads: all_rows(&txn.open_table(THREADS)?)?,
            smart_folders: all_rows(&txn.open_table(SMART_FOLDERS)?)?,
            processing_state: all_rows(&txn.open_table(PROCESSING_STATE)?)?,
        })
    }

    /// Replace every row with the snapshot's. Local-only meta is dropped.
    pub fn replace_with(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        self.write(|txn| {
            txn.clear_all()?;
            for message in &snapshot.messages {
                txn.write_message(message, None)?;
            }
            for thread in &snapshot.threads {
                txn.put_thread(thread)?;
            }
            for folder in &snapshot.smart_folders {
                txn.put_smart_folder(folder)?;
            }
            for state in &snapshot.processing_state {
                txn.set_processing_state(state)?;
            }
            if let Some(fingerprint) = &snapshot.analysis_fingerprint {
                txn.set_meta(META_ANALYSIS_FINGERPRINT, fingerprint)?;
            }
            Ok::<_, StoreError>(())
        })?;
        self.mark_derived_stale();
        info!(
            "[Cache] replaced local store with snapshot ({} messages, {} threads)",
            snapshot.messages.len(),
            snapshot.threads.len()
        );
        Ok(())
    }

    /// Fold another copy's rows in, row by row, keeping whichever side was
    /// touched last. Derived fields are marked stale when messages change.
    pub fn merge_snapshot(&self, snapshot: &StoreSnapshot) -> Result<MergeReport, StoreError> {
        let report = self.write(|txn| {
            let mut report = MergeReport::default();
            for remote in &snapshot.messages {
                let local = txn.get_message(&remote.id)?;
                if local
                    .as_ref()
                    .map_or(true, |l| remote.last_updated > l.last_updated)
                {
                    txn.write_message(remote, local.as_ref())?;
                    report.messages += 1;
                }
            }
            for remote in &snapshot.threads {
                let local = txn.get_thread(&remote.thread_id)?;
                if local.map_or(true, |l| remote.updated_at > l.updated_at) {
                    txn.put_thread(remote)?;
                    report.threads += 1;
                }
            }
            for remote in &snapshot.smart_folders {
                let local = txn.get_smart_folder(&remote.name)?;
                if local.map_or(true, |l| remote.touched_at() > l.touched_at()) {
                    txn.put_smart_folder(remote)?;
                    report.smart_folders += 1;
                }
            }
            for remote in &snapshot.processing_state {
                let local = txn.get_processing_state(&remote.folder)?;
                if local.map_or(true, |l| remote.last_processed_date > l.last_processed_date) {
                    txn.set_processing_state(remote)?;
                    report.processing_state += 1;
                }
            }
            Ok::<_, StoreError>(report)
        })?;
        if report.messages > 0 {
            self.mark_derived_stale();
        }
        Ok(report)
    }
}

/// Handle for one write transaction. See `CacheStore::write`.
pub struct StoreTxn<'s> {
    txn: WriteTransaction,
    store: &'s CacheStore,
    now: DateTime<Utc>,
}

impl StoreTxn<'_> {
    /// Timestamp all rows written in this transaction share.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn expiry(&self) -> &ExpiryPolicy {
        &self.store.expiry
    }

    pub fn mark_derived_stale(&self) {
        self.store.mark_derived_stale();
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        get_row(&self.txn.open_table(MESSAGES)?, id)
    }

    pub fn all_messages(&self) -> Result<Vec<MessageRecord>, StoreError> {
        all_rows(&self.txn.open_table(MESSAGES)?)
    }

    /// Rows with `since <= timestamp <= until`, oldest first, via the time
    /// index.
    pub fn messages_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut out = Vec::new();
        if since > until {
            return Ok(out);
        }
        let lower = time_prefix(since);
        let upper = time_prefix(until + Duration::milliseconds(1));
        let index = self.txn.open_table(MESSAGE_TIME)?;
        let messages = self.txn.open_table(MESSAGES)?;
        for entry in index.range::<&str>(lower.as_str()..upper.as_str())? {
            let (key, _) = entry?;
            if let Some((_, id)) = key.value().split_once(KEY_SEP) {
                if let Some(rec) = get_row(&messages, id)? {
                    out.push(rec);
                }
            }
        }
        Ok(out)
    }

    /// Insert or overwrite by id. `first_seen` survives re-upserts and
    /// `last_updated` never moves backwards. Derived fields the caller left
    /// empty keep their stored values.
    pub fn upsert_message(&self, mut rec: MessageRecord) -> Result<UpsertOutcome, StoreError> {
        let previous = self.get_message(&rec.id)?;
        let outcome = match &previous {
            None => {
                rec.first_seen = self.now;
                rec.last_updated = self.now;
                UpsertOutcome::Inserted
            }
            Some(prev) => {
                rec.first_seen = prev.first_seen;
                rec.last_updated = self.now.max(prev.last_updated);
                rec.thread_id = prev.thread_id.clone();
                if rec.response_time.is_none() {
                    rec.response_time = prev.response_time;
                }
                if rec.importance.is_none() {
                    rec.importance = prev.importance;
                }
                if rec.category.is_none() {
                    rec.category = prev.category.clone();
                }
                if prev.folder != rec.folder {
                    info!(
                        "[Cache] message {} moved from '{}' to '{}'",
                        rec.id, prev.folder, rec.folder
                    );
                    UpsertOutcome::Moved {
                        from: prev.folder.clone(),
                    }
                } else {
                    UpsertOutcome::Updated
                }
            }
        };
        self.write_message(&rec, previous.as_ref())?;
        Ok(outcome)
    }

    /// Upsert a fetched batch. The same id under two folders in one batch is
    /// rejected before anything is written.
    pub fn upsert_batch(
        &self,
        records: Vec<MessageRecord>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        {
            let mut seen: HashMap<&str, &str> = HashMap::new();
            for rec in &records {
                if let Some(first) = seen.insert(rec.id.as_str(), rec.folder.as_str()) {
                    if first != rec.folder {
                        return Err(ConflictError {
                            id: rec.id.clone(),
                            first_folder: first.to_string(),
                            second_folder: rec.folder.clone(),
                        }
                        .into());
                    }
                }
            }
        }
        records
            .into_iter()
            .map(|rec| self.upsert_message(rec))
            .collect()
    }

    /// Write derived fields back without touching `last_updated`.
    pub fn put_message(&self, rec: &MessageRecord) -> Result<(), StoreError> {
        let previous = self.get_message(&rec.id)?;
        self.write_message(rec, previous.as_ref())
    }

    fn write_message(
        &self,
        rec: &MessageRecord,
        previous: Option<&MessageRecord>,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(rec)?;
        let mut messages = self.txn.open_table(MESSAGES)?;
        messages.insert(rec.id.as_str(), bytes.as_slice())?;
        let mut index = self.txn.open_table(MESSAGE_TIME)?;
        if let Some(prev) = previous {
            if prev.timestamp != rec.timestamp {
                index.remove(time_key(prev.timestamp, &prev.id).as_str())?;
            }
        }
        index.insert(time_key(rec.timestamp, &rec.id).as_str(), EMPTY)?;
        Ok(())
    }

    /// Absent ids are ignored. Returns the rows that were removed.
    pub fn delete_messages(&self, ids: &[String]) -> Result<Vec<MessageRecord>, StoreError> {
        let mut removed = Vec::new();
        let mut messages = self.txn.open_table(MESSAGES)?;
        let mut index = self.txn.open_table(MESSAGE_TIME)?;
        for id in ids {
            let row = messages.remove(id.as_str())?;
            if let Some(row) = row {
                let rec: MessageRecord = decode(row.value())?;
                index.remove(time_key(rec.timestamp, &rec.id).as_str())?;
                removed.push(rec);
            }
        }
        Ok(removed)
    }

    pub fn get_thread(&self, id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        get_row(&self.txn.open_table(THREADS)?, id)
    }

    pub fn all_threads(&self) -> Result<Vec<ThreadRecord>, StoreError> {
        all_rows(&self.txn.open_table(THREADS)?)
    }

    pub fn put_thread(&self, thread: &ThreadRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(thread)?;
        self.txn
            .open_table(THREADS)?
            .insert(thread.thread_id.as_str(), bytes.as_slice())?;
        Ok(())
    }

    pub fn delete_thread(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.txn.open_table(THREADS)?.remove(id)?.is_some())
    }

    pub fn get_smart_folder(&self, name: &str) -> Result<Option<SmartFolderRecord>, StoreError> {
        get_row(&self.txn.open_table(SMART_FOLDERS)?, name)
    }

    pub fn all_smart_folders(&self) -> Result<Vec<SmartFolderRecord>, StoreError> {
        all_rows(&self.txn.open_table(SMART_FOLDERS)?)
    }

    pub fn put_smart_folder(&self, folder: &SmartFolderRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(folder)?;
        self.txn
            .open_table(SMART_FOLDERS)?
            .insert(folder.name.as_str(), bytes.as_slice())?;
        Ok(())
    }

    pub fn delete_smart_folder(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.txn.open_table(SMART_FOLDERS)?.remove(name)?.is_some())
    }

    pub fn get_processing_state(&self, folder: &str) -> Result<Option<ProcessingState>, StoreError> {
        get_row(&self.txn.open_table(PROCESSING_STATE)?, folder)
    }

    pub fn set_processing_state(&self, state: &ProcessingState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(state)?;
        self.txn
            .open_table(PROCESSING_STATE)?
            .insert(state.folder.as_str(), bytes.as_slice())?;
        Ok(())
    }

    pub fn delete_processing_state(&self, folder: &str) -> Result<bool, StoreError> {
        Ok(self
            .txn
            .open_table(PROCESSING_STATE)?
            .remove(folder)?
            .is_some())
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.txn.open_table(META)?.insert(key, bytes.as_slice())?;
        Ok(())
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        for def in [
            MESSAGES,
            MESSAGE_TIME,
            THREADS,
            SMART_FOLDERS,
            PROCESSING_STATE,
            META,
        ] {
            self.txn.delete_table(def)?;
            self.txn.open_table(def)?;
        }
        Ok(())
    }
}

/// Iterator returned by `CacheStore::query_messages`. Pages through the time
/// index `PAGE_SIZE` keys at a time and yields matching rows until the
/// filter's limit is reached. Not restartable.
pub struct MessageQuery {
    index: ReadOnlyTable<&'static str, &'static [u8]>,
    messages: ReadOnlyTable<&'static str, &'static [u8]>,
    expiry: ExpiryPolicy,
    now: DateTime<Utc>,
    filter: MessageFilter,
    lower: Option<String>,
    upper: Option<String>,
    cursor: Option<String>,
    pending: VecDeque<String>,
    yielded: usize,
    done: bool,
}

impl MessageQuery {
    fn accepts(&self, rec: &MessageRecord) -> bool {
        if !self.filter.include_expired && self.expiry.message_expired(rec, self.now) {
            return false;
        }
        self.filter.matches(rec)
    }

    fn fill_page(&mut self) -> Result<usize, StoreError> {
        let descending = self.filter.order == SortOrder::Descending;
        let keys: Vec<String> = {
            let lower: Bound<&str> = match (&self.cursor, &self.lower) {
                (Some(c), _) if !descending => Bound::Excluded(c.as_str()),
                (_, Some(l)) => Bound::Included(l.as_str()),
                _ => Bound::Unbounded,
            };
            let upper: Bound<&str> = match (&self.cursor, &self.upper) {
                (Some(c), _) if descending => Bound::Excluded(c.as_str()),
                (_, Some(u)) => Bound::Excluded(u.as_str()),
                _ => Bound::Unbounded,
            };
            let range = self.index.range::<&str>((lower, upper))?;
            let page: Result<Vec<String>, redb::StorageError> = if descending {
                range
                    .rev()
                    .take(PAGE_SIZE)
                    .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                    .collect()
            } else {
                range
                    .take(PAGE_SIZE)
                    .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                    .collect()
            };
            page?
        };
        self.cursor = keys.last().cloned();
        for key in &keys {
            if let Some((_, id)) = key.split_once(KEY_SEP) {
                self.pending.push_back(id.to_string());
            }
        }
        Ok(keys.len())
    }
}

impl Iterator for MessageQuery {
    type Item = Result<MessageRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(limit) = self.filter.limit {
                if self.yielded >= limit {
                    self.done = true;
                    return None;
                }
            }
            if let Some(id) = self.pending.pop_front() {
                match get_row::<MessageRecord, _>(&self.messages, &id) {
                    Ok(Some(rec)) if self.accepts(&rec) => {
                        self.yielded += 1;
                        return Some(Ok(rec));
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            match self.fill_page() {
                Ok(0) => self.done = true,
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
