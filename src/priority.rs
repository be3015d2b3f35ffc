use crate::cache::StoreTxn;
use crate::config::AnalysisConfig;
use crate::error::StoreError;
use crate::models::{extract_address, MessageRecord};
use crate::threads::thread_members;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Fixed signal weights. They sum to 1 so the score stays in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub sender: f64,
    pub domain: f64,
    pub awaiting_reply: f64,
    pub recency: f64,
}

pub const WEIGHTS: Weights = Weights {
    sender: 0.35,
    domain: 0.15,
    awaiting_reply: 0.25,
    recency: 0.25,
};

/// Per-message inputs to the score, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Signals {
    pub sender: f64,
    pub domain: f64,
    pub awaiting_reply: f64,
    pub recency: f64,
}

impl Signals {
    pub fn score(&self) -> f64 {
        let raw = WEIGHTS.sender * self.sender
            + WEIGHTS.domain * self.domain
            + WEIGHTS.awaiting_reply * self.awaiting_reply
            + WEIGHTS.recency * self.recency;
        raw.clamp(0.0, 1.0)
    }
}

/// Sender, domain and thread state over a set of messages.
struct History {
    by_sender: HashMap<String, Vec<DateTime<Utc>>>,
    by_domain: HashMap<String, Vec<DateTime<Utc>>>,
    awaiting_reply: BTreeSet<String>,
}

impl History {
    fn build(messages: &[MessageRecord], owners: &BTreeSet<String>) -> Self {
        let mut by_sender: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();
        let mut by_domain: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();
        // thread id -> (latest (ts, id, sender), owner participates)
        let mut threads: HashMap<&str, ((DateTime<Utc>, &str, String), bool)> = HashMap::new();

        for msg in messages {
            let sender = msg.sender_address();
            by_sender.entry(sender.clone()).or_default().push(msg.timestamp);
            if let Some(domain) = msg.sender_domain() {
                by_domain.entry(domain).or_default().push(msg.timestamp);
            }

            let owner_involved = owners.contains(&sender)
                || msg
                    .recipients
                    .iter()
                    .any(|r| owners.contains(&extract_address(r)));
            let key = (msg.timestamp, msg.id.as_str(), sender);
            match threads.get_mut(msg.thread_id.as_str()) {
                Some((latest, involved)) => {
                    *involved |= owner_involved;
                    if (key.0, key.1) > (latest.0, latest.1) {
                        *latest = key;
                    }
                }
                None => {
                    threads.insert(msg.thread_id.as_str(), (key, owner_involved));
                }
            }
        }
        for times in by_sender.values_mut().chain(by_domain.values_mut()) {
            times.sort();
        }

        let awaiting_reply = threads
            .into_iter()
            .filter(|(_, ((_, _, last_sender), involved))| *involved && !owners.contains(last_sender))
            .map(|(thread_id, _)| thread_id.to_string())
            .collect();

        History {
            by_sender,
            by_domain,
            awaiting_reply,
        }
    }
}

/// Messages in `sorted` strictly before `ts` and no older than `window`.
fn prior_within(sorted: &[DateTime<Utc>], ts: DateTime<Utc>, window: Duration) -> usize {
    let start = ts - window;
    let lo = sorted.partition_point(|t| *t < start);
    let hi = sorted.partition_point(|t| *t < ts);
    hi.saturating_sub(lo)
}

pub struct PriorityScorer {
    enabled: bool,
    sender_threshold: u32,
    domain_threshold: u32,
    history_window: Duration,
    half_life_hours: f64,
    owners: BTreeSet<String>,
}

impl PriorityScorer {
    pub fn new(config: &AnalysisConfig) -> Self {
        PriorityScorer {
            enabled: config.priority_scoring,
            sender_threshold: config.sender_threshold,
            domain_threshold: config.domain_threshold,
            history_window: config.history_window,
            half_life_hours: config.recency_half_life_hours,
            owners: config.owner_addresses.iter().cloned().collect(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn signals_with(&self, history: &History, msg: &MessageRecord, now: DateTime<Utc>) -> Signals {
        let sender_count = history
            .by_sender
            .get(&msg.sender_address())
            .map_or(0, |t| prior_within(t, msg.timestamp, self.history_window));
        let domain_count = msg
            .sender_domain()
            .and_then(|d| history.by_domain.get(&d))
            .map_or(0, |t| prior_within(t, msg.timestamp, self.history_window));

        let age_hours = ((now - msg.timestamp).num_seconds().max(0)) as f64 / 3600.0;

        Signals {
            sender: (sender_count as f64 / f64::from(self.sender_threshold)).min(1.0),
            domain: (domain_count as f64 / f64::from(self.domain_threshold)).min(1.0),
            awaiting_reply: if history.awaiting_reply.contains(&msg.thread_id) {
                1.0
            } else {
                0.0
            },
            recency: 2f64.powf(-age_hours / self.half_life_hours),
        }
    }

    /// Signals for one message against `corpus` (which should contain it).
    #[cfg(test)]
    pub fn signals(
        &self,
        corpus: &[MessageRecord],
        msg: &MessageRecord,
        now: DateTime<Utc>,
    ) -> Signals {
        let history = History::build(corpus, &self.owners);
        self.signals_with(&history, msg, now)
    }

    /// Score the given messages and write the result back. History comes from
    /// the time index over the targets' lookback window plus the members of
    /// their threads. Returns the ids whose score changed.
    pub fn score_messages(
        &self,
        txn: &StoreTxn<'_>,
        ids: &BTreeSet<String>,
    ) -> Result<Vec<String>, StoreError> {
        if !self.enabled || ids.is_empty() {
            return Ok(Vec::new());
        }
        let targets = load(txn, ids)?;
        let Some((earliest, latest)) = span(&targets) else {
            return Ok(Vec::new());
        };
        let mut corpus: BTreeMap<String, MessageRecord> = BTreeMap::new();
        for msg in txn.messages_between(earliest - self.history_window, latest)? {
            corpus.insert(msg.id.clone(), msg);
        }
        let threads: BTreeSet<String> = targets.iter().map(|m| m.thread_id.clone()).collect();
        for msg in thread_members(txn, &threads)?.into_values().flatten() {
            corpus.insert(msg.id.clone(), msg);
        }
        let corpus: Vec<MessageRecord> = corpus.into_values().collect();
        let history = History::build(&corpus, &self.owners);

        let now = txn.now();
        let mut changed = Vec::new();
        for mut msg in targets {
            let score = self.signals_with(&history, &msg, now).score();
            if msg.importance != Some(score) {
                msg.importance = Some(score);
                txn.put_message(&msg)?;
                changed.push(msg.id);
            }
        }
        debug!(
            "[Priority] scored {} of {} messages against {} in history",
            changed.len(),
            ids.len(),
            corpus.len()
        );
        Ok(changed)
    }

    /// `ids` plus the members of their threads.
    pub fn thread_scope(
        &self,
        txn: &StoreTxn<'_>,
        ids: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let threads: BTreeSet<String> = load(txn, ids)?.into_iter().map(|m| m.thread_id).collect();
        let mut scope = ids.clone();
        scope.extend(
            thread_members(txn, &threads)?
                .into_values()
                .flatten()
                .map(|m| m.id),
        );
        Ok(scope)
    }

    /// Messages whose score can change when `ids` were added or changed:
    /// the thread scope of `ids` and every message from the same sender or
    /// sender domain up to one history window later.
    pub fn rescore_scope(
        &self,
        txn: &StoreTxn<'_>,
        ids: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let mut scope = self.thread_scope(txn, ids)?;
        let changed = load(txn, ids)?;
        let Some((earliest, latest)) = span(&changed) else {
            return Ok(scope);
        };
        let senders: BTreeSet<String> = changed.iter().map(|m| m.sender_address()).collect();
        let domains: BTreeSet<String> = changed.iter().filter_map(|m| m.sender_domain()).collect();
        for msg in txn.messages_between(earliest, latest + self.history_window)? {
            let same_domain = msg.sender_domain().map_or(false, |d| domains.contains(&d));
            if same_domain || senders.contains(&msg.sender_address()) {
                scope.insert(msg.id);
            }
        }
        Ok(scope)
    }
}

fn load(txn: &StoreTxn<'_>, ids: &BTreeSet<String>) -> Result<Vec<MessageRecord>, StoreError> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(msg) = txn.get_message(id)? {
            out.push(msg);
        }
    }
    Ok(out)
}

fn span(messages: &[MessageRecord]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let earliest = messages.iter().map(|m| m.timestamp).min()?;
    let latest = messages.iter().map(|m| m.timestamp).max()?;
    Some((earliest, latest))
}
