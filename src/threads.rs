use crate::cache::StoreTxn;
use crate::config::AnalysisConfig;
use crate::error::StoreError;
use crate::models::{extract_address, MessageRecord, ThreadRecord};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Strip reply/forward prefixes and `[list]` tags, collapse whitespace and
/// lower-case. Used as the fallback threading key.
pub fn normalize_subject(subject: &str) -> String {
    let mut rest = subject.trim();
    loop {
        if rest.starts_with('[') {
            if let Some(end) = rest.find(']') {
                rest = rest[end + 1..].trim_start();
                continue;
            }
        }
        let lower = rest.to_ascii_lowercase();
        let mut stripped = false;
        for prefix in ["re", "fwd", "fw", "aw"] {
            if lower.starts_with(prefix) {
                let after = rest[prefix.len()..].trim_start();
                if let Some(tail) = after.strip_prefix(':') {
                    rest = tail.trim_start();
                    stripped = true;
                    break;
                }
            }
        }
        if !stripped {
            break;
        }
    }
    rest.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

struct UnionFind {
    index: HashMap<String, usize>,
    parent: Vec<usize>,
}

impl UnionFind {
    fn new() -> Self {
        UnionFind {
            index: HashMap::new(),
            parent: Vec::new(),
        }
    }

    fn node(&mut self, key: String) -> usize {
        if let Some(&i) = self.index.get(&key) {
            return i;
        }
        let i = self.parent.len();
        self.parent.push(i);
        self.index.insert(key, i);
        i
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index wins so the result does not depend on call order.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RebuildReport {
    pub threads_written: usize,
    pub threads_removed: usize,
    pub messages_updated: usize,
    /// Ids of every thread written, after merges.
    pub thread_ids: BTreeSet<String>,
}

pub struct ThreadGraphBuilder {
    active_window: Duration,
    link_references: bool,
}

impl ThreadGraphBuilder {
    pub fn new(config: &AnalysisConfig) -> Self {
        ThreadGraphBuilder {
            active_window: config.active_window,
            link_references: config.thread_analysis,
        }
    }

    /// Group messages into threads. Returns indices into `messages`, each
    /// group sorted by (timestamp, id), groups sorted by thread id.
    ///
    /// Links: a message joins the messages it references, any message that
    /// shares its stored or provider thread id, and (only when none of its
    /// references names a message in `messages`) any message with the same
    /// normalised subject.
    pub fn partition(&self, messages: &[MessageRecord]) -> Vec<(String, Vec<usize>)> {
        let known: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        let mut uf = UnionFind::new();
        let mut message_nodes = Vec::with_capacity(messages.len());
        for msg in messages {
            let me = uf.node(format!("m:{}", msg.id));
            message_nodes.push(me);
            let stored = uf.node(format!("t:{}", msg.thread_id));
            uf.union(me, stored);
            if let Some(provider) = &msg.provider_thread_id {
                let p = uf.node(format!("t:{}", provider));
                uf.union(me, p);
            }
            if !self.link_references {
                continue;
            }
            for reference in &msg.references {
                let r = uf.node(format!("m:{}", reference));
                uf.union(me, r);
            }
            let resolved = msg.references.iter().any(|r| known.contains(r.as_str()));
            if !resolved {
                let key = normalize_subject(&msg.subject);
                if !key.is_empty() {
                    let s = uf.node(format!("s:{}", key));
                    uf.union(me, s);
                }
            }
        }

        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, node) in message_nodes.into_iter().enumerate() {
            let root = uf.find(node);
            groups.entry(root).or_default().push(i);
        }

        let mut out: Vec<(String, Vec<usize>)> = groups
            .into_values()
            .map(|mut members| {
                members.sort_by(|&a, &b| {
                    (messages[a].timestamp, &messages[a].id)
                        .cmp(&(messages[b].timestamp, &messages[b].id))
                });
                (thread_id_for(messages, &members), members)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Recompute every thread that contains a touched message or a message
    /// currently assigned to a touched thread. Touched thread ids that end up
    /// with no members are deleted, as are ids superseded by a merge.
    pub fn rebuild(
        &self,
        txn: &StoreTxn<'_>,
        touched_messages: &BTreeSet<String>,
        touched_threads: &BTreeSet<String>,
    ) -> Result<RebuildReport, StoreError> {
        let messages = txn.all_messages()?;
        let mut report = RebuildReport::default();
        let mut superseded: BTreeSet<String> = touched_threads.clone();

        for (thread_id, members) in self.partition(&messages) {
            let affected = members.iter().any(|&i| {
                touched_messages.contains(&messages[i].id)
                    || touched_threads.contains(&messages[i].thread_id)
            });
            if !affected {
                continue;
            }

            let mut previous_ids = BTreeSet::new();
            let mut ordered = Vec::with_capacity(members.len());
            let mut prev_ts: Option<DateTime<Utc>> = None;
            for &i in &members {
                let mut msg = messages[i].clone();
                if msg.thread_id != thread_id {
                    previous_ids.insert(msg.thread_id.clone());
                }
                let delta = prev_ts.map(|p| (msg.timestamp - p).num_milliseconds() as f64 / 1000.0);
                prev_ts = Some(msg.timestamp);
                if msg.thread_id != thread_id || msg.response_time != delta {
                    msg.thread_id = thread_id.clone();
                    msg.response_time = delta;
                    txn.put_message(&msg)?;
                    report.messages_updated += 1;
                }
                ordered.push(msg);
            }

            for old in &previous_ids {
                debug!("[Threads] {} merged into {}", old, thread_id);
            }
            superseded.extend(previous_ids);

            let record = self.summarize(&thread_id, &ordered, txn.now());
            txn.put_thread(&record)?;
            report.threads_written += 1;
            report.thread_ids.insert(thread_id);
        }

        for gone in superseded.difference(&report.thread_ids) {
            if txn.delete_thread(gone)? {
                debug!("[Threads] removed record {}", gone);
                report.threads_removed += 1;
            }
        }
        Ok(report)
    }

    pub fn rebuild_all(&self, txn: &StoreTxn<'_>) -> Result<RebuildReport, StoreError> {
        let messages = txn.all_messages()?;
        let touched: BTreeSet<String> = messages.iter().map(|m| m.id.clone()).collect();
        let mut stale: BTreeSet<String> = txn
            .all_threads()?
            .into_iter()
            .map(|t| t.thread_id)
            .collect();
        stale.extend(messages.iter().map(|m| m.thread_id.clone()));
        self.rebuild(txn, &touched, &stale)
    }

    /// Re-summarise threads from their current members without relinking.
    /// Used after scores change and to restore an expired record.
    pub fn refresh(
        &self,
        txn: &StoreTxn<'_>,
        thread_ids: &BTreeSet<String>,
    ) -> Result<Vec<ThreadRecord>, StoreError> {
        if thread_ids.is_empty() {
            return Ok(Vec::new());
        }
        let members = thread_members(txn, thread_ids)?;
        let mut out = Vec::new();
        for (thread_id, mut msgs) in members {
            msgs.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
            let record = self.summarize(&thread_id, &msgs, txn.now());
            txn.put_thread(&record)?;
            out.push(record);
        }
        Ok(out)
    }

    /// `ordered` must be sorted by (timestamp, id) and non-empty.
    fn summarize(
        &self,
        thread_id: &str,
        ordered: &[MessageRecord],
        now: DateTime<Utc>,
    ) -> ThreadRecord {
        let mut participants = BTreeSet::new();
        let mut labels = BTreeSet::new();
        let mut categories: BTreeMap<&str, usize> = BTreeMap::new();
        let mut scores = Vec::new();
        for msg in ordered {
            participants.insert(msg.sender_address());
            for r in &msg.recipients {
                let addr = extract_address(r);
                if !addr.is_empty() {
                    participants.insert(addr);
                }
            }
            labels.extend(msg.labels.iter().cloned());
            if let Some(c) = &msg.category {
                *categories.entry(c.as_str()).or_default() += 1;
            }
            if let Some(s) = msg.importance {
                scores.push(s);
            }
        }
        participants.remove("");

        let deltas: Vec<f64> = ordered.iter().filter_map(|m| m.response_time).collect();
        let avg_response_time = if ordered.len() < 2 || deltas.is_empty() {
            None
        } else {
            Some(deltas.iter().sum::<f64>() / deltas.len() as f64)
        };

        let last_activity = ordered
            .iter()
            .map(|m| m.timestamp)
            .max()
            .unwrap_or(now);

        // Most frequent category; ties go to the alphabetically first.
        let mut category: Option<(&str, usize)> = None;
        for (name, count) in &categories {
            if category.map_or(true, |(_, best)| *count > best) {
                category = Some((*name, *count));
            }
        }

        ThreadRecord {
            thread_id: thread_id.to_string(),
            subject: ordered.first().map(|m| m.subject.clone()).unwrap_or_default(),
            participants,
            last_activity,
            message_count: ordered.len(),
            message_ids: ordered.iter().map(|m| m.id.clone()).collect(),
            avg_response_time,
            active: now - last_activity <= self.active_window,
            importance: if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            },
            category: category.map(|(name, _)| name.to_string()),
            labels,
            updated_at: now,
        }
    }
}

/// Current members of each of `thread_ids`, read through the thread records.
/// Ids without a record are resolved with one full scan.
pub fn thread_members(
    txn: &StoreTxn<'_>,
    thread_ids: &BTreeSet<String>,
) -> Result<BTreeMap<String, Vec<MessageRecord>>, StoreError> {
    let mut members: BTreeMap<String, Vec<MessageRecord>> = BTreeMap::new();
    let mut unrecorded: BTreeSet<&str> = BTreeSet::new();
    for thread_id in thread_ids {
        let Some(record) = txn.get_thread(thread_id)? else {
            unrecorded.insert(thread_id.as_str());
            continue;
        };
        for id in &record.message_ids {
            if let Some(msg) = txn.get_message(id)? {
                if msg.thread_id == *thread_id {
                    members.entry(thread_id.clone()).or_default().push(msg);
                }
            }
        }
    }
    if !unrecorded.is_empty() {
        for msg in txn.all_messages()? {
            if unrecorded.contains(msg.thread_id.as_str()) {
                members.entry(msg.thread_id.clone()).or_default().push(msg);
            }
        }
    }
    Ok(members)
}

fn thread_id_for(messages: &[MessageRecord], members: &[usize]) -> String {
    members
        .iter()
        .flat_map(|&i| {
            let m = &messages[i];
            [Some(&m.id), Some(&m.thread_id), m.provider_thread_id.as_ref()]
        })
        .flatten()
        .min()
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{message, open_store};

    fn builder() -> ThreadGraphBuilder {
        ThreadGraphBuilder::new(&AnalysisConfig::default())
    }

    fn reply(id: &str, parent: &[&str], ts: DateTime<Utc>) -> MessageRecord {
        let mut m = message(id, "INBOX", "Re: Plans", "b@x.com", ts);
        m.references = parent.iter().map(|s| s.to_string()).collect();
        m
    }

    fn partition_ids(msgs: &[MessageRecord]) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<String>> = builder()
            .partition(msgs)
            .into_iter()
            .map(|(_, members)| {
                let mut ids: Vec<String> = members.iter().map(|&i| msgs[i].id.clone()).collect();
                ids.sort();
                ids
            })
            .collect();
        groups.sort();
        groups
    }

    #[test]
    fn test_normalize_subject() {
        assert_eq!(normalize_subject("Re: RE: Fwd:  Plans  for   Q3"), "plans for q3");
        assert_eq!(normalize_subject("[team] Re: [ops] Outage"), "outage");
        assert_eq!(normalize_subject("Aw: Fw: hello"), "hello");
        assert_eq!(normalize_subject("Regarding the plan"), "regarding the plan");
        assert_eq!(normalize_subject("   "), "");
    }

    #[test]
    fn test_reply_chain_forms_one_ordered_thread() {
        let (_dir, clock, store) = open_store();
        let t = clock.now() - Duration::hours(3);
        let a = message("A", "INBOX", "Plans", "a@x.com", t);
        let b = reply("B", &["A"], t + Duration::hours(1));
        let c = reply("C", &["B"], t + Duration::hours(2));

        // Arrive out of order, one batch each.
        for msg in [c, a, b] {
            store
                .write(|txn| {
                    let id = msg.id.clone();
                    txn.upsert_message(msg)?;
                    builder().rebuild(txn, &BTreeSet::from([id]), &BTreeSet::new())
                })
                .unwrap();
        }

        let threads = store.all_threads().unwrap();
        assert_eq!(threads.len(), 1, "{:?}", threads);
        let thread = &threads[0];
        assert_eq!(thread.thread_id, "A");
        assert_eq!(thread.message_count, 3);
        assert_eq!(thread.message_ids, vec!["A", "B", "C"]);
        assert_eq!(thread.subject, "Plans");
        assert_eq!(thread.avg_response_time, Some(3600.0));
        assert!(thread.active);
        assert!(thread.participants.contains("a@x.com"));
        assert!(thread.participants.contains("b@x.com"));

        let b = store.get_message("B").unwrap().unwrap();
        assert_eq!(b.thread_id, "A");
        assert_eq!(b.response_time, Some(3600.0));
        assert_eq!(store.get_message("A").unwrap().unwrap().response_time, None);
    }

    #[test]
    fn test_partition_is_order_independent() {
        let t = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let msgs = vec![
            message("a1", "INBOX", "Budget", "a@x.com", t),
            reply("a2", &["a1"], t + Duration::minutes(5)),
            reply("a3", &["a2", "a1"], t + Duration::minutes(9)),
            message("b1", "INBOX", "Lunch?", "c@x.com", t + Duration::minutes(1)),
            message("b2", "INBOX", "RE: lunch?", "d@x.com", t + Duration::minutes(2)),
            reply("x9", &["zz-missing"], t + Duration::minutes(3)),
            reply("x8", &["zz-missing"], t + Duration::minutes(4)),
            message("solo", "INBOX", "Standalone", "e@x.com", t),
        ];
        let expected = partition_ids(&msgs);
        assert_eq!(expected.len(), 4, "{:?}", expected);

        let orders: [[usize; 8]; 4] = [
            [7, 6, 5, 4, 3, 2, 1, 0],
            [2, 0, 5, 1, 7, 3, 6, 4],
            [4, 6, 1, 3, 0, 7, 2, 5],
            [5, 4, 3, 2, 1, 0, 7, 6],
        ];
        for order in orders {
            let shuffled: Vec<MessageRecord> = order.iter().map(|&i| msgs[i].clone()).collect();
            assert_eq!(partition_ids(&shuffled), expected);
        }
    }

    #[test]
    fn test_merge_keeps_lower_id_and_is_irreversible() {
        let (_dir, clock, store) = open_store();
        let t = clock.now() - Duration::hours(2);
        let b = builder();
        store
            .write(|txn| {
                txn.upsert_message(message("m5", "INBOX", "First", "a@x.com", t))?;
                txn.upsert_message(message("m2", "INBOX", "Second", "b@x.com", t))?;
                b.rebuild_all(txn)
            })
            .unwrap();
        assert_eq!(store.all_threads().unwrap().len(), 2);

        // Bridges both threads.
        let bridge = reply("m9", &["m5", "m2"], t + Duration::minutes(1));
        store
            .write(|txn| {
                txn.upsert_message(bridge)?;
                b.rebuild(txn, &BTreeSet::from(["m9".to_string()]), &BTreeSet::new())
            })
            .unwrap();
        let threads = store.all_threads().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread_id, "m2");

        // Dropping the bridge does not split the thread again.
        store
            .write(|txn| {
                let removed = txn.delete_messages(&["m9".to_string()])?;
                let touched: BTreeSet<String> =
                    removed.into_iter().map(|m| m.thread_id).collect();
                b.rebuild(txn, &BTreeSet::new(), &touched)
            })
            .unwrap();
        let threads = store.all_threads().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].message_ids, vec!["m2", "m5"]);
    }

    #[test]
    fn test_thread_members_with_and_without_record() {
        let (_dir, clock, store) = open_store();
        let t = clock.now();
        let b = builder();
        store
            .write(|txn| {
                txn.upsert_message(message("A", "INBOX", "Plans", "a@x.com", t))?;
                txn.upsert_message(reply("B", &["A"], t + Duration::minutes(1)))?;
                b.rebuild_all(txn)?;
                txn.upsert_message(message("S", "INBOX", "Solo", "s@x.com", t))?;

                let ids = BTreeSet::from(["A".to_string(), "S".to_string()]);
                let members = thread_members(txn, &ids)?;
                let ids_of = |tid: &str| -> Vec<String> {
                    members[tid].iter().map(|m| m.id.clone()).collect()
                };
                assert_eq!(ids_of("A"), vec!["A", "B"]);
                // No record for S yet: found by scanning.
                assert_eq!(ids_of("S"), vec!["S"]);
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_empty_thread_is_removed() {
        let (_dir, clock, store) = open_store();
        let t = clock.now();
        let b = builder();
        store
            .write(|txn| {
                txn.upsert_message(message("only", "INBOX", "Hi", "a@x.com", t))?;
                b.rebuild_all(txn)
            })
            .unwrap();
        assert!(store.get_thread("only").unwrap().is_some());
        store
            .write(|txn| {
                txn.delete_messages(&["only".to_string()])?;
                b.rebuild(txn, &BTreeSet::new(), &BTreeSet::from(["only".to_string()]))
            })
            .unwrap();
        assert!(store.get_thread("only").unwrap().is_none());
    }

    #[test]
    fn test_subject_fallback_when_references_unresolved() {
        let t = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let a = message("a", "INBOX", "Weekly report", "a@x.com", t);
        let b = message("b", "INBOX", "Re: Weekly report", "b@x.com", t);
        // Parent never cached.
        let mut c = message("c", "INBOX", "Re: Weekly report", "c@x.com", t);
        c.references = vec!["elsewhere".into()];
        // Parent cached: the reference wins over the subject.
        let x = message("x", "INBOX", "Quarterly numbers", "x@x.com", t);
        let mut d = message("d", "INBOX", "Re: Weekly report", "d@x.com", t);
        d.references = vec!["elsewhere".into(), "x".into()];
        let groups = partition_ids(&[a, b, c, x, d]);
        assert_eq!(
            groups,
            vec![
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
                vec!["d".to_string(), "x".to_string()],
            ]
        );
    }

    #[test]
    fn test_disabled_analysis_keeps_provider_threads_only() {
        let config = AnalysisConfig {
            thread_analysis: false,
            ..AnalysisConfig::default()
        };
        let t = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let a = message("a", "INBOX", "Same", "a@x.com", t);
        let mut b = reply("b", &["a"], t);
        b.provider_thread_id = Some("T1".into());
        let mut c = message("c", "INBOX", "Same", "c@x.com", t);
        c.provider_thread_id = Some("T1".into());
        let groups = ThreadGraphBuilder::new(&config).partition(&[a, b, c]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "T1");
    }

    #[test]
    fn test_category_mode_and_importance_mean() {
        let t = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let mut msgs = Vec::new();
        for (i, cat) in ["work", "personal", "personal", "work"].iter().enumerate() {
            let mut m = message(&format!("m{}", i), "INBOX", "x", "a@x.com", t + Duration::seconds(i as i64));
            m.category = Some(cat.to_string());
            m.importance = Some(i as f64 / 10.0);
            msgs.push(m);
        }
        let record = builder().summarize("m0", &msgs, t + Duration::days(40));
        assert_eq!(record.category.as_deref(), Some("personal"));
        assert!((record.importance.unwrap() - 0.15).abs() < 1e-9);
        assert!(!record.active);
    }
}
