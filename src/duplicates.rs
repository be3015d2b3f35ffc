use crate::cache::{CacheStore, MessageFilter};
use crate::config::AnalysisConfig;
use crate::error::StoreError;
use crate::models::MessageRecord;
use crate::threads::normalize_subject;
use chrono::Duration;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hex characters of the content hash kept in a fingerprint.
const CONTENT_HASH_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub fingerprint: String,
    pub folder: String,
    /// Newest first.
    pub message_ids: Vec<String>,
}

/// `None` when there is no content to hash; such messages never group.
pub fn fingerprint(msg: &MessageRecord) -> Option<String> {
    let content = msg.preview.trim();
    if content.is_empty() {
        return None;
    }
    let digest = Sha256::digest(content.as_bytes());
    let hash: String = digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
        .chars()
        .take(CONTENT_HASH_LEN)
        .collect();
    Some(format!(
        "{}|{}|{}",
        normalize_subject(&msg.subject),
        msg.sender_address(),
        hash
    ))
}

pub struct DuplicateDetector {
    window: Duration,
}

impl DuplicateDetector {
    pub fn new(config: &AnalysisConfig) -> Self {
        DuplicateDetector {
            window: config.duplicate_window,
        }
    }

    /// Group messages that share a fingerprint within one folder. Each
    /// group spans at most the configured window; copies further apart are
    /// recurring mail, not duplicates.
    pub fn detect(&self, messages: &[MessageRecord]) -> Vec<DuplicateGroup> {
        let mut buckets: BTreeMap<(String, String), Vec<&MessageRecord>> = BTreeMap::new();
        for msg in messages {
            if let Some(fp) = fingerprint(msg) {
                buckets.entry((msg.folder.clone(), fp)).or_default().push(msg);
            }
        }

        let mut groups = Vec::new();
        for ((folder, fp), mut members) in buckets {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|a, b| (b.timestamp, &b.id).cmp(&(a.timestamp, &a.id)));

            let mut cluster: Vec<&MessageRecord> = Vec::new();
            for msg in members {
                let fits = cluster
                    .first()
                    .map_or(true, |head| head.timestamp - msg.timestamp <= self.window);
                if !fits {
                    push_group(&mut groups, &folder, &fp, &cluster);
                    cluster.clear();
                }
                cluster.push(msg);
            }
            push_group(&mut groups, &folder, &fp, &cluster);
        }
        groups
    }

    /// Duplicate groups among live cached messages, optionally one folder.
    pub fn find(
        &self,
        store: &CacheStore,
        folder: Option<&str>,
    ) -> Result<Vec<DuplicateGroup>, StoreError> {
        let filter = MessageFilter {
            folder: folder.map(str::to_string),
            ..Default::default()
        };
        let messages = store
            .query_messages(filter)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.detect(&messages))
    }
}

fn push_group(
    groups: &mut Vec<DuplicateGroup>,
    folder: &str,
    fp: &str,
    cluster: &[&MessageRecord],
) {
    if cluster.len() >= 2 {
        groups.push(DuplicateGroup {
            fingerprint: fp.to_string(),
            folder: folder.to_string(),
            message_ids: cluster.iter().map(|m| m.id.clone()).collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::message;
    use chrono::{DateTime, Utc};

    fn copy(id: &str, ts: DateTime<Utc>) -> MessageRecord {
        let mut m = message(id, "INBOX", "Invoice #42", "Billing <billing@shop.com>", ts);
        m.preview = "Your invoice is attached.".into();
        m
    }

    fn detector() -> DuplicateDetector {
        DuplicateDetector::new(&AnalysisConfig::default())
    }

    #[test]
    fn test_one_hour_apart_is_duplicate() {
        let t = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let groups = detector().detect(&[copy("a", t), copy("b", t + Duration::hours(1))]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].message_ids, vec!["b", "a"]);
        assert_eq!(groups[0].folder, "INBOX");
    }

    #[test]
    fn test_two_days_apart_is_recurring() {
        let t = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let groups = detector().detect(&[copy("a", t), copy("b", t + Duration::hours(48))]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_groups_never_span_more_than_window() {
        let t = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let msgs: Vec<_> = (0..10)
            .map(|i| copy(&format!("m{}", i), t + Duration::hours(i * 7)))
            .collect();
        let by_id: BTreeMap<&str, DateTime<Utc>> =
            msgs.iter().map(|m| (m.id.as_str(), m.timestamp)).collect();
        let groups = detector().detect(&msgs);
        assert!(!groups.is_empty());
        for group in &groups {
            let newest = by_id[group.message_ids.first().unwrap().as_str()];
            let oldest = by_id[group.message_ids.last().unwrap().as_str()];
            assert!(newest - oldest <= Duration::hours(24), "{:?}", group);
        }
    }

    #[test]
    fn test_folder_and_content_separate_groups() {
        let t = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let mut other_folder = copy("c", t);
        other_folder.folder = "Archive".into();
        let mut other_body = copy("d", t);
        other_body.preview = "Different text".into();
        let groups = detector().detect(&[copy("a", t), other_folder, other_body]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_missing_content_is_skipped() {
        let t = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let mut a = copy("a", t);
        let mut b = copy("b", t);
        a.preview.clear();
        b.preview = "   ".into();
        assert!(fingerprint(&a).is_none());
        assert!(detector().detect(&[a, b]).is_empty());
    }
}
