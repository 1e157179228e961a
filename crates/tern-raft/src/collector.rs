//! Leader-side gathering of edits that a majority of members hold.
//!
//! # Process
//!
//! 1. Ask every member for up to `max_records_per_collect` records from its
//!    start sequence, in parallel, waiting at most `rpc_timeout`.
//! 2. Fewer than `N/2 + 1` answers: nothing is committed this round.
//! 3. Digest every record with SHA-1 and count how many distinct members
//!    returned each digest. A digest held by more than `N/2` members (of the
//!    whole membership, not of the respondents) is consensus.
//! 4. Emit consensus payloads walking members in sorted order and their
//!    records in sequence order, keeping the first occurrence of each digest.
//! 5. Report, per member, the sequence of its last consensus record so the
//!    leader can trim queues up to it.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::multicast::Multicast;
use crate::rpc::{RecordsReply, RegionTransport};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tern_core::ServerName;

type RecordDigest = [u8; 20];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectResult {
    /// Consensus payloads, deduplicated, in emission order.
    pub records: Vec<Vec<u8>>,
    /// Sequence of the last consensus record per member.
    pub ends: BTreeMap<ServerName, u64>,
    /// Members that answered `ok = false`, typically because their queue
    /// was trimmed past the requested start.
    pub rejected: Vec<ServerName>,
}

impl CollectResult {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct EditCollector {
    transport: Arc<dyn RegionTransport>,
    config: RaftConfig,
}

impl EditCollector {
    pub fn new(transport: Arc<dyn RegionTransport>, config: RaftConfig) -> Self {
        Self { transport, config }
    }

    /// `starts` holds every member of the region and where to read from.
    pub async fn collect(
        &self,
        region: &str,
        starts: &BTreeMap<ServerName, u64>,
    ) -> Result<CollectResult> {
        let members = starts.len();
        let majority = members / 2 + 1;
        let max = self.config.max_records_per_collect;

        let calls = starts.iter().map(|(member, &start)| {
            let transport = self.transport.clone();
            let member = member.clone();
            let region = region.to_string();
            let key = member.clone();
            (key, async move {
                transport.get_n_records(&member, &region, start, max).await
            })
        });
        let mut multicast = Multicast::spawn(calls);
        let replies = multicast.wait_all(self.config.rpc_timeout()).await;
        multicast.close();

        let mut result = CollectResult::default();
        let mut answered: BTreeMap<ServerName, RecordsReply> = BTreeMap::new();
        for (member, reply) in replies {
            match reply {
                Ok(reply) if reply.ok => {
                    answered.insert(member, reply);
                }
                Ok(_) => result.rejected.push(member),
                Err(e) => {
                    tracing::debug!(region, member = %member, error = %e, "collect call failed");
                }
            }
        }
        result.rejected.sort();

        if answered.len() < majority {
            tracing::debug!(
                region,
                respondents = answered.len(),
                members,
                "too few respondents to collect"
            );
            return Ok(result);
        }

        let digested = digest_replies(&answered)?;
        let counts = count_members(&digested);
        let is_consensus = |d: &RecordDigest| counts.get(d).copied().unwrap_or(0) > members / 2;

        let mut emitted = HashSet::new();
        for (member, digests) in &digested {
            let Some(reply) = answered.get(member) else {
                continue;
            };
            let mut end = None;
            for (i, (digest, payload)) in digests.iter().zip(&reply.records).enumerate() {
                if !is_consensus(digest) {
                    continue;
                }
                end = Some(reply.start_sequence + i as u64);
                if emitted.insert(*digest) {
                    result.records.push(payload.clone());
                }
            }
            if let Some(end) = end {
                result.ends.insert(member.clone(), end);
            }
        }

        tracing::debug!(
            region,
            respondents = answered.len(),
            records = result.records.len(),
            "collected edits"
        );
        Ok(result)
    }
}

/// Digests per member, checking that equal digests carry equal bytes.
fn digest_replies(
    answered: &BTreeMap<ServerName, RecordsReply>,
) -> Result<BTreeMap<ServerName, Vec<RecordDigest>>> {
    let mut seen: HashMap<RecordDigest, &[u8]> = HashMap::new();
    let mut out = BTreeMap::new();
    for (member, reply) in answered {
        let mut digests = Vec::with_capacity(reply.records.len());
        for record in &reply.records {
            let digest = record_digest(record);
            match seen.get(&digest) {
                Some(prev) if *prev != record.as_slice() => {
                    return Err(RaftError::Protocol(format!(
                        "digest collision between records from {member}"
                    )));
                }
                Some(_) => {}
                None => {
                    seen.insert(digest, record);
                }
            }
            digests.push(digest);
        }
        out.insert(member.clone(), digests);
    }
    Ok(out)
}

fn record_digest(record: &[u8]) -> RecordDigest {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(record));
    out
}

/// Number of distinct members holding each digest.
fn count_members(digested: &BTreeMap<ServerName, Vec<RecordDigest>>) -> HashMap<RecordDigest, usize> {
    let mut counts = HashMap::new();
    for digests in digested.values() {
        let distinct: HashSet<&RecordDigest> = digests.iter().collect();
        for digest in distinct {
            *counts.entry(*digest).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RegionRequest, RegionResponse};
    use async_trait::async_trait;

    /// Answers `GetNRecords` from fixed per-member queues.
    struct FixedQueues {
        queues: HashMap<ServerName, (u64, Vec<&'static str>)>,
    }

    #[async_trait]
    impl RegionTransport for FixedQueues {
        async fn call(&self, target: &ServerName, request: RegionRequest) -> Result<RegionResponse> {
            let RegionRequest::GetNRecords { start_sequence, n, .. } = request else {
                return Err(RaftError::Protocol("unexpected request".into()));
            };
            let (first, records) = self
                .queues
                .get(target)
                .ok_or_else(|| RaftError::Transport(format!("{target} down")))?;
            let start = if start_sequence == 0 { *first } else { start_sequence };
            if start < *first {
                return Ok(RegionResponse::GetNRecords(RecordsReply::rejected()));
            }
            let records = records
                .iter()
                .skip((start - first) as usize)
                .take(n as usize)
                .map(|r| r.as_bytes().to_vec())
                .collect();
            Ok(RegionResponse::GetNRecords(RecordsReply {
                ok: true,
                start_sequence: start,
                records,
            }))
        }
    }

    fn member(n: u16) -> ServerName {
        ServerName::new("m", n)
    }

    fn collector(queues: Vec<(u16, u64, Vec<&'static str>)>) -> EditCollector {
        let queues = queues
            .into_iter()
            .map(|(m, first, records)| (member(m), (first, records)))
            .collect();
        EditCollector::new(Arc::new(FixedQueues { queues }), RaftConfig::default())
    }

    fn starts(members: &[u16]) -> BTreeMap<ServerName, u64> {
        members.iter().map(|&m| (member(m), 0)).collect()
    }

    fn strings(records: &[Vec<u8>]) -> Vec<String> {
        records
            .iter()
            .map(|r| String::from_utf8(r.clone()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_majority_records_only() {
        let c = collector(vec![
            (1, 1, vec!["a", "b", "x"]),
            (2, 1, vec!["b", "a"]),
            (3, 5, vec!["a", "y"]),
        ]);
        let result = c.collect("r", &starts(&[1, 2, 3])).await.unwrap();

        assert_eq!(strings(&result.records), vec!["a", "b"]);
        assert_eq!(result.ends.get(&member(1)), Some(&2));
        assert_eq!(result.ends.get(&member(2)), Some(&2));
        assert_eq!(result.ends.get(&member(3)), Some(&5));
        assert!(result.rejected.is_empty());
    }

    #[tokio::test]
    async fn test_single_holder_is_not_consensus_with_two_respondents() {
        // Member 3 is down; "solo" is held by one of three members.
        let c = collector(vec![(1, 1, vec!["solo", "both"]), (2, 1, vec!["both"])]);
        let result = c.collect("r", &starts(&[1, 2, 3])).await.unwrap();

        assert_eq!(strings(&result.records), vec!["both"]);
        assert_eq!(result.ends.get(&member(1)), Some(&2));
        assert_eq!(result.ends.get(&member(2)), Some(&1));
        assert!(!result.ends.contains_key(&member(3)));
    }

    #[tokio::test]
    async fn test_too_few_respondents_commits_nothing() {
        let c = collector(vec![(1, 1, vec!["a"])]);
        let result = c.collect("r", &starts(&[1, 2, 3])).await.unwrap();
        assert!(result.is_empty());
        assert!(result.ends.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_payload_counts_once_per_member() {
        let c = collector(vec![(1, 1, vec!["dup", "dup"]), (2, 1, vec!["other"]), (3, 1, vec![])]);
        let result = c.collect("r", &starts(&[1, 2, 3])).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_members_are_reported() {
        let c = collector(vec![(1, 1, vec!["a"]), (2, 1, vec!["a"]), (3, 9, vec!["a"])]);
        let mut from = starts(&[1, 2, 3]);
        from.insert(member(3), 4);
        let result = c.collect("r", &from).await.unwrap();

        assert_eq!(strings(&result.records), vec!["a"]);
        assert_eq!(result.rejected, vec![member(3)]);
        assert_eq!(result.ends.len(), 2);
    }

    #[test]
    fn test_count_members_uses_distinct_digests() {
        let d1 = record_digest(b"one");
        let d2 = record_digest(b"two");
        let mut digested = BTreeMap::new();
        digested.insert(member(1), vec![d1, d1, d2]);
        digested.insert(member(2), vec![d1]);
        let counts = count_members(&digested);
        assert_eq!(counts[&d1], 2);
        assert_eq!(counts[&d2], 1);
    }
}
