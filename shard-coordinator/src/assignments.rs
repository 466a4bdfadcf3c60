use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

/// A node address, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One partition of one topic; the unit of assignment and of ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionId {
    pub topic: String,
    pub partition: u32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// Immutable snapshot of which node owns which partitions of the tracked
/// topic. A partition missing from every host is mid-rebalance; it will show
/// up again in a later snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionAssignments {
    by_host: BTreeMap<HostPort, BTreeSet<PartitionId>>,
}

/// Assignment changes between two snapshots, keyed by host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentDiff {
    pub added: BTreeMap<HostPort, BTreeSet<PartitionId>>,
    pub revoked: BTreeMap<HostPort, BTreeSet<PartitionId>>,
}

impl PartitionAssignments {
    pub fn new(by_host: BTreeMap<HostPort, BTreeSet<PartitionId>>) -> Self {
        Self { by_host }
    }

    /// Restrict a raw mapping to the tracked topic. Everything else in the
    /// feed (other topics the group happens to consume) is not ours to route.
    pub fn for_topic(by_host: BTreeMap<HostPort, BTreeSet<PartitionId>>, topic: &str) -> Self {
        let by_host = by_host
            .into_iter()
            .map(|(host, partitions)| {
                (
                    host,
                    partitions.into_iter().filter(|p| p.topic == topic).collect(),
                )
            })
            .collect();
        Self { by_host }
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.values().all(|p| p.is_empty())
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostPort> {
        self.by_host.keys()
    }

    pub fn partitions_for(&self, host: &HostPort) -> BTreeSet<PartitionId> {
        self.by_host.get(host).cloned().unwrap_or_default()
    }

    /// The derived partition → host view. Each partition belongs to at most
    /// one host; if a malformed feed claims otherwise, the first host in
    /// address order wins.
    pub fn owner_of(&self, partition: &PartitionId) -> Option<&HostPort> {
        self.by_host
            .iter()
            .find(|(_, partitions)| partitions.contains(partition))
            .map(|(host, _)| host)
    }

    pub fn all_partitions(&self) -> BTreeSet<PartitionId> {
        self.by_host.values().flatten().cloned().collect()
    }

    /// What changed relative to `previous`, per host.
    pub fn diff(&self, previous: &PartitionAssignments) -> AssignmentDiff {
        let mut diff = AssignmentDiff::default();

        for (host, partitions) in &self.by_host {
            let before = previous.partitions_for(host);
            let added: BTreeSet<_> = partitions.difference(&before).cloned().collect();
            if !added.is_empty() {
                diff.added.insert(host.clone(), added);
            }
            let revoked: BTreeSet<_> = before.difference(partitions).cloned().collect();
            if !revoked.is_empty() {
                diff.revoked.insert(host.clone(), revoked);
            }
        }

        // Hosts that disappeared entirely lose everything they had
        for (host, before) in &previous.by_host {
            if !self.by_host.contains_key(host) && !before.is_empty() {
                diff.revoked.insert(host.clone(), before.clone());
            }
        }

        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignments(entries: &[(&str, u16, &[u32])]) -> PartitionAssignments {
        let mut by_host = BTreeMap::new();
        for (host, port, partitions) in entries {
            by_host.insert(
                HostPort::new(*host, *port),
                partitions
                    .iter()
                    .map(|p| PartitionId::new("aggregate_events", *p))
                    .collect(),
            );
        }
        PartitionAssignments::new(by_host)
    }

    #[test]
    fn owner_lookup() {
        let snapshot = assignments(&[("a", 9001, &[0, 1]), ("b", 9002, &[2])]);
        assert_eq!(
            snapshot.owner_of(&PartitionId::new("aggregate_events", 2)),
            Some(&HostPort::new("b", 9002))
        );
        assert_eq!(
            snapshot.owner_of(&PartitionId::new("aggregate_events", 3)),
            None
        );
    }

    #[test]
    fn diff_reports_moves_by_host() {
        let before = assignments(&[("a", 9001, &[0, 1]), ("b", 9002, &[2])]);
        let after = assignments(&[("a", 9001, &[0, 1, 2]), ("b", 9002, &[])]);

        let diff = after.diff(&before);
        assert_eq!(
            diff.added.get(&HostPort::new("a", 9001)),
            Some(
                &[PartitionId::new("aggregate_events", 2)]
                    .into_iter()
                    .collect()
            )
        );
        assert_eq!(
            diff.revoked.get(&HostPort::new("b", 9002)),
            Some(
                &[PartitionId::new("aggregate_events", 2)]
                    .into_iter()
                    .collect()
            )
        );
        assert!(!diff.added.contains_key(&HostPort::new("b", 9002)));
    }

    #[test]
    fn diff_handles_departed_host() {
        let before = assignments(&[("a", 9001, &[0]), ("b", 9002, &[1, 2])]);
        let after = assignments(&[("a", 9001, &[0, 1, 2])]);

        let diff = after.diff(&before);
        assert_eq!(
            diff.revoked.get(&HostPort::new("b", 9002)).unwrap().len(),
            2
        );
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let snapshot = assignments(&[("a", 9001, &[0, 1])]);
        let diff = snapshot.diff(&snapshot.clone());
        assert!(diff.added.is_empty());
        assert!(diff.revoked.is_empty());
    }

    #[test]
    fn other_topics_are_filtered_out() {
        let mut by_host = BTreeMap::new();
        by_host.insert(
            HostPort::new("a", 9001),
            [
                PartitionId::new("aggregate_events", 0),
                PartitionId::new("unrelated", 0),
            ]
            .into_iter()
            .collect(),
        );
        let snapshot = PartitionAssignments::for_topic(by_host, "aggregate_events");
        assert_eq!(
            snapshot.all_partitions(),
            [PartitionId::new("aggregate_events", 0)].into_iter().collect()
        );
    }
}
