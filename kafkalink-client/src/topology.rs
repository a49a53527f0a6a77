//! Topic/partition to leader mapping
//!
//! Entries are replaced wholesale by every applied metadata response; nothing is
//! merged. The cache lock is only held while the maps are mutated, never across
//! network I/O.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::profile::BrokerKey;
use crate::protocol::{MetadataResponse, NodeId};

/// Current leader of one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEntry {
    pub topic: String,
    pub partition: i32,
    pub leader: BrokerKey,
    /// Refresh generation that produced this entry
    pub epoch: u64,
}

/// What an applied metadata response changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyChange {
    pub brokers_added: Vec<BrokerKey>,
    pub brokers_removed: Vec<BrokerKey>,
    pub entries_updated: usize,
    /// Entries of undescribed topics dropped because their leader left
    pub entries_orphaned: usize,
    pub unknown_topics: Vec<String>,
}

impl TopologyChange {
    /// Whether any broker joined or left
    pub fn brokers_changed(&self) -> bool {
        !self.brokers_added.is_empty() || !self.brokers_removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct TopologyState {
    generation: u64,
    leaders: HashMap<(String, i32), TopologyEntry>,
    partitions: BTreeMap<String, Vec<i32>>,
    brokers: BTreeMap<NodeId, BrokerKey>,
}

#[derive(Debug, Default)]
pub struct TopologyCache {
    state: RwLock<TopologyState>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leader currently believed responsible for `topic`/`partition`
    pub fn lookup(&self, topic: &str, partition: i32) -> Option<BrokerKey> {
        self.state
            .read()
            .leaders
            .get(&(topic.to_string(), partition))
            .map(|entry| entry.leader.clone())
    }

    /// Full entry for `topic`/`partition`, including its epoch
    pub fn entry(&self, topic: &str, partition: i32) -> Option<TopologyEntry> {
        self.state
            .read()
            .leaders
            .get(&(topic.to_string(), partition))
            .cloned()
    }

    /// Replace the entries for every pair in `entries`; other pairs are untouched
    pub fn update<I>(&self, entries: I)
    where
        I: IntoIterator<Item = TopologyEntry>,
    {
        let mut state = self.state.write();
        for entry in entries {
            let partitions = state.partitions.entry(entry.topic.clone()).or_default();
            if let Err(pos) = partitions.binary_search(&entry.partition) {
                partitions.insert(pos, entry.partition);
            }
            state
                .leaders
                .insert((entry.topic.clone(), entry.partition), entry);
        }
    }

    /// Apply a decoded metadata response as one refresh generation.
    ///
    /// The broker set is replaced by the one in the response. For every topic
    /// described, its partition list is replaced; partitions without a usable
    /// leader lose their entry, and topics the broker does not know are
    /// forgotten entirely. Entries led by a broker that is no longer in the
    /// broker set are dropped even when their topic is not described.
    pub fn apply_metadata(&self, response: &MetadataResponse) -> TopologyChange {
        let mut brokers = BTreeMap::new();
        for broker in &response.brokers {
            match u16::try_from(broker.port) {
                Ok(port) if port != 0 => {
                    brokers.insert(broker.node_id, BrokerKey::new(&broker.host, port));
                }
                _ => warn!(
                    "Ignoring broker {} with invalid port {}",
                    broker.node_id, broker.port
                ),
            }
        }

        let mut state = self.state.write();
        state.generation += 1;
        let epoch = state.generation;
        let mut change = TopologyChange::default();

        let old: BTreeSet<_> = state.brokers.values().cloned().collect();
        let new: BTreeSet<_> = brokers.values().cloned().collect();
        change.brokers_added = new.difference(&old).cloned().collect();
        change.brokers_removed = old.difference(&new).cloned().collect();
        state.brokers = brokers;

        if !change.brokers_removed.is_empty() {
            let before = state.leaders.len();
            let removed = &change.brokers_removed;
            state
                .leaders
                .retain(|_, entry| !removed.contains(&entry.leader));
            change.entries_orphaned = before - state.leaders.len();
            if change.entries_orphaned > 0 {
                debug!(
                    "Dropped {} leader entries of departed brokers {:?}",
                    change.entries_orphaned, removed
                );
            }
        }

        for topic in &response.topics {
            let topic_error = ErrorCode::from(topic.error_code);
            if matches!(
                topic_error,
                ErrorCode::UnknownTopicOrPartition | ErrorCode::InvalidTopic
            ) {
                debug!("Topic '{}' reported as {:?}", topic.name, topic_error);
                state.leaders.retain(|(name, _), _| name != &topic.name);
                state.partitions.remove(&topic.name);
                change.unknown_topics.push(topic.name.clone());
                continue;
            }

            let mut ids: Vec<i32> = topic.partitions.iter().map(|p| p.id).collect();
            ids.sort_unstable();
            ids.dedup();
            state
                .leaders
                .retain(|(name, id), _| name != &topic.name || ids.binary_search(id).is_ok());
            state.partitions.insert(topic.name.clone(), ids);

            for partition in &topic.partitions {
                let key = (topic.name.clone(), partition.id);
                let leader = state.brokers.get(&partition.leader).cloned();
                match leader {
                    Some(leader) if partition.leader >= 0 => {
                        state.leaders.insert(
                            key,
                            TopologyEntry {
                                topic: topic.name.clone(),
                                partition: partition.id,
                                leader,
                                epoch,
                            },
                        );
                        change.entries_updated += 1;
                    }
                    _ => {
                        debug!(
                            "No leader for {}:{} (leader {}, error {})",
                            topic.name, partition.id, partition.leader, partition.error_code
                        );
                        state.leaders.remove(&key);
                    }
                }
            }
        }

        change
    }

    /// Known partition ids of `topic`, sorted
    pub fn partitions_for(&self, topic: &str) -> Option<Vec<i32>> {
        self.state.read().partitions.get(topic).cloned()
    }

    /// Whether metadata for `topic` has been applied
    pub fn contains_topic(&self, topic: &str) -> bool {
        self.state.read().partitions.contains_key(topic)
    }

    /// Known topics, sorted
    pub fn topics(&self) -> Vec<String> {
        self.state.read().partitions.keys().cloned().collect()
    }

    /// Brokers reported by the most recent metadata response
    pub fn brokers(&self) -> Vec<BrokerKey> {
        self.state.read().brokers.values().cloned().collect()
    }

    /// Key of the broker with `node_id`
    pub fn broker(&self, node_id: NodeId) -> Option<BrokerKey> {
        self.state.read().brokers.get(&node_id).cloned()
    }

    /// Whether `key` is in the current broker set
    pub fn knows_broker(&self, key: &BrokerKey) -> bool {
        self.state.read().brokers.values().any(|b| b == key)
    }

    /// Forget everything cached about `topics`
    pub fn remove_topics<S: AsRef<str>>(&self, topics: &[S]) {
        let mut state = self.state.write();
        for topic in topics {
            let topic = topic.as_ref();
            state.partitions.remove(topic);
            state.leaders.retain(|(name, _), _| name != topic);
        }
    }

    /// Number of metadata responses applied so far
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Number of partitions with a known leader
    pub fn len(&self) -> usize {
        self.state.read().leaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().leaders.is_empty()
    }
}
