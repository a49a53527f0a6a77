//! Broker pool: one socket channel per broker endpoint
//!
//! Entries are keyed strictly by [`BrokerKey`]. A failed channel is never
//! repaired in place; its entry is swapped for a fresh channel under the map's
//! per-key lock, so there is never more than one live channel for a broker.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::connection::{ChannelEvent, ChannelSettings, ChannelState, SocketChannel};
use crate::error::KafkalinkClientError;
use crate::profile::{BrokerKey, ConnectionProfile, ProfileRegistry};
use crate::topology::{TopologyCache, TopologyChange};
use crate::Result;

pub struct BrokerPool {
    registry: ProfileRegistry,
    topology: Arc<TopologyCache>,
    seeds: Vec<BrokerKey>,
    channels: DashMap<BrokerKey, Arc<SocketChannel>>,
    /// Consecutive failed connections per broker, reset on connect
    failures: DashMap<BrokerKey, u32>,
    settings: Arc<ChannelSettings>,
    retry: RetryConfig,
    events: mpsc::UnboundedSender<ChannelEvent>,
    next_seed: AtomicUsize,
    closed: AtomicBool,
}

impl BrokerPool {
    /// Create a pool for `seeds`. Lifecycle events of every channel the pool
    /// creates are delivered to the returned receiver, which the owner must
    /// feed back through [`BrokerPool::handle_event`].
    pub fn new(
        seeds: &[(String, u16)],
        registry: ProfileRegistry,
        topology: Arc<TopologyCache>,
        settings: Arc<ChannelSettings>,
        retry: RetryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let mut keys = Vec::with_capacity(seeds.len());
        for (host, port) in seeds {
            let key = registry.resolve(host, *port).key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let pool = Self {
            registry,
            topology,
            seeds: keys,
            channels: DashMap::new(),
            failures: DashMap::new(),
            settings,
            retry,
            events,
            next_seed: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };
        (pool, events_rx)
    }

    /// Start dialing every seed broker
    pub fn connect_seeds(&self) -> Result<()> {
        for key in &self.seeds {
            self.get_channel(key)?;
        }
        info!("Dialing {} seed brokers", self.seeds.len());
        Ok(())
    }

    /// The live channel for `key`, dialing a new one when there is none or the
    /// current one has failed
    pub fn get_channel(&self, key: &BrokerKey) -> Result<Arc<SocketChannel>> {
        self.ensure_open()?;
        let profile = self.profile_for(key)?;

        match self.channels.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live() {
                    return Ok(entry.get().clone());
                }
                debug!("Replacing {:?} channel for {}", entry.get().state(), key);
                let channel = self.spawn_channel(profile, 0, Duration::ZERO);
                entry.insert(channel.clone());
                Ok(channel)
            }
            Entry::Vacant(entry) => {
                let channel = self.spawn_channel(profile, 0, Duration::ZERO);
                entry.insert(channel.clone());
                Ok(channel)
            }
        }
    }

    /// Replace the channel `failed_channel_id` of `key` with a new one that
    /// dials after the backoff delay. Does nothing if the entry already holds
    /// a different channel. Brokers that are neither seeds nor part of the
    /// current topology are dropped instead.
    pub fn reconnect(&self, key: &BrokerKey, failed_channel_id: u64) -> Option<Arc<SocketChannel>> {
        if self.is_closed() {
            return None;
        }

        if !self.is_referenced(key) {
            if self
                .channels
                .remove_if(key, |_, channel| channel.id() == failed_channel_id)
                .is_some()
            {
                self.failures.remove(key);
                info!("Broker {} left the cluster, not reconnecting", key);
            }
            return None;
        }

        let profile = self.profile_for(key).ok()?;
        match self.channels.entry(key.clone()) {
            Entry::Occupied(mut entry) if entry.get().id() == failed_channel_id => {
                let attempt = {
                    let mut failures = self.failures.entry(key.clone()).or_insert(0);
                    *failures = failures.saturating_add(1);
                    *failures
                };
                let delay = self.retry.backoff(attempt);
                self.settings.metrics.record_reconnect();
                info!(
                    "Reconnecting to broker {} (attempt {}) in {:?}",
                    key, attempt, delay
                );

                let channel = self.spawn_channel(profile, attempt, delay);
                entry.insert(channel.clone());
                Some(channel)
            }
            _ => {
                debug!("Channel {} of {} already replaced", failed_channel_id, key);
                None
            }
        }
    }

    /// Apply a channel lifecycle event. Returns `false` for events from
    /// channels that are no longer in the pool.
    pub fn handle_event(&self, event: &ChannelEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        let key = event.broker();
        let current = self
            .channels
            .get(key)
            .map(|channel| channel.id() == event.channel_id())
            .unwrap_or(false);
        if !current {
            debug!(
                "Ignoring event from stale channel {} of {}",
                event.channel_id(),
                key
            );
            return false;
        }

        match event {
            ChannelEvent::Connected { .. } => {
                self.failures.remove(key);
            }
            ChannelEvent::Error { message, .. } => {
                warn!("Channel to {} failed: {}", key, message);
                self.reconnect(key, event.channel_id());
            }
            ChannelEvent::Closed { .. } => {
                self.reconnect(key, event.channel_id());
            }
            // the channel follows up with an Error event
            ChannelEvent::ProtocolViolation { .. } => {}
        }
        true
    }

    /// Register brokers learned from metadata and drop the ones that left
    pub fn apply_topology_change(&self, change: &TopologyChange) {
        for key in &change.brokers_added {
            if let Some((host, port)) = split_key(key) {
                self.registry.resolve(host, port);
            }
        }
        for key in &change.brokers_removed {
            if self.seeds.contains(key) {
                continue;
            }
            if let Some((_, channel)) = self.channels.remove(key) {
                info!("Closing channel to departed broker {}", key);
                channel.close();
            }
            self.failures.remove(key);
        }
    }

    /// A channel suitable for a metadata request: a ready one if any,
    /// otherwise any live one, otherwise a freshly dialed seed
    pub fn any_ready_channel(&self) -> Result<Arc<SocketChannel>> {
        self.ensure_open()?;

        let mut live = None;
        for entry in self.channels.iter() {
            match entry.state() {
                ChannelState::Ready => return Ok(entry.value().clone()),
                ChannelState::Connecting if live.is_none() => live = Some(entry.value().clone()),
                _ => {}
            }
        }
        if let Some(channel) = live {
            return Ok(channel);
        }

        if self.seeds.is_empty() {
            return Err(KafkalinkClientError::invalid_config("no seed brokers"));
        }
        let index = self.next_seed.fetch_add(1, Ordering::Relaxed) % self.seeds.len();
        self.get_channel(&self.seeds[index])
    }

    /// Whether `get_channel` can serve `key`: a seed or a broker in the
    /// current topology
    pub fn routes_to(&self, key: &BrokerKey) -> bool {
        !self.is_closed() && self.is_referenced(key)
    }

    /// Current channel for `key` without dialing
    pub fn channel(&self, key: &BrokerKey) -> Option<Arc<SocketChannel>> {
        self.channels.get(key).map(|entry| entry.value().clone())
    }

    /// Whether the pool holds a channel for `key`, in any state
    pub fn contains(&self, key: &BrokerKey) -> bool {
        self.channels.contains_key(key)
    }

    /// Broker keys currently in the pool, sorted
    pub fn keys(&self) -> Vec<BrokerKey> {
        let mut keys: Vec<_> = self.channels.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of brokers with a channel in the pool
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Seed brokers from the configuration, deduplicated
    pub fn seeds(&self) -> &[BrokerKey] {
        &self.seeds
    }

    /// Connection profiles of every broker seen so far
    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Whether [`BrokerPool::shutdown`] has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every channel and refuse new ones. Returns the channels that were
    /// closed so the caller can wait for them to wind down.
    pub fn shutdown(&self) -> Vec<Arc<SocketChannel>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let channels: Vec<_> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.channels.clear();
        self.failures.clear();

        for channel in &channels {
            channel.shutdown();
        }
        info!("Broker pool shut down ({} channels closed)", channels.len());
        channels
    }

    fn spawn_channel(
        &self,
        profile: ConnectionProfile,
        attempt: u32,
        delay: Duration,
    ) -> Arc<SocketChannel> {
        Arc::new(SocketChannel::connect(
            profile,
            self.settings.clone(),
            attempt,
            delay,
            self.events.clone(),
        ))
    }

    fn profile_for(&self, key: &BrokerKey) -> Result<ConnectionProfile> {
        if !self.is_referenced(key) {
            return Err(KafkalinkClientError::BrokerNotFound {
                broker: key.to_string(),
            });
        }
        // the topology may publish a broker before its profile is registered
        self.registry
            .get(key)
            .or_else(|| split_key(key).map(|(host, port)| self.registry.resolve(host, port)))
            .ok_or_else(|| KafkalinkClientError::BrokerNotFound {
                broker: key.to_string(),
            })
    }

    fn is_referenced(&self, key: &BrokerKey) -> bool {
        self.seeds.contains(key) || self.topology.knows_broker(key)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(KafkalinkClientError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for BrokerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerPool")
            .field("seeds", &self.seeds)
            .field("channels", &self.keys())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn split_key(key: &BrokerKey) -> Option<(&str, u16)> {
    let (host, port) = key.as_str().rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}
