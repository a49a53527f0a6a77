//! High-level client interface
//!
//! [`KafkalinkClient`] ties the pieces together: it validates configuration,
//! dials the seed brokers, bootstraps the topology and routes requests to the
//! leader of the partition they target.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ChannelEvent, ChannelSettings};
use crate::error::KafkalinkClientError;
use crate::identity::ClientIdentity;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::pool::BrokerPool;
use crate::profile::{BrokerKey, ProfileRegistry};
use crate::protocol::{EncodedRequest, MetadataDecoder, MetadataRequest, ResponseDecoder};
use crate::tls::BrokerTlsConnector;
use crate::topology::TopologyCache;
use crate::Result;

const EVENT_CAPACITY: usize = 256;

/// Notifications published to [`KafkalinkClient::subscribe`] receivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// First topology bootstrap completed
    Ready,
    Connected {
        broker: BrokerKey,
    },
    Error {
        broker: BrokerKey,
        message: String,
    },
    Closed {
        broker: BrokerKey,
    },
    BrokersChanged {
        added: Vec<BrokerKey>,
        removed: Vec<BrokerKey>,
    },
    ProtocolViolation {
        broker: BrokerKey,
        message: String,
    },
}

/// Main client for broker connections and request routing
#[derive(Clone)]
pub struct KafkalinkClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    pool: BrokerPool,
    topology: Arc<TopologyCache>,
    metrics: Arc<ClientMetrics>,
    events: broadcast::Sender<ClientEvent>,
    ready: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl KafkalinkClient {
    /// Validate `config` and start connecting in the background.
    ///
    /// Must be called from within a tokio runtime. Invalid identities and
    /// malformed configuration fail here, before any socket is opened.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let client_id = ClientIdentity::new(config.client_id.as_str())?;
        let seeds = config.seed_addresses()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(KafkalinkClientError::invalid_config(
                "the client must be created inside a tokio runtime",
            ));
        }

        let tls = config.tls.as_ref().map(BrokerTlsConnector::new).transpose()?;
        let metrics = Arc::new(ClientMetrics::new());
        let settings = Arc::new(ChannelSettings {
            client_id,
            connection_timeout: config.connection_timeout,
            request_timeout: config.request_timeout,
            max_frame_size: config.max_frame_size,
            tls,
            metrics: metrics.clone(),
        });

        let topology = Arc::new(TopologyCache::new());
        let (pool, channel_events) = BrokerPool::new(
            &seeds,
            ProfileRegistry::new(config.tls.clone()),
            topology.clone(),
            settings,
            config.retry_config.clone(),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready, _) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            config,
            pool,
            topology,
            metrics,
            events,
            ready,
            shutdown: CancellationToken::new(),
        });

        info!(
            "Starting client '{}' with seeds {:?}",
            inner.config.client_id,
            inner.pool.seeds()
        );
        tokio::spawn(supervise(Arc::downgrade(&inner), channel_events));
        inner.pool.connect_seeds()?;
        tokio::spawn(bootstrap(Arc::downgrade(&inner)));
        if let Some(interval) = inner.config.metadata_refresh_interval {
            tokio::spawn(refresh_periodically(Arc::downgrade(&inner), interval));
        }

        Ok(Self { inner })
    }

    /// Create a client and wait until its topology is bootstrapped
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let client = Self::new(config)?;
        client.ready().await?;
        Ok(client)
    }

    /// Wait for the first successful metadata bootstrap, bounded by the
    /// connection timeout
    pub async fn ready(&self) -> Result<()> {
        let mut ready = self.inner.ready.subscribe();
        let wait = self.inner.config.connection_timeout;

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(KafkalinkClientError::Shutdown),
            result = timeout(wait, ready.wait_for(|ready| *ready)) => match result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(KafkalinkClientError::Shutdown),
                Err(_) => Err(KafkalinkClientError::timeout(wait.as_millis() as u64)),
            },
        }
    }

    /// Whether the first topology bootstrap has completed
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Send `request` to the leader of `topic`/`partition` and decode its
    /// response. An unknown partition triggers a metadata refresh first.
    pub async fn dispatch<D: ResponseDecoder>(
        &self,
        topic: &str,
        partition: i32,
        request: EncodedRequest,
        decoder: D,
    ) -> Result<D::Output> {
        let leader = self.resolve_leader(topic, partition).await?;
        let channel = self.inner.pool.get_channel(&leader)?;
        debug!("Dispatching api {} for {}:{} to {}", request.api_key, topic, partition, leader);
        channel.send(request, decoder).await
    }

    /// Send a request the broker will not answer (produce with acks=0)
    pub async fn dispatch_without_response(
        &self,
        topic: &str,
        partition: i32,
        request: EncodedRequest,
    ) -> Result<()> {
        let leader = self.resolve_leader(topic, partition).await?;
        let channel = self.inner.pool.get_channel(&leader)?;
        channel.send_without_response(request).await
    }

    /// Fetch metadata for `topics` and apply it to the topology cache
    pub async fn refresh_topology<S: AsRef<str>>(&self, topics: &[S]) -> Result<()> {
        let topics: Vec<String> = topics.iter().map(|t| t.as_ref().to_string()).collect();
        self.inner.refresh(topics).await
    }

    /// Fetch metadata for every topic in the cluster
    pub async fn refresh_all_topology(&self) -> Result<()> {
        self.inner.refresh(Vec::new()).await
    }

    /// Refresh `topics` and return the ones the cluster does not know
    pub async fn topic_exists<S: AsRef<str>>(&self, topics: &[S]) -> Result<Vec<String>> {
        self.refresh_topology(topics).await?;
        Ok(topics
            .iter()
            .map(|t| t.as_ref())
            .filter(|t| !self.inner.topology.contains_topic(t))
            .map(str::to_string)
            .collect())
    }

    /// Drop cached leaders of `topics`; the next dispatch refreshes them
    pub fn remove_topic_metadata<S: AsRef<str>>(&self, topics: &[S]) {
        self.inner.topology.remove_topics(topics);
    }

    /// Cached leader of `topic`/`partition`, without refreshing
    pub fn leader_for(&self, topic: &str, partition: i32) -> Option<BrokerKey> {
        self.inner.topology.lookup(topic, partition)
    }

    /// Cached partition ids of `topic`, sorted
    pub fn partitions_for(&self, topic: &str) -> Option<Vec<i32>> {
        self.inner.topology.partitions_for(topic)
    }

    /// Receive connection and topology events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// The broker connection pool
    pub fn pool(&self) -> &BrokerPool {
        &self.inner.pool
    }

    /// The topic/partition leader cache
    pub fn topology(&self) -> &TopologyCache {
        &self.inner.topology
    }

    /// Point-in-time copy of the client's counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Configuration the client was created with
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether [`KafkalinkClient::shutdown`] has been called
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Close every channel and stop background tasks. Outstanding requests
    /// fail with [`KafkalinkClientError::Shutdown`], as does any later call.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down client '{}'", self.inner.config.client_id);
        self.inner.shutdown.cancel();
        let channels = self.inner.pool.shutdown();
        let closing = channels.iter().map(|channel| channel.closed());
        if timeout(Duration::from_secs(5), futures::future::join_all(closing))
            .await
            .is_err()
        {
            warn!("Timed out waiting for channels to close");
        }
    }

    async fn resolve_leader(&self, topic: &str, partition: i32) -> Result<BrokerKey> {
        if self.is_shutdown() {
            return Err(KafkalinkClientError::Shutdown);
        }
        match self.inner.topology.lookup(topic, partition) {
            Some(leader) if self.inner.pool.routes_to(&leader) => return Ok(leader),
            Some(leader) => debug!(
                "Cached leader {} of {}:{} is no longer a known broker, refreshing",
                leader, topic, partition
            ),
            None => debug!("No cached leader for {}:{}, refreshing", topic, partition),
        }

        self.inner.refresh(vec![topic.to_string()]).await?;
        self.inner
            .topology
            .lookup(topic, partition)
            .filter(|leader| self.inner.pool.routes_to(leader))
            .ok_or_else(|| KafkalinkClientError::topology_unavailable(topic, partition))
    }
}

impl std::fmt::Debug for KafkalinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkalinkClient")
            .field("client_id", &self.inner.config.client_id)
            .field("pool", &self.inner.pool)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ClientInner {
    async fn refresh(&self, topics: Vec<String>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(KafkalinkClientError::Shutdown);
        }

        let result = self.fetch_and_apply(topics).await;
        self.metrics.record_metadata_refresh(result.is_ok());
        if let Err(ref e) = result {
            warn!("Metadata refresh failed: {}", e);
        }
        result
    }

    async fn fetch_and_apply(&self, topics: Vec<String>) -> Result<()> {
        let channel = self.pool.any_ready_channel()?;
        let request = MetadataRequest::new(topics).encode()?;
        // covers a channel that is still dialing as well as the request itself
        let limit = self.config.connection_timeout
            + self
                .config
                .request_timeout
                .unwrap_or(self.config.connection_timeout);

        let response = timeout(limit, channel.send(request, MetadataDecoder))
            .await
            .map_err(|_| KafkalinkClientError::timeout(limit.as_millis() as u64))??;

        let change = self.topology.apply_metadata(&response);
        self.pool.apply_topology_change(&change);
        debug!(
            "Applied metadata from {}: {} brokers, {} topics, {} leaders",
            channel.broker_key(),
            response.brokers.len(),
            response.topics.len(),
            change.entries_updated
        );

        if change.brokers_changed() {
            info!(
                "Broker set changed: +{:?} -{:?}",
                change.brokers_added, change.brokers_removed
            );
            self.publish(ClientEvent::BrokersChanged {
                added: change.brokers_added,
                removed: change.brokers_removed,
            });
        }
        Ok(())
    }

    fn publish(&self, event: ClientEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.pool.shutdown();
    }
}

/// Feed channel lifecycle events to the pool and republish them
async fn supervise(client: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = client.upgrade() else {
            break;
        };
        if inner.shutdown.is_cancelled() {
            break;
        }

        let current = inner.pool.handle_event(&event);
        let published = match event {
            ChannelEvent::ProtocolViolation {
                broker, message, ..
            } => Some(ClientEvent::ProtocolViolation { broker, message }),
            _ if !current => None,
            ChannelEvent::Connected { broker, .. } => Some(ClientEvent::Connected { broker }),
            ChannelEvent::Error {
                broker, message, ..
            } => Some(ClientEvent::Error { broker, message }),
            ChannelEvent::Closed { broker, .. } => Some(ClientEvent::Closed { broker }),
        };
        if let Some(event) = published {
            inner.publish(event);
        }
    }
    debug!("Channel supervisor stopped");
}

/// Retry the initial metadata request until it succeeds
async fn bootstrap(client: Weak<ClientInner>) {
    let mut attempt = 0u32;
    loop {
        let Some(inner) = client.upgrade() else {
            return;
        };
        match inner.refresh(Vec::new()).await {
            Ok(()) => {
                inner.ready.send_replace(true);
                inner.publish(ClientEvent::Ready);
                info!(
                    "Client '{}' ready, {} brokers known",
                    inner.config.client_id,
                    inner.topology.brokers().len()
                );
                return;
            }
            Err(KafkalinkClientError::Shutdown) => return,
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let delay = inner.config.retry_config.backoff(attempt);
                debug!("Bootstrap attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                let shutdown = inner.shutdown.clone();
                drop(inner);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

/// Refresh the metadata of every cached topic on a fixed interval
async fn refresh_periodically(client: Weak<ClientInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        let shutdown = match client.upgrade() {
            Some(inner) => inner.shutdown.clone(),
            None => return,
        };
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(inner) = client.upgrade() else {
            return;
        };
        if !*inner.ready.borrow() {
            continue;
        }
        let topics = inner.topology.topics();
        debug!("Periodic metadata refresh for {} topics", topics.len());
        // errors are logged and counted by refresh
        let _ = inner.refresh(topics).await;
    }
}
