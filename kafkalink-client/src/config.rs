//! Configuration types for the kafkalink client

use crate::error::KafkalinkClientError;
use crate::identity;
use std::time::Duration;

/// Default maximum frame size (100 MiB), guards against a misbehaving broker
/// exhausting client memory with a bogus length prefix.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed broker addresses (`host:port`)
    pub brokers: Vec<String>,
    /// Client identifier sent in every request header
    pub client_id: String,
    /// Dial (and TLS handshake) timeout
    pub connection_timeout: Duration,
    /// Per-request deadline; `None` waits until the connection drops
    pub request_timeout: Option<Duration>,
    /// Reconnect backoff configuration
    pub retry_config: RetryConfig,
    /// Secure transport; `None` dials plaintext
    pub tls: Option<TlsOptions>,
    /// Interval for refreshing metadata of known topics
    pub metadata_refresh_interval: Option<Duration>,
    /// Largest response frame accepted from a broker
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "kafkalink-client".to_string(),
            connection_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            retry_config: RetryConfig::default(),
            tls: None,
            metadata_refresh_interval: Some(Duration::from_secs(300)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Parse the seed list into `(host, port)` pairs
    pub fn seed_addresses(&self) -> Result<Vec<(String, u16)>, KafkalinkClientError> {
        if self.brokers.is_empty() {
            return Err(KafkalinkClientError::invalid_config(
                "at least one seed broker is required",
            ));
        }
        self.brokers
            .iter()
            .map(|broker| parse_broker_address(broker))
            .collect()
    }

    /// Check the whole configuration before any network activity
    pub fn validate(&self) -> Result<(), KafkalinkClientError> {
        identity::validate(&self.client_id)?;
        self.seed_addresses()?;

        if self.connection_timeout.is_zero() {
            return Err(KafkalinkClientError::invalid_config(
                "connection_timeout must be greater than zero",
            ));
        }
        if matches!(self.request_timeout, Some(t) if t.is_zero()) {
            return Err(KafkalinkClientError::invalid_config(
                "request_timeout must be greater than zero",
            ));
        }
        if self.max_frame_size < 8 {
            return Err(KafkalinkClientError::invalid_config(
                "max_frame_size is too small to hold a response header",
            ));
        }
        self.retry_config.validate()?;
        Ok(())
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals (`[::1]:9092`)
pub fn parse_broker_address(address: &str) -> Result<(String, u16), KafkalinkClientError> {
    let invalid = || {
        KafkalinkClientError::invalid_config(format!(
            "broker address '{}' is not of the form host:port",
            address
        ))
    };

    let (host, port) = address.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Reconnect backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Retry delay multiplier
    pub multiplier: f64,
    /// Add ±25% jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before reconnect attempt number `attempt` (1-based). Attempt 0 dials
    /// immediately.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(32) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let delay = if self.jitter {
            let jitter = (rand::random::<f64>() * 0.5 - 0.25) * capped;
            (capped + jitter).clamp(0.0, self.max_delay.as_millis() as f64)
        } else {
            capped
        };
        Duration::from_millis(delay as u64)
    }

    fn validate(&self) -> Result<(), KafkalinkClientError> {
        if self.multiplier < 1.0 {
            return Err(KafkalinkClientError::invalid_config(
                "retry multiplier must be at least 1.0",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(KafkalinkClientError::invalid_config(
                "retry max_delay must not be below initial_delay",
            ));
        }
        Ok(())
    }
}

/// Secure transport options
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Verify the broker certificate chain and host name. Disable only for
    /// test/dev clusters with self-signed certificates.
    pub reject_unauthorized: bool,
    /// CA bundle (PEM); system roots are used when absent
    pub ca_path: Option<String>,
    /// Client certificate (PEM) for mutual TLS
    pub cert_path: Option<String>,
    /// Client private key (PEM) for mutual TLS
    pub key_path: Option<String>,
    /// SNI name override; defaults to the broker host
    pub server_name: Option<String>,
    /// Secure listener port relative to the advertised plaintext port
    pub secure_port_offset: u16,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            reject_unauthorized: true,
            ca_path: None,
            cert_path: None,
            key_path: None,
            server_name: None,
            secure_port_offset: 1,
        }
    }
}

impl TlsOptions {
    /// Options that skip certificate verification
    pub fn insecure() -> Self {
        Self {
            reject_unauthorized: false,
            ..Self::default()
        }
    }

    pub fn with_ca<P: Into<String>>(mut self, ca_path: P) -> Self {
        self.ca_path = Some(ca_path.into());
        self
    }

    /// Enable mutual TLS with a client certificate
    pub fn with_client_cert<P: Into<String>>(mut self, cert_path: P, key_path: P) -> Self {
        self.cert_path = Some(cert_path.into());
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_secure_port_offset(mut self, offset: u16) -> Self {
        self.secure_port_offset = offset;
        self
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.brokers = brokers.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.config.retry_config = retry_config;
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.config.tls = Some(tls);
        self
    }

    pub fn metadata_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.metadata_refresh_interval = interval;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
