//! Broker connection profiles
//!
//! A broker is identified by its advertised plaintext `host:port` (the
//! [`BrokerKey`]) no matter which transport is used to reach it. The
//! [`ProfileRegistry`] turns an advertised address into the dial targets for
//! that broker and deduplicates repeated discoveries of the same endpoint.

use crate::config::TlsOptions;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// Canonical `host:port` of a broker's logical (plaintext) endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerKey(String);

impl BrokerKey {
    /// Key for `host:port`, with the host normalized
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", normalize_host(host), port))
    }

    /// The key as `host:port`
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BrokerKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().to_ascii_lowercase()
}

/// Resolved dial targets for one broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub host: String,
    pub port: u16,
    pub ssl_host: String,
    pub ssl_port: u16,
    /// Dial the secure target instead of the plaintext one
    pub secure: bool,
}

impl ConnectionProfile {
    /// Build a profile, deriving the secure target from `tls` when present
    pub fn new(host: &str, port: u16, tls: Option<&TlsOptions>) -> Self {
        let host = normalize_host(host);
        match tls {
            Some(tls) => Self {
                ssl_host: host.clone(),
                ssl_port: port.saturating_add(tls.secure_port_offset),
                host,
                port,
                secure: true,
            },
            None => Self {
                ssl_host: host.clone(),
                ssl_port: port,
                host,
                port,
                secure: false,
            },
        }
    }

    /// Pool key of the plaintext endpoint
    pub fn key(&self) -> BrokerKey {
        BrokerKey::new(&self.host, self.port)
    }

    /// The `(host, port)` the socket actually connects to
    pub fn dial_target(&self) -> (&str, u16) {
        if self.secure {
            (&self.ssl_host, self.ssl_port)
        } else {
            (&self.host, self.port)
        }
    }
}

/// Registry of known broker profiles, keyed by [`BrokerKey`]
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    tls: Option<TlsOptions>,
    profiles: RwLock<HashMap<BrokerKey, ConnectionProfile>>,
}

impl ProfileRegistry {
    /// Empty registry; every profile it creates is secure when `tls` is set
    pub fn new(tls: Option<TlsOptions>) -> Self {
        Self {
            tls,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve an advertised address, registering it on first sight.
    /// Resolving the same endpoint again returns an equal profile.
    pub fn resolve(&self, host: &str, port: u16) -> ConnectionProfile {
        let key = BrokerKey::new(host, port);
        if let Some(profile) = self.profiles.read().get(&key) {
            return profile.clone();
        }

        self.profiles
            .write()
            .entry(key)
            .or_insert_with(|| ConnectionProfile::new(host, port, self.tls.as_ref()))
            .clone()
    }

    /// Profile registered under `key`
    pub fn get(&self, key: &BrokerKey) -> Option<ConnectionProfile> {
        self.profiles.read().get(key).cloned()
    }

    /// Whether a profile exists for `key`
    pub fn contains(&self, key: &BrokerKey) -> bool {
        self.profiles.read().contains_key(key)
    }

    /// Keys of every registered profile, sorted
    pub fn keys(&self) -> Vec<BrokerKey> {
        let mut keys: Vec<_> = self.profiles.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.read().is_empty()
    }

    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_ref()
    }
}
