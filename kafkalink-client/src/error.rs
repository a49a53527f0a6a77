//! Error types for the kafkalink client library

/// Main error type for kafkalink client operations
#[derive(Debug, thiserror::Error)]
pub enum KafkalinkClientError {
    /// Client identity contains characters the wire protocol cannot carry
    #[error("Invalid client identity '{identity}': {reason}")]
    InvalidIdentity { identity: String, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Dial, handshake or mid-stream failure on a broker connection
    #[error("Connection error ({broker}): {message}")]
    Connection { broker: String, message: String },

    /// Framing or payload that does not match what the protocol allows
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// No leader known for a partition after a metadata refresh
    #[error("No leader available for partition {partition} of topic '{topic}'")]
    TopologyUnavailable { topic: String, partition: i32 },

    /// The pool has no connection profile for the broker
    #[error("Unknown broker {broker}")]
    BrokerNotFound { broker: String },

    /// A single request exceeded its deadline
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// TLS setup errors
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// The client has been shut down
    #[error("Client is shut down")]
    Shutdown,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KafkalinkClientError {
    /// Create a new connection error
    pub fn connection<B: Into<String>, S: Into<String>>(broker: B, message: S) -> Self {
        Self::Connection {
            broker: broker.into(),
            message: message.into(),
        }
    }

    /// Connection-lost failure used when a channel flushes its pending requests
    pub fn connection_lost<B: Into<String>>(broker: B) -> Self {
        Self::connection(broker, "connection lost")
    }

    /// Create a new protocol violation error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create a new invalid identity error
    pub fn invalid_identity<I: Into<String>, S: Into<String>>(identity: I, reason: S) -> Self {
        Self::InvalidIdentity {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new topology error
    pub fn topology_unavailable<T: Into<String>>(topic: T, partition: i32) -> Self {
        Self::TopologyUnavailable {
            topic: topic.into(),
            partition,
        }
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::TopologyUnavailable { .. }
                | Self::Io(_)
        )
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Kafka broker error codes the connection manager interprets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    Unknown = -1,
    /// Offset out of range
    OffsetOutOfRange = 1,
    /// Unknown topic or partition
    UnknownTopicOrPartition = 3,
    /// Leader not available
    LeaderNotAvailable = 5,
    /// Not leader for partition
    NotLeaderForPartition = 6,
    /// Request timed out
    RequestTimedOut = 7,
    /// Broker not available
    BrokerNotAvailable = 8,
    /// Replica not available
    ReplicaNotAvailable = 9,
    /// Invalid topic name
    InvalidTopic = 17,
}

impl ErrorCode {
    /// Whether the code indicates stale leadership, i.e. a metadata refresh may help
    pub fn is_stale_metadata(self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownTopicOrPartition
                | ErrorCode::LeaderNotAvailable
                | ErrorCode::NotLeaderForPartition
        )
    }

    /// Convert error code to a client error
    pub fn to_client_error(self, topic: &str, partition: i32) -> KafkalinkClientError {
        match self {
            ErrorCode::LeaderNotAvailable
            | ErrorCode::NotLeaderForPartition
            | ErrorCode::UnknownTopicOrPartition => {
                KafkalinkClientError::topology_unavailable(topic, partition)
            }
            ErrorCode::RequestTimedOut => KafkalinkClientError::timeout(0),
            ErrorCode::BrokerNotAvailable | ErrorCode::ReplicaNotAvailable => {
                KafkalinkClientError::connection(
                    format!("{}:{}", topic, partition),
                    format!("broker reported {:?}", self),
                )
            }
            other => KafkalinkClientError::protocol(format!(
                "broker reported {:?} for {}:{}",
                other, topic, partition
            )),
        }
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            1 => ErrorCode::OffsetOutOfRange,
            3 => ErrorCode::UnknownTopicOrPartition,
            5 => ErrorCode::LeaderNotAvailable,
            6 => ErrorCode::NotLeaderForPartition,
            7 => ErrorCode::RequestTimedOut,
            8 => ErrorCode::BrokerNotAvailable,
            9 => ErrorCode::ReplicaNotAvailable,
            17 => ErrorCode::InvalidTopic,
            _ => ErrorCode::Unknown,
        }
    }
}
