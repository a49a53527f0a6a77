//! In-process mock broker speaking the request/response framing
//!
//! Metadata requests are answered with the mock itself as the only broker and
//! leader of every partition. Other requests are echoed back, ignored, or
//! answered with a wrong correlation id, depending on the [`Mode`].

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use kafkalink_client::protocol::{
    api_key, BrokerMetadata, MetadataResponse, PartitionMetadata, TopicMetadata,
};
use kafkalink_client::{ClientConfig, ClientEvent, KafkalinkClient, RetryConfig};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Echo,
    Silent,
    WrongCorrelation,
}

struct MockState {
    topics: Mutex<Vec<(String, i32)>>,
    mode: Mutex<Mode>,
    received: Mutex<Vec<i16>>,
    accepted: AtomicUsize,
    advertised_port: Mutex<Option<u16>>,
    kick: broadcast::Sender<()>,
}

pub struct MockBroker {
    /// Advertised (plaintext) port; a TLS broker listens on `port + 1`
    pub port: u16,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    /// Start a broker hosting `topics` as `(name, partition count)`
    pub async fn start(topics: &[(&str, i32)]) -> Self {
        Self::listen(topics, None).await
    }

    /// Start a broker that only speaks TLS, with a self-signed certificate.
    /// It listens on `port + 1`, where clients find the secure listener.
    pub async fn start_tls(topics: &[(&str, i32)]) -> Self {
        Self::listen(topics, Some(self_signed_acceptor())).await
    }

    async fn listen(topics: &[(&str, i32)], tls: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_port = listener.local_addr().unwrap().port();
        let port = if tls.is_some() {
            listen_port - 1
        } else {
            listen_port
        };
        let (kick, _) = broadcast::channel(16);
        let state = Arc::new(MockState {
            topics: Mutex::new(topics.iter().map(|(t, n)| (t.to_string(), *n)).collect()),
            mode: Mutex::new(Mode::Echo),
            received: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            advertised_port: Mutex::new(None),
            kick,
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let kick = accept_state.kick.subscribe();
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let state = accept_state.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => {
                            if let Ok(stream) = acceptor.accept(socket).await {
                                serve(stream, port, state, kick).await;
                            }
                        }
                        None => serve(socket, port, state, kick).await,
                    }
                });
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.state.mode.lock() = mode;
    }

    /// Answer metadata requests as if the only broker listened on `port`;
    /// `None` advertises the mock itself
    pub fn advertise(&self, port: Option<u16>) {
        *self.state.advertised_port.lock() = port;
    }

    /// Close every open connection; new connections are still accepted
    pub fn drop_connections(&self) {
        let _ = self.state.kick.send(());
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn received(&self, api: i16) -> usize {
        self.state.received.lock().iter().filter(|k| **k == api).count()
    }

    /// Poll until at least `count` connections have been accepted
    pub async fn wait_for_accepted(&self, count: usize) {
        for _ in 0..500 {
            if self.accepted() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("broker never accepted {} connections", count);
    }

    /// Poll until `count` requests of type `api` have arrived
    pub async fn wait_for_requests(&self, api: i16, count: usize) {
        for _ in 0..500 {
            if self.received(api) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("broker never received {} requests of api {}", count, api);
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.state.kick.send(());
    }
}

async fn serve<S>(
    mut socket: S,
    port: u16,
    state: Arc<MockState>,
    mut kick: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = kick.recv() => return,
            frame = read_request(&mut socket) => frame,
        };
        let Ok((api, correlation_id, body)) = frame else {
            return;
        };
        state.received.lock().push(api);

        let reply = if api == api_key::METADATA {
            Some((correlation_id, metadata_reply(&state, port, body)))
        } else {
            let mode = *state.mode.lock();
            match mode {
                Mode::Echo => Some((correlation_id, body)),
                Mode::Silent => None,
                Mode::WrongCorrelation => Some((correlation_id.wrapping_add(1000), body)),
            }
        };

        if let Some((correlation_id, body)) = reply {
            let mut frame = BytesMut::with_capacity(8 + body.len());
            frame.put_i32(4 + body.len() as i32);
            frame.put_i32(correlation_id);
            frame.put_slice(&body);
            if socket.write_all(&frame).await.is_err() || socket.flush().await.is_err() {
                return;
            }
        }
    }
}

/// Read one request frame: `(api_key, correlation_id, body)`
async fn read_request<S>(socket: &mut S) -> std::io::Result<(i16, i32, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let size = socket.read_i32().await? as usize;
    let api = socket.read_i16().await?;
    let _version = socket.read_i16().await?;
    let correlation_id = socket.read_i32().await?;
    let client_id_len = socket.read_i16().await?.max(0) as usize;
    let mut client_id = vec![0u8; client_id_len];
    socket.read_exact(&mut client_id).await?;

    let mut body = vec![0u8; size - 10 - client_id_len];
    socket.read_exact(&mut body).await?;
    Ok((api, correlation_id, Bytes::from(body)))
}

fn self_signed_acceptor() -> TlsAcceptor {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = CertificateDer::from(certified.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

fn metadata_reply(state: &MockState, port: u16, body: Bytes) -> Bytes {
    let requested = parse_topics(&body);
    let hosted = state.topics.lock().clone();

    let describe = |name: &str| match hosted.iter().find(|(t, _)| t == name) {
        Some((name, partitions)) => TopicMetadata {
            error_code: 0,
            name: name.clone(),
            partitions: (0..*partitions)
                .map(|id| PartitionMetadata {
                    error_code: 0,
                    id,
                    leader: 0,
                    replicas: vec![0],
                    isr: vec![0],
                })
                .collect(),
        },
        None => TopicMetadata {
            error_code: 3,
            name: name.to_string(),
            partitions: vec![],
        },
    };

    let topics = if requested.is_empty() {
        hosted.iter().map(|(t, _)| describe(t)).collect()
    } else {
        requested.iter().map(|t| describe(t)).collect()
    };

    MetadataResponse {
        brokers: vec![BrokerMetadata {
            node_id: 0,
            host: "127.0.0.1".to_string(),
            port: state.advertised_port.lock().unwrap_or(port) as i32,
        }],
        topics,
    }
    .encode()
    .unwrap()
}

fn parse_topics(body: &[u8]) -> Vec<String> {
    let mut topics = Vec::new();
    if body.len() < 4 {
        return topics;
    }
    let count = i32::from_be_bytes([body[0], body[1], body[2], body[3]]).max(0);
    let mut pos = 4;
    for _ in 0..count {
        let len = i16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
        pos += 2;
        topics.push(String::from_utf8_lossy(&body[pos..pos + len]).into_owned());
        pos += len;
    }
    topics
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client config with short timeouts and fast reconnects
pub fn config(brokers: &[&MockBroker]) -> ClientConfig {
    ClientConfig::builder()
        .brokers(brokers.iter().map(|b| b.address()))
        .client_id("kafkalink-it")
        .connection_timeout(Duration::from_secs(2))
        .request_timeout(Some(Duration::from_secs(5)))
        .retry_config(RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        })
        .metadata_refresh_interval(None)
        .build()
}

pub async fn connect(brokers: &[&MockBroker]) -> KafkalinkClient {
    init_tracing();
    KafkalinkClient::connect(config(brokers)).await.unwrap()
}

/// Wait for the first event matching `matches`, failing after a few seconds
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<ClientEvent>, matches: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}
