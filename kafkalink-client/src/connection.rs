//! Socket channels: one physical connection to one broker
//!
//! Each channel is driven by a spawned task that owns the framed stream and the
//! correlation table. Callers talk to it through an unbounded queue, so no lock
//! is ever held across a socket read or write. A channel moves
//! `Connecting -> Ready -> (Errored | Closed)` exactly once; reconnecting means
//! building a new channel.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::correlation::{Completion, CorrelationTable, Lookup, PendingRequest};
use crate::error::KafkalinkClientError;
use crate::identity::ClientIdentity;
use crate::metrics::ClientMetrics;
use crate::profile::{BrokerKey, ConnectionProfile};
use crate::protocol::{kafka, EncodedRequest, FrameCodec, OutboundRequest, ResponseDecoder};
use crate::tls::BrokerTlsConnector;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Ready,
    Errored,
    Closed,
}

impl ChannelState {
    /// Errored or closed; the channel will not be used again
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Errored | ChannelState::Closed)
    }
}

/// Lifecycle notifications consumed by the broker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected {
        broker: BrokerKey,
        channel_id: u64,
    },
    Error {
        broker: BrokerKey,
        channel_id: u64,
        message: String,
    },
    Closed {
        broker: BrokerKey,
        channel_id: u64,
    },
    ProtocolViolation {
        broker: BrokerKey,
        channel_id: u64,
        message: String,
    },
}

impl ChannelEvent {
    /// Broker the emitting channel talks to
    pub fn broker(&self) -> &BrokerKey {
        match self {
            ChannelEvent::Connected { broker, .. }
            | ChannelEvent::Error { broker, .. }
            | ChannelEvent::Closed { broker, .. }
            | ChannelEvent::ProtocolViolation { broker, .. } => broker,
        }
    }

    /// Id of the emitting channel
    pub fn channel_id(&self) -> u64 {
        match self {
            ChannelEvent::Connected { channel_id, .. }
            | ChannelEvent::Error { channel_id, .. }
            | ChannelEvent::Closed { channel_id, .. }
            | ChannelEvent::ProtocolViolation { channel_id, .. } => *channel_id,
        }
    }
}

/// Settings shared by every channel of one client
#[derive(Debug)]
pub struct ChannelSettings {
    pub client_id: ClientIdentity,
    pub connection_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub max_frame_size: usize,
    pub tls: Option<BrokerTlsConnector>,
    pub metrics: Arc<ClientMetrics>,
}

enum Reply {
    Response(Completion),
    Written(oneshot::Sender<Result<(), KafkalinkClientError>>),
}

struct Command {
    request: EncodedRequest,
    reply: Reply,
    submitted_at: Instant,
}

impl Command {
    fn fail(self, error: KafkalinkClientError) {
        match self.reply {
            Reply::Response(completion) => completion(Err(error)),
            Reply::Written(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// Handle to one broker connection
#[derive(Debug)]
pub struct SocketChannel {
    id: u64,
    profile: ConnectionProfile,
    broker_key: BrokerKey,
    attempt: u32,
    request_timeout: Option<Duration>,
    metrics: Arc<ClientMetrics>,
    state: watch::Receiver<ChannelState>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    client_shutdown: Arc<AtomicBool>,
}

impl SocketChannel {
    /// Create a channel and start dialing `profile` after `delay`
    pub fn connect(
        profile: ConnectionProfile,
        settings: Arc<ChannelSettings>,
        attempt: u32,
        delay: Duration,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (channel, task) = Self::create(profile, attempt, settings, events);
        tokio::spawn(task.dial_and_run(delay));
        channel
    }

    /// Create a ready channel over an already established stream
    pub fn from_stream<S>(
        profile: ConnectionProfile,
        stream: S,
        settings: Arc<ChannelSettings>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (channel, task) = Self::create(profile, 0, settings, events);
        tokio::spawn(task.run_connected(stream));
        channel
    }

    fn create(
        profile: ConnectionProfile,
        attempt: u32,
        settings: Arc<ChannelSettings>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> (Self, ChannelTask) {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let broker_key = profile.key();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let client_shutdown = Arc::new(AtomicBool::new(false));
        let request_timeout = settings.request_timeout;
        let metrics = settings.metrics.clone();

        let task = ChannelTask {
            id,
            profile: profile.clone(),
            broker_key: broker_key.clone(),
            settings,
            state: state_tx,
            commands: command_rx,
            events,
            shutdown: shutdown.clone(),
            client_shutdown: client_shutdown.clone(),
        };
        let channel = Self {
            id,
            profile,
            broker_key,
            attempt,
            request_timeout,
            metrics,
            state: state_rx,
            commands: command_tx,
            shutdown,
            client_shutdown,
        };
        (channel, task)
    }

    /// Process-unique id, distinguishing successive channels to one broker
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the broker this channel talks to
    pub fn broker_key(&self) -> &BrokerKey {
        &self.broker_key
    }

    /// Profile the channel was dialed with
    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// Reconnect attempt this channel was created for; 0 for a first dial
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Connecting or ready
    pub fn is_live(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Wait until the channel leaves `Connecting`
    pub async fn wait_ready(&self) -> Result<(), KafkalinkClientError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map(|s| *s)
            .unwrap_or(ChannelState::Closed);
        match reached {
            ChannelState::Ready => Ok(()),
            other => Err(KafkalinkClientError::connection(
                self.broker_key.as_str(),
                format!("channel is {:?}", other),
            )),
        }
    }

    /// Wait until the channel reaches a terminal state
    pub async fn closed(&self) -> ChannelState {
        let mut state = self.state.clone();
        state
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .unwrap_or(ChannelState::Closed)
    }

    /// Send a request and decode its response.
    ///
    /// The request timeout runs from this call, so time spent queued behind a
    /// dial or reconnect backoff counts against it.
    pub async fn send<D: ResponseDecoder>(
        &self,
        request: EncodedRequest,
        decoder: D,
    ) -> Result<D::Output, KafkalinkClientError> {
        let submitted_at = Instant::now();
        let (tx, rx) = oneshot::channel();
        let completion: Completion = Box::new(move |result: Result<Bytes, KafkalinkClientError>| {
            let _ = tx.send(result.and_then(|body| decoder.decode(body)));
        });

        self.commands
            .send(Command {
                request,
                reply: Reply::Response(completion),
                submitted_at,
            })
            .map_err(|_| KafkalinkClientError::connection_lost(self.broker_key.as_str()))?;

        let lost = || KafkalinkClientError::connection_lost(self.broker_key.as_str());
        let result = match self.request_timeout {
            Some(request_timeout) => match timeout_at(submitted_at + request_timeout, rx).await {
                Ok(received) => received.map_err(|_| lost())?,
                Err(_) => Err(KafkalinkClientError::timeout(
                    request_timeout.as_millis() as u64,
                )),
            },
            None => rx.await.map_err(|_| lost())?,
        };
        if matches!(result, Err(KafkalinkClientError::Timeout { .. })) {
            self.metrics.record_timeout();
        }
        result
    }

    /// Write a request the broker will not answer (e.g. produce with acks=0).
    /// Resolves once the frame is written.
    pub async fn send_without_response(
        &self,
        request: EncodedRequest,
    ) -> Result<(), KafkalinkClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command {
                request,
                reply: Reply::Written(tx),
                submitted_at: Instant::now(),
            })
            .map_err(|_| KafkalinkClientError::connection_lost(self.broker_key.as_str()))?;

        rx.await
            .map_err(|_| KafkalinkClientError::connection_lost(self.broker_key.as_str()))?
    }

    /// Close the connection; outstanding requests fail with connection lost
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Close as part of client shutdown; outstanding requests fail with
    /// [`KafkalinkClientError::Shutdown`]
    pub fn shutdown(&self) {
        self.client_shutdown.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

enum Terminal {
    Closed(String),
    Errored(String),
}

struct ChannelTask {
    id: u64,
    profile: ConnectionProfile,
    broker_key: BrokerKey,
    settings: Arc<ChannelSettings>,
    state: watch::Sender<ChannelState>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    shutdown: CancellationToken,
    client_shutdown: Arc<AtomicBool>,
}

impl ChannelTask {
    async fn dial_and_run(mut self, delay: Duration) {
        if !delay.is_zero() {
            debug!("Reconnecting to {} in {:?}", self.broker_key, delay);
        }

        let dialed = tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.finish(Terminal::Closed("closed while connecting".to_string()), None);
                return;
            }
            dialed = async {
                sleep(delay).await;
                dial(&self.profile, &self.settings).await
            } => dialed,
        };

        match dialed {
            Ok(stream) => self.run_connected(stream).await,
            Err(e) => {
                self.settings.metrics.record_connection_failed();
                warn!("Failed to connect to broker {}: {}", self.broker_key, e);
                self.finish(Terminal::Errored(e.to_string()), None);
            }
        }
    }

    async fn run_connected<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.settings.metrics.record_connection_created();
        self.state.send_replace(ChannelState::Ready);
        info!("Connected to broker: {}", self.broker_key);
        let _ = self.events.send(ChannelEvent::Connected {
            broker: self.broker_key.clone(),
            channel_id: self.id,
        });

        let codec = FrameCodec::new(
            self.settings.client_id.clone(),
            self.settings.max_frame_size,
        );
        let mut framed = Framed::new(stream, codec);
        let mut table = CorrelationTable::new();

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = timeout(Duration::from_secs(1), framed.close()).await;
                    break Terminal::Closed("closed by client".to_string());
                }

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break Terminal::Closed("all channel handles dropped".to_string());
                    };
                    if let Err(e) = self.write(&mut framed, &mut table, command).await {
                        error!("Failed to send request to {}: {}", self.broker_key, e);
                        break Terminal::Errored(e.to_string());
                    }
                }

                frame = framed.next() => match frame {
                    Some(Ok(frame)) => match table.take(frame.correlation_id) {
                        Lookup::Pending(pending) => {
                            self.settings.metrics.record_response(pending.issued_at.elapsed());
                            let mut payload = frame.payload;
                            let result = if pending.flexible_response {
                                kafka::skip_tagged_fields(&mut payload).map(|_| payload)
                            } else {
                                Ok(payload)
                            };
                            pending.complete(result);
                        }
                        Lookup::Expired => {
                            debug!(
                                "Dropping late response {} from {}",
                                frame.correlation_id, self.broker_key
                            );
                        }
                        Lookup::Unknown => {
                            let message = format!(
                                "response with unmatched correlation id {}",
                                frame.correlation_id
                            );
                            self.report_violation(&message);
                            break Terminal::Errored(message);
                        }
                    },
                    Some(Err(e)) => {
                        if let KafkalinkClientError::ProtocolViolation { ref message } = e {
                            self.report_violation(message);
                        }
                        error!("Error receiving response from {}: {}", self.broker_key, e);
                        break Terminal::Errored(e.to_string());
                    }
                    None => break Terminal::Closed("connection closed by broker".to_string()),
                },

                correlation_id = table.next_expired() => {
                    warn!("Request {} to {} timed out", correlation_id, self.broker_key);
                }
            }
        };

        self.finish(outcome, Some(&mut table));
    }

    async fn write<S>(
        &self,
        framed: &mut Framed<S, FrameCodec>,
        table: &mut CorrelationTable,
        command: Command,
    ) -> Result<(), KafkalinkClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let awaits_response = matches!(command.reply, Reply::Response(_));
        if let Some(request_timeout) = self.settings.request_timeout.filter(|_| awaits_response) {
            if command.submitted_at.elapsed() >= request_timeout {
                debug!(
                    "Request to {} expired before it was written",
                    self.broker_key
                );
                command.fail(KafkalinkClientError::timeout(
                    request_timeout.as_millis() as u64,
                ));
                return Ok(());
            }
        }

        let correlation_id = table.next_correlation_id();
        let submitted_at = command.submitted_at;
        let request = command.request;
        let body_len = request.body.len() as u64;
        debug!(
            "Sending request {} (api {} v{}) to {}",
            correlation_id, request.api_key, request.api_version, self.broker_key
        );

        let written = match command.reply {
            Reply::Response(completion) => {
                // registered first so even an instant response finds its entry
                table.register(
                    PendingRequest::new(
                        correlation_id,
                        request.api_key,
                        request.flexible_response_header(),
                        completion,
                    )
                    .with_issued_at(submitted_at),
                    self.settings.request_timeout,
                );
                None
            }
            Reply::Written(tx) => Some(tx),
        };

        framed
            .send(OutboundRequest {
                correlation_id,
                request,
            })
            .await?;
        self.settings.metrics.record_request_sent(body_len);

        if let Some(tx) = written {
            let _ = tx.send(Ok(()));
        }
        Ok(())
    }

    fn report_violation(&self, message: &str) {
        self.settings.metrics.record_protocol_violation();
        warn!("Protocol violation on {}: {}", self.broker_key, message);
        let _ = self.events.send(ChannelEvent::ProtocolViolation {
            broker: self.broker_key.clone(),
            channel_id: self.id,
            message: message.to_string(),
        });
    }

    /// Enter the terminal state, fail everything outstanding, notify the pool
    fn finish(&mut self, outcome: Terminal, table: Option<&mut CorrelationTable>) {
        let (state, event) = match outcome {
            Terminal::Closed(reason) => {
                info!("Connection to {} closed: {}", self.broker_key, reason);
                (
                    ChannelState::Closed,
                    ChannelEvent::Closed {
                        broker: self.broker_key.clone(),
                        channel_id: self.id,
                    },
                )
            }
            Terminal::Errored(message) => {
                self.settings.metrics.record_connection_error();
                (
                    ChannelState::Errored,
                    ChannelEvent::Error {
                        broker: self.broker_key.clone(),
                        channel_id: self.id,
                        message,
                    },
                )
            }
        };
        self.state.send_replace(state);

        let broker = self.broker_key.as_str();
        let shutting_down = self.client_shutdown.load(Ordering::SeqCst);
        let lost = || {
            if shutting_down {
                KafkalinkClientError::Shutdown
            } else {
                KafkalinkClientError::connection_lost(broker)
            }
        };
        self.commands.close();
        let mut failed = 0u64;
        while let Ok(command) = self.commands.try_recv() {
            command.fail(lost());
            failed += 1;
        }
        if let Some(table) = table {
            failed += table.flush(lost) as u64;
        }
        if failed > 0 {
            self.settings.metrics.record_requests_failed(failed);
            warn!("Failed {} outstanding requests to {}", failed, broker);
        }

        let _ = self.events.send(event);
    }
}

async fn dial(
    profile: &ConnectionProfile,
    settings: &ChannelSettings,
) -> Result<BrokerStream, KafkalinkClientError> {
    timeout(settings.connection_timeout, open_stream(profile, settings))
        .await
        .map_err(|_| KafkalinkClientError::timeout(settings.connection_timeout.as_millis() as u64))?
}

async fn open_stream(
    profile: &ConnectionProfile,
    settings: &ChannelSettings,
) -> Result<BrokerStream, KafkalinkClientError> {
    let (host, port) = profile.dial_target();
    let broker = profile.key();
    debug!("Creating connection to broker {} via {}:{}", broker, host, port);

    let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
        KafkalinkClientError::connection(
            broker.as_str(),
            format!("failed to connect to {}:{}: {}", host, port, e),
        )
    })?;
    tcp.set_nodelay(true)?;

    if !profile.secure {
        return Ok(BrokerStream::Plain(tcp));
    }
    let connector = settings.tls.as_ref().ok_or_else(|| {
        KafkalinkClientError::invalid_config("secure profile without TLS options")
    })?;
    let tls = connector.connect(&broker, host, tcp).await?;
    Ok(BrokerStream::Tls(Box::new(tls)))
}

/// Plaintext or TLS broker stream
pub enum BrokerStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for BrokerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BrokerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
