//! Per-connection correlation table
//!
//! Owned by the I/O task of a single socket channel, so it needs no locking.
//! Every registered request is completed exactly once: by its response, by its
//! deadline, or by [`CorrelationTable::flush`] when the connection goes away.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::error::KafkalinkClientError;
use crate::protocol::CorrelationId;

/// How many timed-out ids are remembered so their late responses are not
/// mistaken for protocol violations.
const EXPIRED_MEMORY: usize = 1024;

/// Receives the outcome of a request. Dropping the caller's future turns this
/// into a no-op.
pub type Completion = Box<dyn FnOnce(Result<Bytes, KafkalinkClientError>) + Send>;

/// A request waiting for its response frame
pub struct PendingRequest {
    pub correlation_id: CorrelationId,
    pub api_key: i16,
    /// Strip tagged fields from the response header before decoding
    pub flexible_response: bool,
    /// When the caller submitted the request; deadlines count from here
    pub issued_at: Instant,
    completion: Completion,
    deadline: Option<(delay_queue::Key, Duration)>,
}

impl PendingRequest {
    pub fn new(
        correlation_id: CorrelationId,
        api_key: i16,
        flexible_response: bool,
        completion: Completion,
    ) -> Self {
        Self {
            correlation_id,
            api_key,
            flexible_response,
            issued_at: Instant::now(),
            completion,
            deadline: None,
        }
    }

    /// Backdate the request to when the caller submitted it
    pub fn with_issued_at(mut self, issued_at: Instant) -> Self {
        self.issued_at = issued_at;
        self
    }

    /// Complete the request, consuming it
    pub fn complete(self, result: Result<Bytes, KafkalinkClientError>) {
        (self.completion)(result)
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("correlation_id", &self.correlation_id)
            .field("api_key", &self.api_key)
            .field("flexible_response", &self.flexible_response)
            .finish()
    }
}

/// Outcome of matching an incoming correlation id
#[derive(Debug)]
pub enum Lookup {
    Pending(PendingRequest),
    /// The request already timed out; its late response is dropped
    Expired,
    Unknown,
}

#[derive(Default)]
pub struct CorrelationTable {
    next_id: CorrelationId,
    pending: HashMap<CorrelationId, PendingRequest>,
    deadlines: DelayQueue<CorrelationId>,
    expired: HashSet<CorrelationId>,
    expired_order: VecDeque<CorrelationId>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id: increasing, wrapping from `i32::MAX` to 0, never
    /// one that is still outstanding.
    pub fn next_correlation_id(&mut self) -> CorrelationId {
        loop {
            let id = self.next_id;
            self.next_id = if id == CorrelationId::MAX { 0 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                self.forget_expired(id);
                return id;
            }
        }
    }

    /// Register a pending request, optionally with a deadline of `timeout`
    /// after its issue time
    pub fn register(&mut self, mut request: PendingRequest, timeout: Option<Duration>) {
        let id = request.correlation_id;
        if let Some(timeout) = timeout {
            let key = self.deadlines.insert_at(id, request.issued_at + timeout);
            request.deadline = Some((key, timeout));
        }
        if let Some(previous) = self.pending.insert(id, request) {
            // next_correlation_id never hands out a live id
            previous.complete(Err(KafkalinkClientError::protocol(format!(
                "correlation id {} registered twice",
                id
            ))));
        }
    }

    /// Remove the entry matching an incoming response
    pub fn take(&mut self, correlation_id: CorrelationId) -> Lookup {
        match self.pending.remove(&correlation_id) {
            Some(mut request) => {
                if let Some((key, _)) = request.deadline.take() {
                    self.deadlines.remove(&key);
                }
                Lookup::Pending(request)
            }
            None if self.forget_expired(correlation_id) => Lookup::Expired,
            None => Lookup::Unknown,
        }
    }

    /// Wait for the next request to pass its deadline and fail it with a
    /// timeout. Pending forever while no deadline is armed.
    pub async fn next_expired(&mut self) -> CorrelationId {
        loop {
            match futures::future::poll_fn(|cx| self.deadlines.poll_expired(cx)).await {
                Some(expired) => {
                    let id = expired.into_inner();
                    if let Some(mut request) = self.pending.remove(&id) {
                        let timeout = request
                            .deadline
                            .take()
                            .map(|(_, t)| t)
                            .unwrap_or_default();
                        self.remember_expired(id);
                        request.complete(Err(KafkalinkClientError::timeout(
                            timeout.as_millis() as u64,
                        )));
                        return id;
                    }
                }
                None => futures::future::pending::<()>().await,
            }
        }
    }

    /// Fail every outstanding request with the error built by `error`
    pub fn flush(&mut self, error: impl Fn() -> KafkalinkClientError) -> usize {
        self.deadlines.clear();
        let drained: Vec<_> = self.pending.drain().map(|(_, request)| request).collect();
        let count = drained.len();
        for request in drained {
            request.complete(Err(error()));
        }
        count
    }

    /// Number of requests awaiting a response
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether `correlation_id` is still outstanding
    pub fn contains(&self, correlation_id: CorrelationId) -> bool {
        self.pending.contains_key(&correlation_id)
    }

    fn remember_expired(&mut self, id: CorrelationId) {
        if self.expired.insert(id) {
            self.expired_order.push_back(id);
        }
        while self.expired_order.len() > EXPIRED_MEMORY {
            if let Some(oldest) = self.expired_order.pop_front() {
                self.expired.remove(&oldest);
            }
        }
    }

    fn forget_expired(&mut self, id: CorrelationId) -> bool {
        if self.expired.remove(&id) {
            self.expired_order.retain(|e| *e != id);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("next_id", &self.next_id)
            .field("pending", &self.pending.len())
            .field("expired", &self.expired.len())
            .finish()
    }
}
