//! Message channel between the coordinator and the primary engine's worker
//!
//! Every primary operation is an [`EngineRequest`] delivered through a
//! [`Transport`]. The worker may still be bootstrapping when the first request
//! arrives; such requests are dropped with [`ChannelFault::NotReady`] and the
//! [`RetryingChannel`] redelivers them with linear backoff. Failures reported
//! by the engine itself come back as [`EngineFailure`] and are never retried.

use async_trait::async_trait;
use beacon_types::{
    DeleteOutcome, EntityKind, EntityPruneStats, Page, QueryFilter, Record, RecordId, Timestamp,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

/// Request sent to the worker: operation, entity and payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EngineRequest {
    Initialize,
    Insert {
        record: Record,
    },
    Query {
        entity: EntityKind,
        filter: Option<QueryFilter>,
        limit: usize,
        offset: usize,
    },
    DeleteById {
        entity: EntityKind,
        id: RecordId,
    },
    Prune {
        entity: EntityKind,
        cutoff: Timestamp,
        max_records: u64,
    },
    Count {
        entity: EntityKind,
    },
    Clear {
        entity: EntityKind,
    },
    Size,
    Shutdown,
}

impl EngineRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            EngineRequest::Initialize => "initialize",
            EngineRequest::Insert { .. } => "insert",
            EngineRequest::Query { .. } => "query",
            EngineRequest::DeleteById { .. } => "delete_by_id",
            EngineRequest::Prune { .. } => "prune",
            EngineRequest::Count { .. } => "count",
            EngineRequest::Clear { .. } => "clear",
            EngineRequest::Size => "size",
            EngineRequest::Shutdown => "shutdown",
        }
    }

    pub fn entity(&self) -> Option<EntityKind> {
        match self {
            EngineRequest::Insert { record } => Some(record.kind()),
            EngineRequest::Query { entity, .. }
            | EngineRequest::DeleteById { entity, .. }
            | EngineRequest::Prune { entity, .. }
            | EngineRequest::Count { entity }
            | EngineRequest::Clear { entity } => Some(*entity),
            EngineRequest::Initialize | EngineRequest::Size | EngineRequest::Shutdown => None,
        }
    }
}

/// Successful worker reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum EngineReply {
    Initialized { sqlite_version: String },
    Inserted(RecordId),
    Page(Page),
    Deleted(DeleteOutcome),
    Pruned(EntityPruneStats),
    Count(u64),
    Cleared(u64),
    Size(u64),
    ShutDown,
}

/// Failure reported by the engine inside the worker
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum EngineFailure {
    #[error("request rejected: {0}")]
    Rejected(ValidationError),
    #[error("{0}")]
    Engine(String),
}

impl From<EngineFailure> for StorageError {
    fn from(failure: EngineFailure) -> Self {
        match failure {
            EngineFailure::Rejected(e) => StorageError::Validation(e),
            EngineFailure::Engine(message) => StorageError::Engine(message),
        }
    }
}

impl From<sqlx::Error> for EngineFailure {
    fn from(e: sqlx::Error) -> Self {
        EngineFailure::Engine(e.to_string())
    }
}

pub type EngineResponse = std::result::Result<EngineReply, EngineFailure>;

/// A request plus the slot its response goes into
#[derive(Debug)]
pub struct Envelope {
    pub request: EngineRequest,
    pub reply: oneshot::Sender<EngineResponse>,
}

/// Lifecycle of the worker on the far side of the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Booting,
    Ready,
    Failed(String),
    Stopped,
}

/// Delivery failures, as opposed to engine failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelFault {
    #[error("receiver not ready")]
    NotReady,
    #[error("receiver disconnected")]
    Disconnected,
    #[error("worker failed to start: {0}")]
    WorkerFailed(String),
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
    #[error("worker dropped the reply")]
    ReplyDropped,
}

impl ChannelFault {
    /// Only faults where the request was never delivered are safe to resend
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelFault::NotReady | ChannelFault::Disconnected)
    }
}

/// One delivery attempt of a request, no retries
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(
        &self,
        request: EngineRequest,
    ) -> std::result::Result<EngineResponse, ChannelFault>;
}

/// Production transport: a bounded mailbox into the worker task
pub struct MailboxTransport {
    sender: mpsc::Sender<Envelope>,
    state: watch::Receiver<WorkerState>,
    request_timeout: Duration,
}

/// The worker's end of a [`MailboxTransport`]
pub struct Mailbox {
    pub receiver: mpsc::Receiver<Envelope>,
    pub state: watch::Sender<WorkerState>,
}

impl MailboxTransport {
    pub fn pair(capacity: usize, request_timeout: Duration) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(WorkerState::Booting);
        (
            Self {
                sender,
                state: state_rx,
                request_timeout,
            },
            Mailbox {
                receiver,
                state: state_tx,
            },
        )
    }

    pub fn worker_state(&self) -> WorkerState {
        self.state.borrow().clone()
    }
}

#[async_trait]
impl Transport for MailboxTransport {
    async fn dispatch(
        &self,
        request: EngineRequest,
    ) -> std::result::Result<EngineResponse, ChannelFault> {
        match self.worker_state() {
            WorkerState::Ready => {}
            WorkerState::Booting => return Err(ChannelFault::NotReady),
            WorkerState::Failed(reason) => return Err(ChannelFault::WorkerFailed(reason)),
            WorkerState::Stopped => return Err(ChannelFault::Disconnected),
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Envelope {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ChannelFault::Disconnected)?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ChannelFault::ReplyDropped),
            Err(_) => Err(ChannelFault::TimedOut(self.request_timeout)),
        }
    }
}

/// Bounded linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Request/response calls over a [`Transport`] with retry on transient faults
#[derive(Clone)]
pub struct RetryingChannel {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryingChannel {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Deliver a request and wait for its reply
    pub async fn call(&self, request: EngineRequest) -> Result<EngineReply> {
        let operation = request.operation();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.transport.dispatch(request.clone()).await {
                Ok(Ok(reply)) => {
                    debug!("{} succeeded on attempt {}", operation, attempt);
                    return Ok(reply);
                }
                Ok(Err(failure)) => return Err(failure.into()),
                Err(fault) if fault.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "{} failed ({}) on attempt {}/{}, retrying in {:?}",
                        operation, fault, attempt, max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(fault) => {
                    warn!(
                        "{} abandoned after {} attempt(s): {}",
                        operation, attempt, fault
                    );
                    return Err(StorageError::ChannelUnavailable {
                        attempts: attempt,
                        reason: fault.to_string(),
                    });
                }
            }
        }
    }
}
