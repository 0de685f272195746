//! Error taxonomy for the queue pipeline.
//!
//! Only connection establishment at startup and topology conflicts are fatal;
//! everything that happens to a single delivery is resolved inside the
//! consumer loop.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Bounded connect retries ran out. The process cannot continue.
    #[error("broker unreachable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// An established connection or channel went away mid-operation.
    #[error("broker connection lost: {0}")]
    Lost(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// The queue exists with parameters incompatible with ours.
    #[error("queue '{queue}' exists with incompatible parameters: {reason}")]
    Conflict { queue: String, reason: String },

    #[error("failed to declare queue '{queue}': {reason}")]
    Broker { queue: String, reason: String },
}

#[derive(Debug, Error)]
#[error("malformed job body: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("job processing failed: {0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("broker connection not established")]
    NotConnected,

    #[error("broker rejected publish: {0}")]
    Rejected(String),

    #[error("failed to serialize job: {0}")]
    Serialization(String),
}

/// Failure of an ack, reject or dead-letter call on an open channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("broker operation failed: {0}")]
pub struct BrokerError(pub String);

impl From<BrokerError> for ConnectionError {
    fn from(err: BrokerError) -> Self {
        ConnectionError::Lost(err.0)
    }
}

/// Reasons the worker stops for good.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl From<BrokerError> for WorkerError {
    fn from(err: BrokerError) -> Self {
        WorkerError::Connection(err.into())
    }
}
