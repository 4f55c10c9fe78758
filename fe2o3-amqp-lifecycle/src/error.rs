//! Errors of the lifecycle layer

use std::{fmt, time::Duration};

use fe2o3_amqp_types::definitions::{self, ErrorCondition};

use crate::engine::EngineError;

/// Errors returned by every awaitable operation
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The remote peer (or the engine) reported an AMQP error
    #[error("Protocol error {:?}", .0)]
    Protocol(definitions::Error),

    /// The transport was lost before the operation completed
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// The entity was closed or removed without an AMQP error before the
    /// operation completed
    #[error("{0}")]
    Closed(String),

    /// The awaited transition did not happen within the operation timeout
    #[error(transparent)]
    OperationTimeout(#[from] OperationTimeoutError),

    /// The caller supplied signal fired before the operation completed
    #[error(transparent)]
    Cancelled(#[from] CancellationError),

    /// A send was attempted without link credit
    #[error(transparent)]
    InsufficientCredit(#[from] InsufficientCreditError),

    /// The message received a negative disposition
    #[error(transparent)]
    SendOperationFailed(#[from] SendOperationFailedError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Protocol(error) => Self::Protocol(error),
            EngineError::Disconnected(reason) => Self::Disconnected(reason),
        }
    }
}

impl Error {
    /// Whether this is an [`OperationTimeoutError`]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::OperationTimeout(_))
    }

    /// Whether this is a [`CancellationError`]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The AMQP error condition, if the error carries one
    pub fn condition(&self) -> Option<&ErrorCondition> {
        match self {
            Self::Protocol(error) => Some(&error.condition),
            Self::SendOperationFailed(err) => err.error.as_ref().map(|e| &e.condition),
            _ => None,
        }
    }
}

/// An awaited transition missed its window
#[derive(Debug, Clone, thiserror::Error)]
#[error("Unable to {action} due to operation timeout after {timeout:?}")]
pub struct OperationTimeoutError {
    /// The operation, phrased as "open the connection 'c1'"
    pub action: String,

    /// The window that elapsed
    pub timeout: Duration,
}

/// A caller supplied signal fired before settlement
#[derive(Debug, Clone, thiserror::Error)]
#[error("The operation to {action} was cancelled")]
pub struct CancellationError {
    /// The operation, phrased as "open the connection 'c1'"
    pub action: String,
}

/// A send was attempted on a link without credit
#[derive(Debug, Clone, thiserror::Error)]
#[error("Sender '{link}' cannot send the message right now as it does not have enough credit")]
pub struct InsufficientCreditError {
    /// Name of the sending link
    pub link: String,
}

/// The negative outcome of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedOutcome {
    /// The receiver rejected the message
    Rejected,

    /// The receiver released the message
    Released,

    /// The receiver modified the message
    Modified,
}

impl fmt::Display for FailedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedOutcome::Rejected => f.write_str("rejected"),
            FailedOutcome::Released => f.write_str("released"),
            FailedOutcome::Modified => f.write_str("modified"),
        }
    }
}

/// A message sent by an [`AwaitableSender`](crate::link::AwaitableSender)
/// received a negative disposition
#[derive(Debug, Clone, thiserror::Error)]
#[error("Delivery {delivery_id} was {outcome} by the receiver. Error: {error:?}")]
pub struct SendOperationFailedError {
    /// Id of the failed delivery
    pub delivery_id: u32,

    /// The outcome reported by the receiver
    pub outcome: FailedOutcome,

    /// The error attached to a rejection
    pub error: Option<definitions::Error>,
}

/// Invalid configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The operation timeout must be greater than zero
    #[error("Operation timeout must be greater than zero")]
    ZeroOperationTimeout,

    /// The send timeout must be greater than zero
    #[error("Send timeout must be greater than zero")]
    ZeroSendTimeout,

    /// The max frame size is below the minimum allowed by the protocol
    #[error("Max frame size {0} is smaller than the minimum {min}", min = crate::connection::MIN_MAX_FRAME_SIZE)]
    MaxFrameSizeTooSmall(u32),

    /// A connection must be created within a Tokio runtime
    #[error("No Tokio runtime is available")]
    MissingRuntime,
}
