// 8.0.2: result types and errors for engine operations.

use crate::channel::ChannelError;
use crate::collab_revert::RevertError;
use crate::config::ConfigError;
use crate::message::MessageKind;
use crate::order::{OrderError, TradeAction};
use crate::price_feed::PriceFeedError;
use crate::storage::StorageError;
use crate::transport::{ChainError, TransportError};
use crate::types::{ChannelId, OrderId, PeerId, ProtocolId, Sats, TaskId};

/// Returned by `submit_market_order`. The trade itself runs as a background task.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: OrderId,
    pub channel_id: ChannelId,
    pub action: TradeAction,
    pub task_id: TaskId,
}

/// Where the funding for a new channel comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingSource {
    /// Coordinator wallet funds the output right away.
    Wallet,
    /// Trader pays to an address first. The order waits until the funding is reported.
    External,
}

/// Returned by `submit_channel_opening_order`.
#[derive(Debug, Clone)]
pub struct ChannelOpening {
    pub order_id: OrderId,
    pub channel_id: ChannelId,
    /// Set for externally funded openings until the funding arrives.
    pub funding_address: Option<String>,
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("channel {channel_id} has a negotiation in progress (owner {owner})")]
    NegotiationInProgress { channel_id: ChannelId, owner: ProtocolId },

    #[error("counterparty {peer} timed out after {timeout_ms}ms")]
    CounterpartyTimeout { peer: PeerId, timeout_ms: u64 },

    #[error("counterparty {peer} rejected our signature: {reason}")]
    SignatureRejected { peer: PeerId, reason: String },

    #[error("counterparty {peer} declined the offer: {reason}")]
    FailedAccept { peer: PeerId, reason: String },

    #[error("counterparty {peer} declined to sign: {reason}")]
    FailedSign { peer: PeerId, reason: String },

    #[error("insufficient capacity on channel {channel_id}: need {needed}, have {available}")]
    InsufficientChannelCapacity { channel_id: ChannelId, needed: Sats, available: Sats },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("no usable price: {0}")]
    NoPrice(#[from] PriceFeedError),

    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("no open channel with {0}")]
    NoChannel(PeerId),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("order {0} is not waiting for funding")]
    NotUnfunded(OrderId),

    #[error("{0} already has an open channel")]
    ChannelExists(PeerId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {0} has no channel")]
    TaskWithoutChannel(TaskId),

    #[error("order rejected: {0}")]
    Order(#[from] OrderError),

    #[error("channel error: {0}")]
    Channel(ChannelError),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("collaborative revert: {0}")]
    Revert(#[from] RevertError),

    #[error("unexpected reply {got:?} to {sent:?}")]
    UnexpectedMessage { sent: MessageKind, got: MessageKind },

    #[error("escalated to collaborative revert after {timeouts} timeouts")]
    Escalated { timeouts: u32 },

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Errors the supervisor retries with backoff. Everything else is final for the attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::NegotiationInProgress { .. }
            | EngineError::CounterpartyTimeout { .. }
            | EngineError::NoPrice(_)
            | EngineError::Chain(ChainError::Unavailable(_)) => true,
            EngineError::Transport(TransportError::Disconnected(_)) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::CounterpartyTimeout { .. })
    }
}

impl From<ChannelError> for EngineError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::NegotiationInProgress { channel_id, owner } => {
                EngineError::NegotiationInProgress { channel_id, owner }
            }
            ChannelError::InsufficientCapacity { channel_id, needed, available } => {
                EngineError::InsufficientChannelCapacity { channel_id, needed, available }
            }
            other => EngineError::Channel(other),
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout { peer, timeout_ms } => EngineError::CounterpartyTimeout { peer, timeout_ms },
            other => EngineError::Transport(other),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(error: StorageError) -> Self {
        EngineError::PersistenceFailure(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_retryable_rejections_are_not() {
        let timeout: EngineError = TransportError::Timeout { peer: PeerId::new("t"), timeout_ms: 10 }.into();
        assert!(timeout.is_retryable());
        assert!(timeout.is_timeout());

        let rejected = EngineError::FailedSign { peer: PeerId::new("t"), reason: "bad".into() };
        assert!(!rejected.is_retryable());
        assert!(!EngineError::PersistenceFailure("disk".into()).is_retryable());
    }

    #[test]
    fn channel_errors_map_onto_engine_taxonomy() {
        let channel_id = ChannelId::new();
        let owner = ProtocolId::new();
        let err: EngineError = ChannelError::NegotiationInProgress { channel_id, owner }.into();
        assert!(matches!(err, EngineError::NegotiationInProgress { .. }));

        let err: EngineError =
            ChannelError::InsufficientCapacity { channel_id, needed: Sats::new(2), available: Sats::new(1) }.into();
        assert!(matches!(err, EngineError::InsufficientChannelCapacity { .. }));
    }

    #[test]
    fn rejection_detail_is_in_the_message() {
        let err = EngineError::FailedAccept { peer: PeerId::new("t"), reason: "margin too low".into() };
        assert!(err.to_string().contains("margin too low"));
    }
}
