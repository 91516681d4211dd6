// 10.5 transport.rs: seams to the outside world. the message layer delivers
// ordered, authenticated messages per peer and returns the peer's reply. the
// chain seam publishes funding, broadcasts closes and reports spent outputs.

use crate::message::DlcMessage;
use crate::types::{ChannelId, PeerId, Sats, TxRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {peer} did not answer within {timeout_ms}ms")]
    Timeout { peer: PeerId, timeout_ms: u64 },

    #[error("peer {0} is not connected")]
    Disconnected(PeerId),

    #[error("protocol error with {peer}: {reason}")]
    Protocol { peer: PeerId, reason: String },
}

/// Request/response over the peer connection. A reply of `Reject` is a
/// protocol answer, not a transport error.
#[async_trait]
pub trait DlcTransport: Send + Sync {
    async fn request(&self, peer: &PeerId, message: DlcMessage) -> Result<DlcMessage, TransportError>;

    fn is_connected(&self, peer: &PeerId) -> bool;
}

// wraps any transport future in the negotiation deadline
pub async fn with_deadline<F>(peer: &PeerId, timeout: Duration, fut: F) -> Result<DlcMessage, TransportError>
where
    F: Future<Output = Result<DlcMessage, TransportError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            peer: peer.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("chain backend unavailable: {0}")]
    Unavailable(String),

    #[error("broadcast rejected: {0}")]
    Rejected(String),
}

/// Who spent a funding output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendKind {
    /// Counterparty published its commitment.
    Counterparty,
    /// We punished a revoked commitment.
    Punish,
    /// Our own close confirmed.
    Own,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub height: u64,
    pub spent: HashMap<TxRef, SpendKind>,
}

#[async_trait]
pub trait Blockchain: Send + Sync {
    async fn new_address(&self) -> Result<String, ChainError>;

    /// Funds the channel output from the coordinator wallet.
    async fn publish_funding(&self, channel_id: ChannelId, amount: Sats) -> Result<TxRef, ChainError>;

    /// Returns the txid.
    async fn broadcast(&self, tx: &str) -> Result<String, ChainError>;

    async fn sync(&self) -> Result<ChainSnapshot, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProtocolId;

    #[tokio::test]
    async fn deadline_turns_into_timeout() {
        let peer = PeerId::new("slow");
        let result = with_deadline(&peer, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DlcMessage::RenewAccept { protocol_id: ProtocolId::new(), channel_id: ChannelId::new() })
        })
        .await;
        assert!(matches!(result, Err(TransportError::Timeout { timeout_ms: 10, .. })));
    }

    #[tokio::test]
    async fn fast_reply_passes_through() {
        let peer = PeerId::new("fast");
        let msg = DlcMessage::RenewAccept { protocol_id: ProtocolId::new(), channel_id: ChannelId::new() };
        let result = with_deadline(&peer, Duration::from_secs(1), {
            let msg = msg.clone();
            async move { Ok(msg) }
        })
        .await;
        assert_eq!(result, Ok(msg));
    }
}
