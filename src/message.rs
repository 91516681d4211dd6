// 2.7 message.rs: wire messages between the two peers of a channel.
// transport framing lives elsewhere. these are the payloads it carries.

use crate::channel::{ChannelReserves, ProposedTerms};
use crate::collab_revert::RevertProposal;
use crate::types::{ChannelId, ProtocolId, TxRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectKind {
    /// Counterparty refused the terms.
    Declined,
    /// Counterparty could not verify our signature.
    InvalidSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DlcMessage {
    ChannelOffer {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
        reserves: ChannelReserves,
        fee_rate_sats_vb: u64,
    },
    ChannelAccept {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
    },
    ChannelSign {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
        funding: TxRef,
    },
    ChannelSignAck {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
    },
    RenewOffer {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
        terms: ProposedTerms,
    },
    RenewAccept {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
    },
    RenewConfirm {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
    },
    RenewFinalize {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
    },
    SettleOffer {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
        terms: ProposedTerms,
    },
    SettleAccept {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
    },
    SettleConfirm {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
    },
    SettleFinalize {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
    },
    CollabRevertPropose {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
        proposal: RevertProposal,
    },
    CollabRevertAccept {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
        signature: String,
    },
    Reject {
        protocol_id: ProtocolId,
        channel_id: ChannelId,
        kind: RejectKind,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    ChannelOffer,
    ChannelAccept,
    ChannelSign,
    ChannelSignAck,
    RenewOffer,
    RenewAccept,
    RenewConfirm,
    RenewFinalize,
    SettleOffer,
    SettleAccept,
    SettleConfirm,
    SettleFinalize,
    CollabRevertPropose,
    CollabRevertAccept,
    Reject,
}

impl DlcMessage {
    pub fn protocol_id(&self) -> ProtocolId {
        match self {
            DlcMessage::ChannelOffer { protocol_id, .. }
            | DlcMessage::ChannelAccept { protocol_id, .. }
            | DlcMessage::ChannelSign { protocol_id, .. }
            | DlcMessage::ChannelSignAck { protocol_id, .. }
            | DlcMessage::RenewOffer { protocol_id, .. }
            | DlcMessage::RenewAccept { protocol_id, .. }
            | DlcMessage::RenewConfirm { protocol_id, .. }
            | DlcMessage::RenewFinalize { protocol_id, .. }
            | DlcMessage::SettleOffer { protocol_id, .. }
            | DlcMessage::SettleAccept { protocol_id, .. }
            | DlcMessage::SettleConfirm { protocol_id, .. }
            | DlcMessage::SettleFinalize { protocol_id, .. }
            | DlcMessage::CollabRevertPropose { protocol_id, .. }
            | DlcMessage::CollabRevertAccept { protocol_id, .. }
            | DlcMessage::Reject { protocol_id, .. } => *protocol_id,
        }
    }

    /// Same message under another protocol id.
    pub fn with_protocol_id(mut self, id: ProtocolId) -> Self {
        match &mut self {
            DlcMessage::ChannelOffer { protocol_id, .. }
            | DlcMessage::ChannelAccept { protocol_id, .. }
            | DlcMessage::ChannelSign { protocol_id, .. }
            | DlcMessage::ChannelSignAck { protocol_id, .. }
            | DlcMessage::RenewOffer { protocol_id, .. }
            | DlcMessage::RenewAccept { protocol_id, .. }
            | DlcMessage::RenewConfirm { protocol_id, .. }
            | DlcMessage::RenewFinalize { protocol_id, .. }
            | DlcMessage::SettleOffer { protocol_id, .. }
            | DlcMessage::SettleAccept { protocol_id, .. }
            | DlcMessage::SettleConfirm { protocol_id, .. }
            | DlcMessage::SettleFinalize { protocol_id, .. }
            | DlcMessage::CollabRevertPropose { protocol_id, .. }
            | DlcMessage::CollabRevertAccept { protocol_id, .. }
            | DlcMessage::Reject { protocol_id, .. } => *protocol_id = id,
        }
        self
    }

    pub fn channel_id(&self) -> ChannelId {
        match self {
            DlcMessage::ChannelOffer { channel_id, .. }
            | DlcMessage::ChannelAccept { channel_id, .. }
            | DlcMessage::ChannelSign { channel_id, .. }
            | DlcMessage::ChannelSignAck { channel_id, .. }
            | DlcMessage::RenewOffer { channel_id, .. }
            | DlcMessage::RenewAccept { channel_id, .. }
            | DlcMessage::RenewConfirm { channel_id, .. }
            | DlcMessage::RenewFinalize { channel_id, .. }
            | DlcMessage::SettleOffer { channel_id, .. }
            | DlcMessage::SettleAccept { channel_id, .. }
            | DlcMessage::SettleConfirm { channel_id, .. }
            | DlcMessage::SettleFinalize { channel_id, .. }
            | DlcMessage::CollabRevertPropose { channel_id, .. }
            | DlcMessage::CollabRevertAccept { channel_id, .. }
            | DlcMessage::Reject { channel_id, .. } => *channel_id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            DlcMessage::ChannelOffer { .. } => MessageKind::ChannelOffer,
            DlcMessage::ChannelAccept { .. } => MessageKind::ChannelAccept,
            DlcMessage::ChannelSign { .. } => MessageKind::ChannelSign,
            DlcMessage::ChannelSignAck { .. } => MessageKind::ChannelSignAck,
            DlcMessage::RenewOffer { .. } => MessageKind::RenewOffer,
            DlcMessage::RenewAccept { .. } => MessageKind::RenewAccept,
            DlcMessage::RenewConfirm { .. } => MessageKind::RenewConfirm,
            DlcMessage::RenewFinalize { .. } => MessageKind::RenewFinalize,
            DlcMessage::SettleOffer { .. } => MessageKind::SettleOffer,
            DlcMessage::SettleAccept { .. } => MessageKind::SettleAccept,
            DlcMessage::SettleConfirm { .. } => MessageKind::SettleConfirm,
            DlcMessage::SettleFinalize { .. } => MessageKind::SettleFinalize,
            DlcMessage::CollabRevertPropose { .. } => MessageKind::CollabRevertPropose,
            DlcMessage::CollabRevertAccept { .. } => MessageKind::CollabRevertAccept,
            DlcMessage::Reject { .. } => MessageKind::Reject,
        }
    }

    /// Offer for the given terms. renew and settle use different message kinds.
    pub fn offer(protocol_id: ProtocolId, channel_id: ChannelId, terms: ProposedTerms) -> Self {
        if terms.is_settle() {
            DlcMessage::SettleOffer { protocol_id, channel_id, terms }
        } else {
            DlcMessage::RenewOffer { protocol_id, channel_id, terms }
        }
    }

    pub fn confirm(protocol_id: ProtocolId, channel_id: ChannelId, settle: bool) -> Self {
        if settle {
            DlcMessage::SettleConfirm { protocol_id, channel_id }
        } else {
            DlcMessage::RenewConfirm { protocol_id, channel_id }
        }
    }

    pub fn reject(protocol_id: ProtocolId, channel_id: ChannelId, kind: RejectKind, reason: impl Into<String>) -> Self {
        DlcMessage::Reject { protocol_id, channel_id, kind, reason: reason.into() }
    }

    /// Content hash used to spot inbound duplicates.
    pub fn hash(&self) -> String {
        digest(self)
    }
}

// sha256 over the json encoding, hex encoded
pub fn digest<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_distinguishes_messages() {
        let protocol_id = ProtocolId::new();
        let channel_id = ChannelId::new();
        let a = DlcMessage::RenewAccept { protocol_id, channel_id };
        let b = DlcMessage::RenewConfirm { protocol_id, channel_id };
        assert_eq!(a.hash(), a.clone().hash());
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn accessors_cover_reject() {
        let protocol_id = ProtocolId::new();
        let channel_id = ChannelId::new();
        let msg = DlcMessage::reject(protocol_id, channel_id, RejectKind::Declined, "no");
        assert_eq!(msg.protocol_id(), protocol_id);
        assert_eq!(msg.channel_id(), channel_id);
        assert_eq!(msg.kind(), MessageKind::Reject);
    }
}
