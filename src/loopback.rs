//! In-process counterparties for the simulator and the integration tests.
//!
//! `LoopbackTransport` plays the trader: it keeps its own copy of every channel
//! and runs the receiver side of each protocol step against it. Faults can be
//! scripted per step. `MockChain` and `StaticPriceFeed` stand in for the chain
//! backend and the quote source.

use crate::channel::{Channel, ChannelState};
use crate::collab_revert::{verify_proposal, COLLAB_REVERT_TX_WEIGHT};
use crate::message::{digest, DlcMessage, RejectKind};
use crate::price_feed::{PriceFeed, PriceFeedError, PriceSnapshot};
use crate::transport::{Blockchain, ChainError, ChainSnapshot, DlcTransport, SpendKind, TransportError};
use crate::types::{ChannelId, ContractSymbol, PeerId, Price, ProtocolId, Sats, Timestamp, TxRef};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Protocol step a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    ChannelOffer,
    ChannelSign,
    RenewOffer,
    RenewConfirm,
    SettleOffer,
    SettleConfirm,
    CollabRevert,
}

impl Step {
    fn of(message: &DlcMessage) -> Option<Step> {
        Some(match message {
            DlcMessage::ChannelOffer { .. } => Step::ChannelOffer,
            DlcMessage::ChannelSign { .. } => Step::ChannelSign,
            DlcMessage::RenewOffer { .. } => Step::RenewOffer,
            DlcMessage::RenewConfirm { .. } => Step::RenewConfirm,
            DlcMessage::SettleOffer { .. } => Step::SettleOffer,
            DlcMessage::SettleConfirm { .. } => Step::SettleConfirm,
            DlcMessage::CollabRevertPropose { .. } => Step::CollabRevert,
            _ => return None,
        })
    }
}

#[derive(Default)]
struct Faults {
    rejects: HashMap<Step, (RejectKind, String)>,
    // message lost before the trader sees it
    lost: HashMap<Step, u32>,
    // trader processes the message but the reply is lost
    dropped: HashMap<Step, u32>,
    // peer drops off the link for this message
    unreachable: HashMap<Step, u32>,
    // reply arrives under another protocol id
    misaddressed: HashMap<Step, u32>,
}

fn take(counts: &mut HashMap<Step, u32>, step: Step) -> bool {
    match counts.get_mut(&step) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

#[derive(Default)]
struct TraderState {
    channels: HashMap<ChannelId, Channel>,
    replies: HashMap<String, DlcMessage>,
    received: Vec<DlcMessage>,
    faults: Faults,
    disconnected: HashSet<PeerId>,
    delay: Duration,
}

/// Trader side of every channel, answering in process.
pub struct LoopbackTransport {
    coordinator: PeerId,
    revert_tx_weight: u64,
    state: Mutex<TraderState>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(PeerId::new("coordinator"))
    }
}

impl LoopbackTransport {
    pub fn new(coordinator: PeerId) -> Self {
        Self {
            coordinator,
            revert_tx_weight: COLLAB_REVERT_TX_WEIGHT,
            state: Mutex::new(TraderState::default()),
        }
    }

    pub fn with_revert_tx_weight(mut self, tx_weight: u64) -> Self {
        self.revert_tx_weight = tx_weight;
        self
    }

    /// Answer every message of `step` with a reject until cleared.
    pub fn reject(&self, step: Step, kind: RejectKind, reason: impl Into<String>) {
        self.state.lock().faults.rejects.insert(step, (kind, reason.into()));
    }

    pub fn clear(&self, step: Step) {
        self.state.lock().faults.rejects.remove(&step);
    }

    /// Lose the next `n` messages of `step` before the trader handles them.
    pub fn time_out(&self, step: Step, n: u32) {
        self.state.lock().faults.lost.insert(step, n);
    }

    /// Handle the next `n` messages of `step` but lose the replies.
    pub fn drop_replies(&self, step: Step, n: u32) {
        self.state.lock().faults.dropped.insert(step, n);
    }

    /// Fail the next `n` messages of `step` as if the trader had disconnected.
    pub fn disconnect_on(&self, step: Step, n: u32) {
        self.state.lock().faults.unreachable.insert(step, n);
    }

    /// Handle the next `n` messages of `step` but answer under a foreign protocol id.
    pub fn misaddress_replies(&self, step: Step, n: u32) {
        self.state.lock().faults.misaddressed.insert(step, n);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn set_connected(&self, peer: &PeerId, connected: bool) {
        let mut state = self.state.lock();
        if connected {
            state.disconnected.remove(peer);
        } else {
            state.disconnected.insert(peer.clone());
        }
    }

    /// The trader's copy of a channel.
    pub fn channel(&self, channel_id: ChannelId) -> Option<Channel> {
        self.state.lock().channels.get(&channel_id).cloned()
    }

    /// Every message that reached the trader, lost ones included.
    pub fn received(&self) -> Vec<DlcMessage> {
        self.state.lock().received.clone()
    }

    fn timeout(peer: &PeerId) -> TransportError {
        TransportError::Timeout { peer: peer.clone(), timeout_ms: 0 }
    }

    fn handle(&self, state: &mut TraderState, message: &DlcMessage) -> DlcMessage {
        let protocol_id = message.protocol_id();
        let channel_id = message.channel_id();

        if let Some((kind, reason)) = Step::of(message).and_then(|s| state.faults.rejects.get(&s).cloned()) {
            if matches!(message, DlcMessage::RenewConfirm { .. } | DlcMessage::SettleConfirm { .. }) {
                if let Some(channel) = state.channels.get_mut(&channel_id) {
                    if channel.active_negotiation(protocol_id).is_some() {
                        let _ = channel.rollback_negotiation(protocol_id, Timestamp::now());
                    }
                }
            }
            return DlcMessage::reject(protocol_id, channel_id, kind, reason);
        }

        self.respond(state, message)
            .unwrap_or_else(|reason| DlcMessage::reject(protocol_id, channel_id, RejectKind::Declined, reason))
    }

    fn respond(&self, state: &mut TraderState, message: &DlcMessage) -> Result<DlcMessage, String> {
        let now = Timestamp::now();
        let protocol_id = message.protocol_id();
        let channel_id = message.channel_id();

        if let DlcMessage::ChannelOffer { reserves, fee_rate_sats_vb, .. } = message {
            let channel = state.channels.entry(channel_id).or_insert_with(|| {
                Channel::offered(channel_id, self.coordinator.clone(), *reserves, *fee_rate_sats_vb, now)
            });
            if channel.state == ChannelState::Offered {
                channel.on_channel_accepted(now).map_err(|e| e.to_string())?;
            }
            return Ok(DlcMessage::ChannelAccept { protocol_id, channel_id });
        }

        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| format!("unknown channel {channel_id}"))?;

        match message {
            DlcMessage::ChannelSign { funding, .. } => {
                if channel.state == ChannelState::Accepted {
                    channel.on_channel_signed(funding.clone(), now).map_err(|e| e.to_string())?;
                }
                Ok(DlcMessage::ChannelSignAck { protocol_id, channel_id })
            }
            DlcMessage::RenewOffer { terms, .. } | DlcMessage::SettleOffer { terms, .. } => {
                if channel.active_negotiation(protocol_id).is_none() {
                    // the offerer has given up on anything older
                    if let Some(stale) = channel.negotiation.as_ref().map(|n| n.protocol_id) {
                        channel.rollback_negotiation(stale, now).map_err(|e| e.to_string())?;
                    }
                    channel.on_offer_received(protocol_id, terms.clone(), now).map_err(|e| e.to_string())?;
                    channel.on_accept(protocol_id, now).map_err(|e| e.to_string())?;
                }
                Ok(if terms.is_settle() {
                    DlcMessage::SettleAccept { protocol_id, channel_id }
                } else {
                    DlcMessage::RenewAccept { protocol_id, channel_id }
                })
            }
            DlcMessage::RenewConfirm { .. } | DlcMessage::SettleConfirm { .. } => {
                if channel.last_finalized != Some(protocol_id) {
                    channel.on_confirm(protocol_id, now).map_err(|e| e.to_string())?;
                    channel.finalize(protocol_id, now).map_err(|e| e.to_string())?;
                }
                Ok(match message {
                    DlcMessage::SettleConfirm { .. } => DlcMessage::SettleFinalize { protocol_id, channel_id },
                    _ => DlcMessage::RenewFinalize { protocol_id, channel_id },
                })
            }
            DlcMessage::CollabRevertPropose { proposal, .. } => {
                let signature = digest(&("sig", proposal));
                if channel.state != ChannelState::CollaborativelyClosed {
                    if !verify_proposal(channel, proposal, self.revert_tx_weight) {
                        return Err("revert proposal does not match the channel".to_string());
                    }
                    channel
                        .record_collaborative_close(digest(&(proposal, &signature)), now)
                        .map_err(|e| e.to_string())?;
                }
                Ok(DlcMessage::CollabRevertAccept { protocol_id, channel_id, signature })
            }
            other => Err(format!("unexpected {:?}", other.kind())),
        }
    }
}

#[async_trait]
impl DlcTransport for LoopbackTransport {
    async fn request(&self, peer: &PeerId, message: DlcMessage) -> Result<DlcMessage, TransportError> {
        let delay = self.state.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.disconnected.contains(peer) {
            return Err(TransportError::Disconnected(peer.clone()));
        }
        state.received.push(message.clone());

        let step = Step::of(&message);
        if step.is_some_and(|s| take(&mut state.faults.unreachable, s)) {
            debug!(peer = %peer, message = ?message.kind(), "loopback peer unreachable");
            return Err(TransportError::Disconnected(peer.clone()));
        }
        if step.is_some_and(|s| take(&mut state.faults.lost, s)) {
            debug!(peer = %peer, message = ?message.kind(), "loopback lost message");
            return Err(Self::timeout(peer));
        }

        // a resent message gets the reply it got the first time
        let hash = message.hash();
        let cached = state.replies.get(&hash).cloned();
        let reply = match cached {
            Some(reply) => reply,
            None => {
                let reply = self.handle(&mut state, &message);
                state.replies.insert(hash, reply.clone());
                reply
            }
        };

        if step.is_some_and(|s| take(&mut state.faults.dropped, s)) {
            debug!(peer = %peer, message = ?message.kind(), "loopback dropped reply");
            return Err(Self::timeout(peer));
        }
        if step.is_some_and(|s| take(&mut state.faults.misaddressed, s)) {
            debug!(peer = %peer, message = ?message.kind(), "loopback misaddressed reply");
            return Ok(reply.with_protocol_id(ProtocolId::new()));
        }
        Ok(reply)
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        !self.state.lock().disconnected.contains(peer)
    }
}

#[derive(Default)]
struct ChainState {
    addresses: u64,
    height: u64,
    fundings: HashMap<ChannelId, TxRef>,
    spent: HashMap<TxRef, SpendKind>,
    broadcasts: Vec<String>,
    unavailable: bool,
}

/// Chain backend that confirms everything instantly.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `sync` reports `funding` as spent by `kind`.
    pub fn mark_spent(&self, funding: &TxRef, kind: SpendKind) {
        self.state.lock().spent.insert(funding.clone(), kind);
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    pub fn funding(&self, channel_id: ChannelId) -> Option<TxRef> {
        self.state.lock().fundings.get(&channel_id).cloned()
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.state.lock().broadcasts.clone()
    }

    fn check(state: &ChainState) -> Result<(), ChainError> {
        if state.unavailable {
            Err(ChainError::Unavailable("mock chain switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Blockchain for MockChain {
    async fn new_address(&self) -> Result<String, ChainError> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        state.addresses += 1;
        Ok(format!("bcrt1qloopback{:04}", state.addresses))
    }

    async fn publish_funding(&self, channel_id: ChannelId, amount: Sats) -> Result<TxRef, ChainError> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        let funding = TxRef::new(digest(&("funding", channel_id, amount)), 0);
        state.fundings.insert(channel_id, funding.clone());
        Ok(funding)
    }

    async fn broadcast(&self, tx: &str) -> Result<String, ChainError> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        state.broadcasts.push(tx.to_string());
        Ok(digest(&("tx", tx)))
    }

    async fn sync(&self) -> Result<ChainSnapshot, ChainError> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        state.height += 1;
        Ok(ChainSnapshot { height: state.height, spent: state.spent.clone() })
    }
}

/// Fixed quotes, stamped with the wall clock when read.
#[derive(Default)]
pub struct StaticPriceFeed {
    quotes: RwLock<HashMap<ContractSymbol, (Price, Price, Decimal)>>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: ContractSymbol, bid: Price, ask: Price, funding_rate: Decimal) {
        self.quotes.write().insert(symbol, (bid, ask, funding_rate));
    }
}

#[async_trait]
impl PriceFeed for StaticPriceFeed {
    async fn latest(&self, symbol: ContractSymbol) -> Result<PriceSnapshot, PriceFeedError> {
        let (bid, ask, funding_rate) = self
            .quotes
            .read()
            .get(&symbol)
            .copied()
            .ok_or(PriceFeedError::NoPriceAvailable(symbol))?;
        Ok(PriceSnapshot { symbol, bid, ask, funding_rate, timestamp: Timestamp::now() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelReserves;
    use crate::types::ProtocolId;

    fn offer(channel_id: ChannelId) -> DlcMessage {
        DlcMessage::ChannelOffer {
            protocol_id: ProtocolId::new(),
            channel_id,
            reserves: ChannelReserves { trader: Sats::new(10_000), coordinator: Sats::new(10_000) },
            fee_rate_sats_vb: 2,
        }
    }

    #[tokio::test]
    async fn channel_offer_is_accepted_once() {
        let loopback = LoopbackTransport::default();
        let peer = PeerId::new("trader");
        let channel_id = ChannelId::new();
        let message = offer(channel_id);

        let first = loopback.request(&peer, message.clone()).await.unwrap();
        let again = loopback.request(&peer, message).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(loopback.channel(channel_id).unwrap().state, ChannelState::Accepted);
    }

    #[tokio::test]
    async fn scripted_faults_fire_the_given_number_of_times() {
        let loopback = LoopbackTransport::default();
        let peer = PeerId::new("trader");
        loopback.time_out(Step::ChannelOffer, 1);

        let message = offer(ChannelId::new());
        assert!(matches!(loopback.request(&peer, message.clone()).await, Err(TransportError::Timeout { .. })));
        assert!(matches!(loopback.request(&peer, message).await, Ok(DlcMessage::ChannelAccept { .. })));

        loopback.reject(Step::ChannelOffer, RejectKind::Declined, "no thanks");
        let reply = loopback.request(&peer, offer(ChannelId::new())).await.unwrap();
        assert!(matches!(reply, DlcMessage::Reject { reason, .. } if reason == "no thanks"));
    }

    #[tokio::test]
    async fn disconnected_peer_gets_no_reply() {
        let loopback = LoopbackTransport::default();
        let peer = PeerId::new("trader");
        loopback.set_connected(&peer, false);
        assert!(!loopback.is_connected(&peer));
        assert!(matches!(
            loopback.request(&peer, offer(ChannelId::new())).await,
            Err(TransportError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn mock_chain_reports_spends_and_outages() {
        let chain = MockChain::new();
        assert_eq!(chain.new_address().await.unwrap(), "bcrt1qloopback0001");

        let channel_id = ChannelId::new();
        let funding = chain.publish_funding(channel_id, Sats::new(50_000)).await.unwrap();
        assert_eq!(chain.funding(channel_id), Some(funding.clone()));

        chain.mark_spent(&funding, SpendKind::Counterparty);
        let snapshot = chain.sync().await.unwrap();
        assert_eq!(snapshot.spent.get(&funding), Some(&SpendKind::Counterparty));

        chain.set_available(false);
        assert!(matches!(chain.sync().await, Err(ChainError::Unavailable(_))));
    }
}
