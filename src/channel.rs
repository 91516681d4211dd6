// 2.0 channel.rs: one bilateral channel and its contract extension.
// the channel state covers funding and closing. the subchannel state covers the
// contract renegotiations (renew / settle) while the channel is signed.
//
// 2.1 every renegotiation is offer -> accept -> confirm -> finalize between two peers.
// only the slot holder may start one. at most one in flight per channel.

use crate::message::digest;
use crate::types::{
    ChannelId, ContractId, ContractSymbol, Direction, Leverage, OrderId, PeerId, Price, ProtocolId, Sats,
    Timestamp, TxRef,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Offered,
    Accepted,
    Signed,
    Closing,
    Closed,
    CounterClosed,
    ClosedPunished,
    CollaborativelyClosed,
    FailedAccept,
    FailedSign,
    Cancelled,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelState::Closed
                | ChannelState::CounterClosed
                | ChannelState::ClosedPunished
                | ChannelState::CollaborativelyClosed
                | ChannelState::FailedAccept
                | ChannelState::FailedSign
                | ChannelState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: ChannelState) -> bool {
        use ChannelState::*;
        match self {
            Offered => matches!(next, Accepted | FailedAccept | Cancelled),
            Accepted => matches!(next, Signed | FailedSign | Cancelled),
            Signed => matches!(next, Closing | CollaborativelyClosed | CounterClosed | ClosedPunished),
            Closing => matches!(next, Closed | CounterClosed | ClosedPunished),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubchannelState {
    Established,
    SettledOffered,
    SettledReceived,
    SettledAccepted,
    SettledConfirmed,
    Settled,
    RenewOffered,
    RenewAccepted,
    RenewConfirmed,
    RenewFinalized,
    Closing,
    CollaborativeCloseOffered,
}

impl SubchannelState {
    /// Established and Settled are the only states a negotiation may start from
    /// or roll back to.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SubchannelState::Established | SubchannelState::Settled)
    }

    pub fn can_transition_to(&self, next: SubchannelState) -> bool {
        use SubchannelState::*;
        if next == Closing {
            return *self != Closing;
        }
        match self {
            Established => matches!(next, SettledOffered | SettledReceived | RenewOffered | CollaborativeCloseOffered),
            Settled => matches!(next, RenewOffered | CollaborativeCloseOffered),
            SettledOffered | SettledReceived => matches!(next, SettledAccepted | Established),
            SettledAccepted => matches!(next, SettledConfirmed | Established),
            SettledConfirmed => matches!(next, Settled | Established),
            RenewOffered => matches!(next, RenewAccepted | Established | Settled),
            RenewAccepted => matches!(next, RenewConfirmed | Established | Settled),
            RenewConfirmed => matches!(next, RenewFinalized | Established | Settled),
            RenewFinalized => next == Established,
            CollaborativeCloseOffered => matches!(next, Established | Settled),
            Closing => false,
        }
    }
}

// 2.2: the contract living inside the channel. direction is the trader's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: ContractId,
    pub symbol: ContractSymbol,
    pub trader_direction: Direction,
    pub quantity: Decimal,
    pub average_entry_price: Price,
    pub trader_leverage: Leverage,
    pub coordinator_leverage: Leverage,
    pub trader_margin: Sats,
    pub coordinator_margin: Sats,
    pub trader_liquidation_price: Price,
    pub coordinator_liquidation_price: Price,
    pub expiry: Timestamp,
}

impl Contract {
    pub fn total_margin(&self) -> Sats {
        self.trader_margin.add(self.coordinator_margin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenewPurpose {
    Open,
    Resize,
    Rollover,
}

/// New contract replacing the current one (or none). Deltas move sats from
/// the reserves into the contract; the fee moves from trader to coordinator
/// reserve and may be negative when the coordinator pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewTerms {
    pub purpose: RenewPurpose,
    pub contract: Contract,
    pub trader_margin_delta: Sats,
    pub coordinator_margin_delta: Sats,
    pub trader_fee: Sats,
    pub order_id: Option<OrderId>,
}

/// Closes `settled_quantity` of the contract at `price`. Payouts go back to the
/// reserves and `remaining` (if any) keeps the rest of the margin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleTerms {
    pub price: Price,
    pub settled_quantity: Decimal,
    pub trader_payout: Sats,
    pub coordinator_payout: Sats,
    pub trader_fee: Sats,
    pub realized_pnl: Sats,
    pub remaining: Option<Contract>,
    pub order_id: Option<OrderId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposedTerms {
    Renew(RenewTerms),
    Settle(SettleTerms),
}

impl ProposedTerms {
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            ProposedTerms::Renew(t) => t.order_id,
            ProposedTerms::Settle(t) => t.order_id,
        }
    }

    pub fn is_settle(&self) -> bool {
        matches!(self, ProposedTerms::Settle(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Offerer,
    Receiver,
}

// 2.3: in-flight renegotiation. survives restarts with the channel record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiation {
    pub protocol_id: ProtocolId,
    pub role: Role,
    pub terms: ProposedTerms,
    pub last_confirmed: SubchannelState,
    pub attempts: u32,
    /// Sends the counterparty never answered.
    #[serde(default)]
    pub timeouts: u32,
    pub started_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotPurpose {
    ChannelOpen,
    Trade,
    Rollover,
    CollaborativeRevert,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotClaim {
    pub owner: ProtocolId,
    pub purpose: SlotPurpose,
    pub claimed_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {channel_id} has a negotiation in progress (owner {owner})")]
    NegotiationInProgress { channel_id: ChannelId, owner: ProtocolId },

    #[error("slot on channel {channel_id} is not held by {owner}")]
    SlotNotHeld { channel_id: ChannelId, owner: ProtocolId },

    #[error("invalid channel transition {from:?} -> {to:?}")]
    InvalidTransition { from: ChannelState, to: ChannelState },

    #[error("invalid subchannel transition {from:?} -> {to:?}")]
    InvalidSubchannelTransition { from: Option<SubchannelState>, to: SubchannelState },

    #[error("channel {0} is not signed")]
    NotSigned(ChannelId),

    #[error("no negotiation {protocol_id} on channel {channel_id}")]
    UnknownNegotiation { channel_id: ChannelId, protocol_id: ProtocolId },

    #[error("insufficient capacity on channel {channel_id}: need {needed}, have {available}")]
    InsufficientCapacity { channel_id: ChannelId, needed: Sats, available: Sats },

    #[error("no active contract on channel {0}")]
    NoContract(ChannelId),

    #[error("channel {0} already has an active contract")]
    ContractExists(ChannelId),

    #[error("settlement on channel {0} does not conserve margin")]
    Unbalanced(ChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReserves {
    pub trader: Sats,
    pub coordinator: Sats,
}

/** 2.4: channel record. persisted as a whole on every transition */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub counterparty: PeerId,
    pub funding: Option<TxRef>,
    pub fee_rate_sats_vb: u64,
    pub state: ChannelState,
    pub subchannel: Option<SubchannelState>,
    pub contract: Option<Contract>,
    pub buffer_tx: Option<String>,
    pub punish_tx: Option<String>,
    pub close_tx: Option<String>,
    pub settle_tx: Option<String>,
    pub trader_reserve: Sats,
    pub coordinator_reserve: Sats,
    pub slot: Option<SlotClaim>,
    pub negotiation: Option<Negotiation>,
    /// Last renegotiation this channel finalized. Lets a resumed task see its phase landed.
    pub last_finalized: Option<ProtocolId>,
    pub manual_recovery: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Channel {
    pub fn offered(
        channel_id: ChannelId,
        counterparty: PeerId,
        reserves: ChannelReserves,
        fee_rate_sats_vb: u64,
        now: Timestamp,
    ) -> Self {
        Self {
            channel_id,
            counterparty,
            funding: None,
            fee_rate_sats_vb,
            state: ChannelState::Offered,
            subchannel: None,
            contract: None,
            buffer_tx: None,
            punish_tx: None,
            close_tx: None,
            settle_tx: None,
            trader_reserve: reserves.trader,
            coordinator_reserve: reserves.coordinator,
            slot: None,
            negotiation: None,
            last_finalized: None,
            manual_recovery: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Total sats locked in the funding output.
    pub fn value(&self) -> Sats {
        let margins = self.contract.as_ref().map(Contract::total_margin).unwrap_or(Sats::ZERO);
        self.trader_reserve.add(self.coordinator_reserve).add(margins)
    }

    pub fn is_signed(&self) -> bool {
        self.state == ChannelState::Signed
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    // 2.4.1: channel level transitions
    pub fn transition(&mut self, next: ChannelState, now: Timestamp) -> Result<(), ChannelError> {
        if !self.state.can_transition_to(next) {
            return Err(ChannelError::InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.slot = None;
            self.negotiation = None;
        }
        Ok(())
    }

    pub fn on_channel_accepted(&mut self, now: Timestamp) -> Result<(), ChannelError> {
        self.transition(ChannelState::Accepted, now)
    }

    pub fn on_channel_signed(&mut self, funding: TxRef, now: Timestamp) -> Result<(), ChannelError> {
        self.transition(ChannelState::Signed, now)?;
        self.buffer_tx = Some(digest(&("buffer", &funding)));
        self.funding = Some(funding);
        self.subchannel = Some(SubchannelState::Settled);
        Ok(())
    }

    pub fn fail_accept(&mut self, now: Timestamp) -> Result<(), ChannelError> {
        self.transition(ChannelState::FailedAccept, now)
    }

    pub fn fail_sign(&mut self, now: Timestamp) -> Result<(), ChannelError> {
        self.transition(ChannelState::FailedSign, now)
    }

    pub fn cancel(&mut self, now: Timestamp) -> Result<(), ChannelError> {
        self.transition(ChannelState::Cancelled, now)
    }

    fn set_subchannel(&mut self, next: SubchannelState, now: Timestamp) -> Result<(), ChannelError> {
        match self.subchannel {
            Some(current) if current.can_transition_to(next) => {
                self.subchannel = Some(next);
                self.updated_at = now;
                Ok(())
            }
            from => Err(ChannelError::InvalidSubchannelTransition { from, to: next }),
        }
    }

    // 2.4.2: slot. sync check-and-set, the caller holds the store lock.
    pub fn claim_slot(&mut self, owner: ProtocolId, purpose: SlotPurpose, now: Timestamp) -> Result<(), ChannelError> {
        match self.slot {
            Some(claim) if claim.owner == owner => Ok(()),
            Some(claim) => Err(ChannelError::NegotiationInProgress {
                channel_id: self.channel_id,
                owner: claim.owner,
            }),
            None => {
                self.slot = Some(SlotClaim { owner, purpose, claimed_at: now });
                self.updated_at = now;
                Ok(())
            }
        }
    }

    pub fn release_slot(&mut self, owner: ProtocolId, now: Timestamp) -> Result<(), ChannelError> {
        match self.slot {
            Some(claim) if claim.owner == owner => {
                self.slot = None;
                self.updated_at = now;
                Ok(())
            }
            _ => Err(ChannelError::SlotNotHeld { channel_id: self.channel_id, owner }),
        }
    }

    /// Passes a held slot to a new owner without a gap another claimer could use.
    pub fn handover_slot(
        &mut self,
        from: ProtocolId,
        to: ProtocolId,
        purpose: SlotPurpose,
        now: Timestamp,
    ) -> Result<(), ChannelError> {
        match self.slot {
            Some(claim) if claim.owner == from => {
                self.slot = Some(SlotClaim { owner: to, purpose, claimed_at: now });
                self.updated_at = now;
                Ok(())
            }
            _ => Err(ChannelError::SlotNotHeld { channel_id: self.channel_id, owner: from }),
        }
    }

    pub fn slot_owner(&self) -> Option<ProtocolId> {
        self.slot.map(|claim| claim.owner)
    }

    fn require_signed(&self) -> Result<(), ChannelError> {
        if self.is_signed() {
            Ok(())
        } else {
            Err(ChannelError::NotSigned(self.channel_id))
        }
    }

    // 2.4.3: reserves after the terms are applied must stay non-negative
    pub fn check_terms(&self, terms: &ProposedTerms) -> Result<(), ChannelError> {
        match terms {
            ProposedTerms::Renew(renew) => {
                if renew.purpose == RenewPurpose::Open && self.contract.is_some() {
                    return Err(ChannelError::ContractExists(self.channel_id));
                }
                if renew.purpose != RenewPurpose::Open && self.contract.is_none() {
                    return Err(ChannelError::NoContract(self.channel_id));
                }
                let trader_needed = renew.trader_margin_delta.add(renew.trader_fee);
                if trader_needed > self.trader_reserve {
                    return Err(ChannelError::InsufficientCapacity {
                        channel_id: self.channel_id,
                        needed: trader_needed,
                        available: self.trader_reserve,
                    });
                }
                let coordinator_needed = renew.coordinator_margin_delta.sub(renew.trader_fee);
                if coordinator_needed > self.coordinator_reserve {
                    return Err(ChannelError::InsufficientCapacity {
                        channel_id: self.channel_id,
                        needed: coordinator_needed,
                        available: self.coordinator_reserve,
                    });
                }
                Ok(())
            }
            ProposedTerms::Settle(settle) => {
                let contract = self.contract.as_ref().ok_or(ChannelError::NoContract(self.channel_id))?;
                let remaining = settle.remaining.as_ref().map(Contract::total_margin).unwrap_or(Sats::ZERO);
                let out = settle.trader_payout.add(settle.coordinator_payout).add(remaining);
                if out != contract.total_margin() {
                    return Err(ChannelError::Unbalanced(self.channel_id));
                }
                let trader_after = self.trader_reserve.add(settle.trader_payout);
                if settle.trader_fee > trader_after {
                    return Err(ChannelError::InsufficientCapacity {
                        channel_id: self.channel_id,
                        needed: settle.trader_fee,
                        available: trader_after,
                    });
                }
                Ok(())
            }
        }
    }

    // 2.5: offerer side. slot must already be held by `owner`.
    pub fn begin_negotiation(
        &mut self,
        owner: ProtocolId,
        protocol_id: ProtocolId,
        terms: ProposedTerms,
        now: Timestamp,
    ) -> Result<(), ChannelError> {
        self.require_signed()?;
        if self.slot_owner() != Some(owner) {
            return Err(ChannelError::SlotNotHeld { channel_id: self.channel_id, owner });
        }
        self.start(protocol_id, Role::Offerer, terms, now)
    }

    // 2.5.1: receiver side. the offer claims the slot for its own protocol id.
    pub fn on_offer_received(
        &mut self,
        protocol_id: ProtocolId,
        terms: ProposedTerms,
        now: Timestamp,
    ) -> Result<(), ChannelError> {
        self.require_signed()?;
        let purpose = match &terms {
            ProposedTerms::Renew(r) if r.purpose == RenewPurpose::Rollover => SlotPurpose::Rollover,
            _ => SlotPurpose::Trade,
        };
        self.claim_slot(protocol_id, purpose, now)?;
        if let Err(e) = self.start(protocol_id, Role::Receiver, terms, now) {
            self.slot = None;
            return Err(e);
        }
        Ok(())
    }

    fn start(&mut self, protocol_id: ProtocolId, role: Role, terms: ProposedTerms, now: Timestamp) -> Result<(), ChannelError> {
        if let Some(existing) = &self.negotiation {
            return Err(ChannelError::NegotiationInProgress {
                channel_id: self.channel_id,
                owner: existing.protocol_id,
            });
        }
        let current = self.subchannel.ok_or(ChannelError::NotSigned(self.channel_id))?;
        if !current.is_confirmed() {
            return Err(ChannelError::InvalidSubchannelTransition {
                from: Some(current),
                to: SubchannelState::RenewOffered,
            });
        }
        self.check_terms(&terms)?;

        let next = match (&terms, role) {
            (ProposedTerms::Renew(_), _) => SubchannelState::RenewOffered,
            (ProposedTerms::Settle(_), Role::Offerer) => SubchannelState::SettledOffered,
            (ProposedTerms::Settle(_), Role::Receiver) => SubchannelState::SettledReceived,
        };
        self.set_subchannel(next, now)?;
        self.negotiation = Some(Negotiation {
            protocol_id,
            role,
            terms,
            last_confirmed: current,
            attempts: 0,
            timeouts: 0,
            started_at: now,
        });
        Ok(())
    }

    fn negotiation_for(&self, protocol_id: ProtocolId) -> Result<&Negotiation, ChannelError> {
        self.negotiation
            .as_ref()
            .filter(|n| n.protocol_id == protocol_id)
            .ok_or(ChannelError::UnknownNegotiation { channel_id: self.channel_id, protocol_id })
    }

    pub fn active_negotiation(&self, protocol_id: ProtocolId) -> Option<&Negotiation> {
        self.negotiation_for(protocol_id).ok()
    }

    pub fn note_attempt(&mut self, protocol_id: ProtocolId) -> Result<u32, ChannelError> {
        let channel_id = self.channel_id;
        let negotiation = self
            .negotiation
            .as_mut()
            .filter(|n| n.protocol_id == protocol_id)
            .ok_or(ChannelError::UnknownNegotiation { channel_id, protocol_id })?;
        negotiation.attempts += 1;
        Ok(negotiation.attempts)
    }

    pub fn note_timeout(&mut self, protocol_id: ProtocolId) -> Result<u32, ChannelError> {
        let channel_id = self.channel_id;
        let negotiation = self
            .negotiation
            .as_mut()
            .filter(|n| n.protocol_id == protocol_id)
            .ok_or(ChannelError::UnknownNegotiation { channel_id, protocol_id })?;
        negotiation.timeouts += 1;
        Ok(negotiation.timeouts)
    }

    // 2.5.2: offer accepted (offerer received it / receiver sent it)
    pub fn on_accept(&mut self, protocol_id: ProtocolId, now: Timestamp) -> Result<(), ChannelError> {
        let settle = self.negotiation_for(protocol_id)?.terms.is_settle();
        let next = if settle { SubchannelState::SettledAccepted } else { SubchannelState::RenewAccepted };
        self.set_subchannel(next, now)
    }

    pub fn on_confirm(&mut self, protocol_id: ProtocolId, now: Timestamp) -> Result<(), ChannelError> {
        let settle = self.negotiation_for(protocol_id)?.terms.is_settle();
        let next = if settle { SubchannelState::SettledConfirmed } else { SubchannelState::RenewConfirmed };
        self.set_subchannel(next, now)
    }

    // 2.5.3: reserves and contract after the terms. no state checks, used for previews too.
    pub fn apply_terms(&mut self, terms: &ProposedTerms) {
        match terms {
            ProposedTerms::Renew(renew) => {
                self.trader_reserve = self.trader_reserve.sub(renew.trader_margin_delta).sub(renew.trader_fee);
                self.coordinator_reserve = self
                    .coordinator_reserve
                    .sub(renew.coordinator_margin_delta)
                    .add(renew.trader_fee);
                self.contract = Some(renew.contract.clone());
            }
            ProposedTerms::Settle(settle) => {
                self.trader_reserve = self.trader_reserve.add(settle.trader_payout).sub(settle.trader_fee);
                self.coordinator_reserve = self
                    .coordinator_reserve
                    .add(settle.coordinator_payout)
                    .add(settle.trader_fee);
                self.contract = settle.remaining.clone();
            }
        }
    }

    /// Checks every phase against the reserves left by the phases before it.
    pub fn preview(&self, phases: &[ProposedTerms]) -> Result<Channel, ChannelError> {
        let mut preview = self.clone();
        for terms in phases {
            preview.check_terms(terms)?;
            preview.apply_terms(terms);
        }
        Ok(preview)
    }

    // 2.5.4: partial settle lands on Established, full settle on Settled.
    pub fn finalize(&mut self, protocol_id: ProtocolId, now: Timestamp) -> Result<Negotiation, ChannelError> {
        let negotiation = self.negotiation_for(protocol_id)?.clone();
        match &negotiation.terms {
            ProposedTerms::Renew(_) => {
                self.set_subchannel(SubchannelState::RenewFinalized, now)?;
                self.apply_terms(&negotiation.terms);
                self.set_subchannel(SubchannelState::Established, now)?;
            }
            ProposedTerms::Settle(settle) => {
                let next = if settle.remaining.is_some() {
                    SubchannelState::Established
                } else {
                    SubchannelState::Settled
                };
                self.set_subchannel(next, now)?;
                self.apply_terms(&negotiation.terms);
                self.settle_tx = Some(digest(&(protocol_id, settle)));
            }
        }
        self.negotiation = None;
        self.last_finalized = Some(protocol_id);
        if negotiation.role == Role::Receiver && self.slot_owner() == Some(protocol_id) {
            self.slot = None;
        }
        Ok(negotiation)
    }

    /// Back to the last confirmed state. The slot stays with its owner.
    pub fn rollback_negotiation(&mut self, protocol_id: ProtocolId, now: Timestamp) -> Result<Negotiation, ChannelError> {
        let negotiation = self.negotiation_for(protocol_id)?.clone();
        self.set_subchannel(negotiation.last_confirmed, now)?;
        self.negotiation = None;
        if negotiation.role == Role::Receiver && self.slot_owner() == Some(protocol_id) {
            self.slot = None;
        }
        Ok(negotiation)
    }

    // 2.6: exits
    pub fn offer_collaborative_close(&mut self, owner: ProtocolId, now: Timestamp) -> Result<(), ChannelError> {
        self.require_signed()?;
        if self.slot_owner() != Some(owner) {
            return Err(ChannelError::SlotNotHeld { channel_id: self.channel_id, owner });
        }
        if let Some(existing) = &self.negotiation {
            return Err(ChannelError::NegotiationInProgress {
                channel_id: self.channel_id,
                owner: existing.protocol_id,
            });
        }
        if self.subchannel == Some(SubchannelState::CollaborativeCloseOffered) {
            return Ok(());
        }
        self.set_subchannel(SubchannelState::CollaborativeCloseOffered, now)
    }

    pub fn withdraw_collaborative_close(&mut self, now: Timestamp) -> Result<(), ChannelError> {
        let back = if self.contract.is_some() { SubchannelState::Established } else { SubchannelState::Settled };
        self.set_subchannel(back, now)
    }

    pub fn record_collaborative_close(&mut self, close_txid: String, now: Timestamp) -> Result<(), ChannelError> {
        self.transition(ChannelState::CollaborativelyClosed, now)?;
        self.close_tx = Some(close_txid);
        self.contract = None;
        Ok(())
    }

    pub fn force_close(&mut self, now: Timestamp) -> Result<(), ChannelError> {
        self.transition(ChannelState::Closing, now)?;
        if self.subchannel.is_some() && self.subchannel != Some(SubchannelState::Closing) {
            self.set_subchannel(SubchannelState::Closing, now)?;
        }
        self.negotiation = None;
        self.slot = None;
        Ok(())
    }

    pub fn mark_closed(&mut self, final_state: ChannelState, now: Timestamp) -> Result<(), ChannelError> {
        if !final_state.is_terminal() {
            return Err(ChannelError::InvalidTransition { from: self.state, to: final_state });
        }
        self.transition(final_state, now)?;
        self.contract = None;
        if final_state == ChannelState::ClosedPunished {
            self.punish_tx = self.buffer_tx.as_ref().map(|buffer| digest(&("punish", buffer)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn contract(quantity: Decimal, margin: i64) -> Contract {
        Contract {
            contract_id: ContractId::new(),
            symbol: ContractSymbol::BtcUsd,
            trader_direction: Direction::Long,
            quantity,
            average_entry_price: Price::new_unchecked(dec!(30000)),
            trader_leverage: Leverage::new(dec!(2)).unwrap(),
            coordinator_leverage: Leverage::new(dec!(2)).unwrap(),
            trader_margin: Sats::new(margin),
            coordinator_margin: Sats::new(margin),
            trader_liquidation_price: Price::new_unchecked(dec!(20000)),
            coordinator_liquidation_price: Price::new_unchecked(dec!(60000)),
            expiry: Timestamp::from_millis(0),
        }
    }

    fn signed_channel() -> Channel {
        let now = Timestamp::from_millis(1);
        let mut channel = Channel::offered(
            ChannelId::new(),
            PeerId::new("trader"),
            ChannelReserves { trader: Sats::new(1_000_000), coordinator: Sats::new(1_000_000) },
            2,
            now,
        );
        channel.on_channel_accepted(now).unwrap();
        channel.on_channel_signed(TxRef::new("aa", 0), now).unwrap();
        channel
    }

    fn open_terms(margin: i64) -> ProposedTerms {
        ProposedTerms::Renew(RenewTerms {
            purpose: RenewPurpose::Open,
            contract: contract(dec!(100), margin),
            trader_margin_delta: Sats::new(margin),
            coordinator_margin_delta: Sats::new(margin),
            trader_fee: Sats::new(100),
            order_id: None,
        })
    }

    fn run_to_finalize(channel: &mut Channel, protocol_id: ProtocolId) {
        let now = Timestamp::from_millis(2);
        channel.on_accept(protocol_id, now).unwrap();
        channel.on_confirm(protocol_id, now).unwrap();
        channel.finalize(protocol_id, now).unwrap();
    }

    #[test]
    fn terminal_states_are_final() {
        let mut channel = signed_channel();
        let now = Timestamp::from_millis(3);
        channel.force_close(now).unwrap();
        channel.mark_closed(ChannelState::Closed, now).unwrap();
        assert!(channel.state.is_terminal());
        assert!(channel.transition(ChannelState::Closing, now).is_err());
        assert!(channel.mark_closed(ChannelState::CounterClosed, now).is_err());
    }

    #[test]
    fn offered_can_fail_or_cancel_only() {
        let now = Timestamp::from_millis(1);
        let mut channel = Channel::offered(
            ChannelId::new(),
            PeerId::new("t"),
            ChannelReserves { trader: Sats::ZERO, coordinator: Sats::ZERO },
            1,
            now,
        );
        assert!(channel.transition(ChannelState::Signed, now).is_err());
        channel.fail_accept(now).unwrap();
        assert_eq!(channel.state, ChannelState::FailedAccept);
    }

    #[test]
    fn second_claim_is_negotiation_in_progress() {
        let mut channel = signed_channel();
        let now = Timestamp::from_millis(2);
        let first = ProtocolId::new();
        channel.claim_slot(first, SlotPurpose::Trade, now).unwrap();
        let err = channel.claim_slot(ProtocolId::new(), SlotPurpose::Trade, now).unwrap_err();
        assert!(matches!(err, ChannelError::NegotiationInProgress { owner, .. } if owner == first));
        // same owner reclaims fine
        channel.claim_slot(first, SlotPurpose::Trade, now).unwrap();
    }

    #[test]
    fn renew_then_full_settle() {
        let mut channel = signed_channel();
        let now = Timestamp::from_millis(2);
        let owner = ProtocolId::new();
        channel.claim_slot(owner, SlotPurpose::Trade, now).unwrap();

        let renew = ProtocolId::new();
        channel.begin_negotiation(owner, renew, open_terms(100_000), now).unwrap();
        assert_eq!(channel.subchannel, Some(SubchannelState::RenewOffered));
        run_to_finalize(&mut channel, renew);
        assert_eq!(channel.subchannel, Some(SubchannelState::Established));
        assert_eq!(channel.trader_reserve.value(), 1_000_000 - 100_000 - 100);
        let value = channel.value();

        let settle = ProtocolId::new();
        let terms = ProposedTerms::Settle(SettleTerms {
            price: Price::new_unchecked(dec!(30000)),
            settled_quantity: dec!(100),
            trader_payout: Sats::new(100_000),
            coordinator_payout: Sats::new(100_000),
            trader_fee: Sats::new(100),
            realized_pnl: Sats::ZERO,
            remaining: None,
            order_id: None,
        });
        channel.begin_negotiation(owner, settle, terms, now).unwrap();
        run_to_finalize(&mut channel, settle);
        assert_eq!(channel.subchannel, Some(SubchannelState::Settled));
        assert!(channel.contract.is_none());
        assert_eq!(channel.value(), value);
    }

    #[test]
    fn rollback_returns_to_last_confirmed() {
        let mut channel = signed_channel();
        let now = Timestamp::from_millis(2);
        let owner = ProtocolId::new();
        channel.claim_slot(owner, SlotPurpose::Trade, now).unwrap();
        let renew = ProtocolId::new();
        channel.begin_negotiation(owner, renew, open_terms(100_000), now).unwrap();
        channel.on_accept(renew, now).unwrap();
        channel.rollback_negotiation(renew, now).unwrap();
        assert_eq!(channel.subchannel, Some(SubchannelState::Settled));
        assert!(channel.negotiation.is_none());
        assert_eq!(channel.slot_owner(), Some(owner));
    }

    #[test]
    fn renew_beyond_reserve_is_rejected_before_any_state_change() {
        let mut channel = signed_channel();
        let now = Timestamp::from_millis(2);
        let owner = ProtocolId::new();
        channel.claim_slot(owner, SlotPurpose::Trade, now).unwrap();
        let err = channel
            .begin_negotiation(owner, ProtocolId::new(), open_terms(5_000_000), now)
            .unwrap_err();
        assert!(matches!(err, ChannelError::InsufficientCapacity { .. }));
        assert_eq!(channel.subchannel, Some(SubchannelState::Settled));
    }

    #[test]
    fn receiver_releases_its_slot_on_finalize() {
        let mut channel = signed_channel();
        let protocol_id = ProtocolId::new();
        channel
            .on_offer_received(protocol_id, open_terms(100_000), Timestamp::from_millis(2))
            .unwrap();
        run_to_finalize(&mut channel, protocol_id);
        assert!(channel.slot.is_none());
    }

    #[test]
    fn subchannel_table_rejects_skips() {
        assert!(!SubchannelState::RenewOffered.can_transition_to(SubchannelState::RenewConfirmed));
        assert!(!SubchannelState::Settled.can_transition_to(SubchannelState::SettledOffered));
        assert!(SubchannelState::SettledConfirmed.can_transition_to(SubchannelState::Established));
        assert!(SubchannelState::RenewFinalized.can_transition_to(SubchannelState::Established));
    }
}
