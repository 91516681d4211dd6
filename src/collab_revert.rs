// 13.0 collab_revert.rs: fallback settlement when renew/settle cannot finish.
// both peers sign one split transaction spending the funding output. the trader
// gets reserve + margin + pnl at the agreed price, the coordinator the rest.
// the on-chain fee is split evenly between them.

use crate::channel::Channel;
use crate::position::settle_split;
use crate::types::{ChannelId, PeerId, Price, Sats, Timestamp};
use serde::{Deserialize, Serialize};

// weight of the split tx. one input, two outputs.
pub const COLLAB_REVERT_TX_WEIGHT: u64 = 672;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevertError {
    #[error("fee {fee} exceeds channel value {value}")]
    FeeExceedsValue { fee: Sats, value: Sats },

    #[error("channel {0} has no funding output")]
    Unfunded(ChannelId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertProposal {
    pub price: Price,
    pub fee_rate_sats_vb: u64,
    pub fee: Sats,
    pub trader_amount: Sats,
    pub coordinator_amount: Sats,
    pub payout_address: String,
}

/** 13.1: the persisted record. writing it is the commit point of the protocol */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborativeRevert {
    pub channel_id: ChannelId,
    pub counterparty: PeerId,
    pub price: Price,
    pub payout_address: String,
    pub coordinator_amount: Sats,
    pub trader_amount: Sats,
    pub fee: Sats,
    pub split_txid: String,
    pub timestamp: Timestamp,
}

// fee rate is per vbyte; 4 weight units per vbyte, rounded up
pub fn revert_fee(tx_weight: u64, fee_rate_sats_vb: u64) -> Sats {
    let vbytes = tx_weight.div_ceil(4);
    let fee = vbytes.saturating_mul(fee_rate_sats_vb);
    Sats::new(i64::try_from(fee).unwrap_or(i64::MAX))
}

// 13.2: split at `price`. amounts always add up to value - fee.
pub fn propose_split(
    channel: &Channel,
    price: Price,
    tx_weight: u64,
    fee_rate_sats_vb: u64,
    payout_address: String,
) -> Result<RevertProposal, RevertError> {
    if channel.funding.is_none() {
        return Err(RevertError::Unfunded(channel.channel_id));
    }

    let value = channel.value();
    let fee = revert_fee(tx_weight, fee_rate_sats_vb);
    if fee >= value {
        return Err(RevertError::FeeExceedsValue { fee, value });
    }

    let trader_settlement = match &channel.contract {
        Some(contract) => settle_split(contract, contract.quantity, price).trader_payout,
        None => Sats::ZERO,
    };
    let trader_share = channel.trader_reserve.add(trader_settlement);

    let half_fee = Sats::new(fee.value() / 2);
    let spendable = value.sub(fee);
    let trader_amount = trader_share.sub(half_fee).max(Sats::ZERO).min(spendable);
    let coordinator_amount = spendable.sub(trader_amount);

    Ok(RevertProposal {
        price,
        fee_rate_sats_vb,
        fee,
        trader_amount,
        coordinator_amount,
        payout_address,
    })
}

// 13.3: counterparty side check. recomputes the split and compares within 1 sat.
pub fn verify_proposal(channel: &Channel, proposal: &RevertProposal, tx_weight: u64) -> bool {
    let expected = match propose_split(
        channel,
        proposal.price,
        tx_weight,
        proposal.fee_rate_sats_vb,
        proposal.payout_address.clone(),
    ) {
        Ok(expected) => expected,
        Err(_) => return false,
    };

    let total = proposal.trader_amount.add(proposal.coordinator_amount).add(proposal.fee);
    let diff = (total.value() - channel.value().value()).abs();
    let trader_diff = (expected.trader_amount.value() - proposal.trader_amount.value()).abs();

    diff <= 1 && trader_diff <= 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelReserves, Contract};
    use crate::types::{ContractId, ContractSymbol, Direction, Leverage, TxRef};
    use rust_decimal_macros::dec;

    fn channel_with_contract() -> Channel {
        let now = Timestamp::from_millis(1);
        let mut channel = Channel::offered(
            ChannelId::new(),
            PeerId::new("trader"),
            ChannelReserves { trader: Sats::new(300_000), coordinator: Sats::new(500_000) },
            4,
            now,
        );
        channel.on_channel_accepted(now).unwrap();
        channel.on_channel_signed(TxRef::new("ff", 1), now).unwrap();
        channel.contract = Some(Contract {
            contract_id: ContractId::new(),
            symbol: ContractSymbol::BtcUsd,
            trader_direction: Direction::Long,
            quantity: dec!(100),
            average_entry_price: Price::new_unchecked(dec!(30000)),
            trader_leverage: Leverage::new(dec!(2)).unwrap(),
            coordinator_leverage: Leverage::new(dec!(2)).unwrap(),
            trader_margin: Sats::new(166_667),
            coordinator_margin: Sats::new(166_667),
            trader_liquidation_price: Price::new_unchecked(dec!(20000)),
            coordinator_liquidation_price: Price::new_unchecked(dec!(60000)),
            expiry: now,
        });
        channel
    }

    #[test]
    fn fee_from_weight_and_rate() {
        assert_eq!(revert_fee(COLLAB_REVERT_TX_WEIGHT, 4).value(), 672);
        assert_eq!(revert_fee(673, 1).value(), 169);
    }

    #[test]
    fn split_adds_up_to_value_minus_fee() {
        let channel = channel_with_contract();
        for price in [dec!(15000), dec!(29000), dec!(30000), dec!(31000), dec!(90000)] {
            let proposal = propose_split(
                &channel,
                Price::new_unchecked(price),
                COLLAB_REVERT_TX_WEIGHT,
                3,
                "bcrt1q".to_string(),
            )
            .unwrap();
            let sum = proposal.trader_amount.add(proposal.coordinator_amount);
            let expected = channel.value().sub(proposal.fee);
            assert!((sum.value() - expected.value()).abs() <= 1);
            assert!(verify_proposal(&channel, &proposal, COLLAB_REVERT_TX_WEIGHT));
        }
    }

    #[test]
    fn at_entry_trader_gets_reserve_plus_margin_minus_half_fee() {
        let channel = channel_with_contract();
        let proposal = propose_split(
            &channel,
            Price::new_unchecked(dec!(30000)),
            COLLAB_REVERT_TX_WEIGHT,
            2,
            "addr".to_string(),
        )
        .unwrap();
        assert_eq!(proposal.fee.value(), 336);
        assert_eq!(proposal.trader_amount.value(), 300_000 + 166_667 - 168);
    }

    #[test]
    fn tampered_proposal_fails_verification() {
        let channel = channel_with_contract();
        let mut proposal = propose_split(
            &channel,
            Price::new_unchecked(dec!(30000)),
            COLLAB_REVERT_TX_WEIGHT,
            2,
            "addr".to_string(),
        )
        .unwrap();
        proposal.trader_amount = proposal.trader_amount.sub(Sats::new(1_000));
        proposal.coordinator_amount = proposal.coordinator_amount.add(Sats::new(1_000));
        assert!(!verify_proposal(&channel, &proposal, COLLAB_REVERT_TX_WEIGHT));
    }
}
