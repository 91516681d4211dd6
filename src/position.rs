// 4.0: trader-visible position, derived from the channel's active contract.
// inverse contract pnl = quantity * (1/entry - 1/exit) btc, signed by direction.
// 4.4 has the settle split used by reduce / close / collaborative revert.

use crate::channel::Contract;
use crate::margin::pnl_sats;
use crate::types::{ChannelId, ContractSymbol, Direction, Leverage, PeerId, Price, Sats, Timestamp};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    Closing,
    Resizing,
    Rollover,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub trader: PeerId,
    pub channel_id: ChannelId,
    pub symbol: ContractSymbol,
    pub direction: Direction,
    pub quantity: Decimal,
    pub trader_leverage: Leverage,
    pub coordinator_leverage: Leverage,
    pub average_entry_price: Price,
    pub liquidation_price: Price,
    pub collateral: Sats,
    pub coordinator_margin: Sats,
    pub state: PositionState,
    pub created_at: Timestamp,
    pub expiry: Timestamp,
    pub updated_at: Timestamp,
}

impl Position {
    // 4.1: None for a zero quantity contract. there is no position to show.
    pub fn from_contract(
        trader: PeerId,
        channel_id: ChannelId,
        contract: &Contract,
        created_at: Timestamp,
        now: Timestamp,
    ) -> Option<Self> {
        if contract.quantity.is_zero() {
            return None;
        }
        Some(Self {
            trader,
            channel_id,
            symbol: contract.symbol,
            direction: contract.trader_direction,
            quantity: contract.quantity,
            trader_leverage: contract.trader_leverage,
            coordinator_leverage: contract.coordinator_leverage,
            average_entry_price: contract.average_entry_price,
            liquidation_price: contract.trader_liquidation_price,
            collateral: contract.trader_margin,
            coordinator_margin: contract.coordinator_margin,
            state: PositionState::Open,
            created_at,
            expiry: contract.expiry,
            updated_at: now,
        })
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry <= now
    }
}

// 4.2: entry price for a resize. inverse contracts average harmonically.
pub fn harmonic_average_entry(quantity: Decimal, entry: Price, added: Decimal, fill: Price) -> Price {
    let total = quantity.abs() + added.abs();
    let denominator = quantity.abs() / entry.value() + added.abs() / fill.value();
    if denominator.is_zero() {
        return fill;
    }
    Price::new(total / denominator).unwrap_or(fill)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleSplit {
    pub trader_payout: Sats,
    pub coordinator_payout: Sats,
    pub realized_pnl: Sats,
    pub remaining_trader_margin: Sats,
    pub remaining_coordinator_margin: Sats,
}

fn pro_rata(amount: Sats, fraction: Decimal) -> Sats {
    let scaled = (Decimal::from(amount.value()) * fraction)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    Sats::new(scaled.to_i64().unwrap_or(amount.value()))
}

// 4.4: settle `quantity` of the contract at `price`. margin for the closed part
// is released pro rata, pnl moves between the two halves, clamped so neither
// side pays more than what is locked.
pub fn settle_split(contract: &Contract, quantity: Decimal, price: Price) -> SettleSplit {
    let closing = quantity.abs().min(contract.quantity);
    let (remaining_trader_margin, remaining_coordinator_margin) = if closing >= contract.quantity {
        (Sats::ZERO, Sats::ZERO)
    } else {
        let remaining_fraction = (contract.quantity - closing) / contract.quantity;
        (
            pro_rata(contract.trader_margin, remaining_fraction),
            pro_rata(contract.coordinator_margin, remaining_fraction),
        )
    };

    let trader_part = contract.trader_margin.sub(remaining_trader_margin);
    let coordinator_part = contract.coordinator_margin.sub(remaining_coordinator_margin);
    let released = trader_part.add(coordinator_part);

    let pnl = pnl_sats(contract.trader_direction, closing, contract.average_entry_price, price);
    let trader_payout = trader_part.add(pnl).max(Sats::ZERO).min(released);
    let coordinator_payout = released.sub(trader_payout);

    SettleSplit {
        trader_payout,
        coordinator_payout,
        realized_pnl: trader_payout.sub(trader_part),
        remaining_trader_margin,
        remaining_coordinator_margin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContractId;
    use rust_decimal_macros::dec;

    fn contract(direction: Direction) -> Contract {
        Contract {
            contract_id: ContractId::new(),
            symbol: ContractSymbol::BtcUsd,
            trader_direction: direction,
            quantity: dec!(1000),
            average_entry_price: Price::new_unchecked(dec!(20000)),
            trader_leverage: Leverage::new(dec!(2)).unwrap(),
            coordinator_leverage: Leverage::new(dec!(2)).unwrap(),
            trader_margin: Sats::new(2_500_000),
            coordinator_margin: Sats::new(2_500_000),
            trader_liquidation_price: Price::new_unchecked(dec!(13334)),
            coordinator_liquidation_price: Price::new_unchecked(dec!(40000)),
            expiry: Timestamp::from_millis(0),
        }
    }

    #[test]
    fn full_settle_at_entry_returns_margins() {
        let split = settle_split(&contract(Direction::Long), dec!(1000), Price::new_unchecked(dec!(20000)));
        assert_eq!(split.trader_payout.value(), 2_500_000);
        assert_eq!(split.coordinator_payout.value(), 2_500_000);
        assert_eq!(split.realized_pnl, Sats::ZERO);
        assert_eq!(split.remaining_trader_margin, Sats::ZERO);
    }

    #[test]
    fn long_profit_is_capped_at_coordinator_margin() {
        // 1000 * (1/20000 - 1/100000) = 0.04 btc, more than the 0.025 locked
        let split = settle_split(&contract(Direction::Long), dec!(1000), Price::new_unchecked(dec!(100000)));
        assert_eq!(split.trader_payout.value(), 5_000_000);
        assert_eq!(split.coordinator_payout, Sats::ZERO);
        assert_eq!(split.realized_pnl.value(), 2_500_000);
    }

    #[test]
    fn partial_settle_keeps_pro_rata_margin() {
        let split = settle_split(&contract(Direction::Short), dec!(400), Price::new_unchecked(dec!(20000)));
        assert_eq!(split.remaining_trader_margin.value(), 1_500_000);
        assert_eq!(split.remaining_coordinator_margin.value(), 1_500_000);
        assert_eq!(split.trader_payout.value(), 1_000_000);
        assert_eq!(
            split.trader_payout.add(split.coordinator_payout).value(),
            2_000_000
        );
    }

    #[test]
    fn harmonic_average_for_inverse_contracts() {
        let entry = harmonic_average_entry(
            dec!(100),
            Price::new_unchecked(dec!(20000)),
            dec!(100),
            Price::new_unchecked(dec!(40000)),
        );
        // 200 / (100/20000 + 100/40000) = 26666.66..
        assert!(entry.value() > dec!(26666) && entry.value() < dec!(26667));
    }

    #[test]
    fn zero_quantity_contract_has_no_position() {
        let mut c = contract(Direction::Long);
        c.quantity = Decimal::ZERO;
        let now = Timestamp::from_millis(5);
        assert!(Position::from_contract(PeerId::new("t"), ChannelId::new(), &c, now, now).is_none());
    }
}
