//! Margin, liquidation and fee math for inverse btc contracts.
//!
//! Quantity is counted in usd contracts, collateral in sats. Margin for one
//! side is `quantity / (price * leverage)` btc. The counterparty margin uses
//! the coordinator counter-leverage looked up from the leverage table.
//!
//! Liquidation moves away from the entry price as leverage goes down. Shorts
//! at 1x never liquidate, so their liquidation price is pinned to the btc cap.

use crate::types::{Direction, Leverage, Price, Sats, BTCUSD_MAX_PRICE};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarginParams {
    pub max_leverage: Leverage,
    pub maintenance_margin_rate: Decimal,
}

impl Default for MarginParams {
    fn default() -> Self {
        Self {
            max_leverage: Leverage::new(dec!(5)).unwrap_or_else(Leverage::one),
            maintenance_margin_rate: dec!(0.1),
        }
    }
}

/// One row of the `coordinator_leverages` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorLeverage {
    pub trader_leverage: u32,
    pub coordinator_leverage: Decimal,
}

/// One referral tier. volume in usd contracts traded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralTier {
    pub min_volume: Decimal,
    pub fee_rebate: Decimal,
}

fn round_btc(btc: Decimal) -> Decimal {
    btc.round_dp_with_strategy(8, RoundingStrategy::MidpointAwayFromZero)
}

// 3.1: margin in sats for `quantity` contracts at `price` with `leverage`
pub fn margin_sats(quantity: Decimal, price: Price, leverage: Leverage) -> Sats {
    let btc = quantity.abs() / (price.value() * leverage.value());
    Sats::from_btc(round_btc(btc))
}

// 3.2: liquidation price for the given side. mmr = maintenance margin rate.
pub fn liquidation_price(
    price: Price,
    leverage: Leverage,
    direction: Direction,
    maintenance_margin_rate: Decimal,
) -> Price {
    let l = leverage.value();
    let mmr = maintenance_margin_rate;

    let denominator = match direction {
        Direction::Long => l + Decimal::ONE - mmr * l,
        Direction::Short => l - Decimal::ONE + mmr * l,
    };

    if denominator <= Decimal::ZERO {
        return Price::new_unchecked(BTCUSD_MAX_PRICE);
    }

    let liquidation = (price.value() * l / denominator).min(BTCUSD_MAX_PRICE);
    Price::new(liquidation).unwrap_or_else(|| Price::new_unchecked(BTCUSD_MAX_PRICE))
}

// 3.3: matching fee. notional in btc (quantity / price) times the fee rate,
// rounded to whole sats before the referral rebate is taken off.
pub fn order_matching_fee(quantity: Decimal, price: Price, fee_rate: Decimal) -> Sats {
    let fee_btc = round_btc(quantity.abs() / price.value() * fee_rate);
    Sats::from_btc(fee_btc)
}

pub fn order_matching_fee_with_rebate(
    quantity: Decimal,
    price: Price,
    fee_rate: Decimal,
    rebate: Decimal,
) -> Sats {
    let fee = order_matching_fee(quantity, price, fee_rate);
    if rebate <= Decimal::ZERO {
        return fee;
    }
    let rebate = Sats::from_btc(round_btc(fee.to_btc() * rebate.min(Decimal::ONE)));
    fee.sub(rebate).max(Sats::ZERO)
}

// 3.4: highest tier the trader's volume reaches
pub fn referral_rebate(tiers: &[ReferralTier], volume: Decimal) -> Decimal {
    tiers
        .iter()
        .filter(|tier| volume >= tier.min_volume)
        .map(|tier| tier.fee_rebate)
        .max()
        .unwrap_or(Decimal::ZERO)
}

// 3.5: the table only holds whole leverages, so the trader leverage is rounded first.
// no match falls back to the largest coordinator leverage in the table.
pub fn coordinator_leverage_for(table: &[CoordinatorLeverage], trader_leverage: Leverage) -> Leverage {
    let rounded = trader_leverage
        .value()
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u32();

    let found = rounded.and_then(|rounded| {
        table
            .iter()
            .find(|row| row.trader_leverage == rounded)
            .map(|row| row.coordinator_leverage)
    });

    let leverage = found.or_else(|| table.iter().map(|row| row.coordinator_leverage).max());

    leverage.and_then(Leverage::new).unwrap_or_else(Leverage::one)
}

// pnl in sats for a position of `quantity` opened at `entry` and closed at `exit`
pub fn pnl_sats(direction: Direction, quantity: Decimal, entry: Price, exit: Price) -> Sats {
    let btc = direction.sign() * quantity.abs() * (Decimal::ONE / entry.value() - Decimal::ONE / exit.value());
    Sats::from_btc(round_btc(btc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn lev(v: Decimal) -> Leverage {
        Leverage::new(v).unwrap()
    }

    #[test]
    fn margin_for_100_contracts_at_2x() {
        let price = Price::new_unchecked(dec!(30000));
        // 100 / (30000 * 2) = 0.00166667 btc
        assert_eq!(margin_sats(dec!(100), price, lev(dec!(2))).value(), 166_667);
    }

    #[test]
    fn long_liquidation_below_entry() {
        let price = Price::new_unchecked(dec!(30000));
        let liq = liquidation_price(price, lev(dec!(2)), Direction::Long, dec!(0));
        assert_eq!(liq.value(), dec!(20000));

        let liq = liquidation_price(price, lev(dec!(2)), Direction::Long, dec!(0.1));
        assert!(liq.value() < dec!(30000));
        assert!(liq.value() > dec!(20000));
    }

    #[test]
    fn short_at_1x_never_liquidates() {
        let price = Price::new_unchecked(dec!(30000));
        let liq = liquidation_price(price, Leverage::one(), Direction::Short, dec!(0));
        assert_eq!(liq.value(), BTCUSD_MAX_PRICE);
    }

    #[test]
    fn short_liquidation_above_entry() {
        let price = Price::new_unchecked(dec!(30000));
        let liq = liquidation_price(price, lev(dec!(2)), Direction::Short, dec!(0));
        assert_eq!(liq.value(), dec!(60000));
    }

    #[test]
    fn matching_fee_rounds_to_sats() {
        let price = Price::new_unchecked(dec!(30209));
        assert_eq!(order_matching_fee(dec!(50), price, dec!(0.003)).value(), 497);
    }

    #[test]
    fn rebate_reduces_fee() {
        let price = Price::new_unchecked(dec!(30000));
        let full = order_matching_fee(dec!(3000), price, dec!(0.003));
        let rebated = order_matching_fee_with_rebate(dec!(3000), price, dec!(0.003), dec!(0.2));
        assert_eq!(full.value(), 30_000);
        assert_eq!(rebated.value(), 24_000);
    }

    #[test]
    fn referral_tier_picks_highest_reached() {
        let tiers = vec![
            ReferralTier { min_volume: dec!(1000), fee_rebate: dec!(0.1) },
            ReferralTier { min_volume: dec!(10000), fee_rebate: dec!(0.2) },
        ];
        assert_eq!(referral_rebate(&tiers, dec!(500)), Decimal::ZERO);
        assert_eq!(referral_rebate(&tiers, dec!(5000)), dec!(0.1));
        assert_eq!(referral_rebate(&tiers, dec!(20000)), dec!(0.2));
    }

    #[test]
    fn coordinator_leverage_rounds_and_falls_back() {
        let table = vec![
            CoordinatorLeverage { trader_leverage: 1, coordinator_leverage: dec!(1) },
            CoordinatorLeverage { trader_leverage: 2, coordinator_leverage: dec!(2) },
            CoordinatorLeverage { trader_leverage: 5, coordinator_leverage: dec!(3) },
        ];
        assert_eq!(coordinator_leverage_for(&table, lev(dec!(1.6))).value(), dec!(2));
        assert_eq!(coordinator_leverage_for(&table, lev(dec!(4))).value(), dec!(3));
        assert_eq!(coordinator_leverage_for(&[], lev(dec!(4))).value(), dec!(1));
    }

    #[test]
    fn long_pnl_positive_when_price_rises() {
        let entry = Price::new_unchecked(dec!(20000));
        let exit = Price::new_unchecked(dec!(40000));
        // 1000 * (1/20000 - 1/40000) = 0.025 btc
        assert_eq!(pnl_sats(Direction::Long, dec!(1000), entry, exit).value(), 2_500_000);
        assert_eq!(pnl_sats(Direction::Short, dec!(1000), entry, exit).value(), -2_500_000);
    }
}
