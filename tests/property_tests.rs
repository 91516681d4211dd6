//! Property-based tests for the channel math.
//!
//! These tests verify invariants hold under random inputs.

use chrono::{Datelike, TimeZone, Timelike, Utc, Weekday};
use dlc_perps_core::collab_revert::{propose_split, COLLAB_REVERT_TX_WEIGHT};
use dlc_perps_core::funding::funding_fee;
use dlc_perps_core::margin::{liquidation_price, margin_sats, order_matching_fee, order_matching_fee_with_rebate};
use dlc_perps_core::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1_000i64..100_000i64).prop_map(Decimal::from) // $1,000 to $100,000
}

fn quantity_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..50_000i64).prop_map(Decimal::from) // 1 to 50,000 contracts
}

fn leverage_strategy() -> impl Strategy<Value = Decimal> {
    (1u32..=10u32).prop_map(Decimal::from) // 1x to 10x
}

fn mmr_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..=50i64).prop_map(|x| Decimal::new(x, 3)) // 0% to 5%
}

fn contract(direction: Direction, quantity: Decimal, entry: Decimal, leverage: Decimal) -> Contract {
    let entry = Price::new_unchecked(entry);
    let leverage = Leverage::new(leverage).unwrap();
    Contract {
        contract_id: ContractId::new(),
        symbol: ContractSymbol::BtcUsd,
        trader_direction: direction,
        quantity,
        average_entry_price: entry,
        trader_leverage: leverage,
        coordinator_leverage: leverage,
        trader_margin: margin_sats(quantity, entry, leverage),
        coordinator_margin: margin_sats(quantity, entry, leverage),
        trader_liquidation_price: liquidation_price(entry, leverage, direction, dec!(0.05)),
        coordinator_liquidation_price: liquidation_price(entry, leverage, direction.opposite(), dec!(0.05)),
        expiry: Timestamp::from_millis(0),
    }
}

proptest! {
    /// Long liquidation sits below entry, short above.
    #[test]
    fn liquidation_on_the_losing_side(
        entry in price_strategy(),
        leverage in leverage_strategy(),
        mmr in mmr_strategy(),
    ) {
        let price = Price::new_unchecked(entry);
        let lev = Leverage::new(leverage).unwrap();
        let long = liquidation_price(price, lev, Direction::Long, mmr);
        let short = liquidation_price(price, lev, Direction::Short, mmr);
        prop_assert!(long < price, "long liquidation {} not below {}", long, price);
        prop_assert!(short > price, "short liquidation {} not above {}", short, price);
    }

    /// More leverage moves the long liquidation price closer to entry.
    #[test]
    fn higher_leverage_tighter_liquidation(
        entry in price_strategy(),
        low in 1u32..10u32,
        mmr in mmr_strategy(),
    ) {
        let price = Price::new_unchecked(entry);
        let low_lev = Leverage::new(Decimal::from(low)).unwrap();
        let high_lev = Leverage::new(Decimal::from(low + 1)).unwrap();
        let loose = liquidation_price(price, low_lev, Direction::Long, mmr);
        let tight = liquidation_price(price, high_lev, Direction::Long, mmr);
        prop_assert!(tight > loose);
    }

    /// Margin never grows with leverage.
    #[test]
    fn margin_shrinks_with_leverage(
        quantity in quantity_strategy(),
        entry in price_strategy(),
        low in 1u32..10u32,
    ) {
        let price = Price::new_unchecked(entry);
        let loose = margin_sats(quantity, price, Leverage::new(Decimal::from(low)).unwrap());
        let tight = margin_sats(quantity, price, Leverage::new(Decimal::from(low + 1)).unwrap());
        prop_assert!(tight <= loose);
        prop_assert!(tight.value() >= 0);
    }

    /// A rebate only ever lowers the fee, and never below zero.
    #[test]
    fn rebate_bounded(
        quantity in quantity_strategy(),
        entry in price_strategy(),
        rebate in (0i64..=100i64).prop_map(|x| Decimal::new(x, 2)),
    ) {
        let price = Price::new_unchecked(entry);
        let full = order_matching_fee(quantity, price, dec!(0.003));
        let reduced = order_matching_fee_with_rebate(quantity, price, dec!(0.003), rebate);
        prop_assert!(reduced <= full);
        prop_assert!(reduced.value() >= 0);
    }

    /// Whatever leaves the contract on a settle equals what was locked in it.
    #[test]
    fn settle_conserves_margin(
        quantity in quantity_strategy(),
        entry in price_strategy(),
        exit in price_strategy(),
        leverage in leverage_strategy(),
        settle_pct in 1u32..=100u32,
        long in any::<bool>(),
    ) {
        let direction = if long { Direction::Long } else { Direction::Short };
        let c = contract(direction, quantity, entry, leverage);
        let settled = (quantity * Decimal::from(settle_pct) / dec!(100)).round_dp(0).max(Decimal::ONE);
        let split = settle_split(&c, settled, Price::new_unchecked(exit));

        let out = split
            .trader_payout
            .add(split.coordinator_payout)
            .add(split.remaining_trader_margin)
            .add(split.remaining_coordinator_margin);
        prop_assert_eq!(out, c.total_margin());
        prop_assert!(split.trader_payout.value() >= 0);
        prop_assert!(split.coordinator_payout.value() >= 0);
    }

    /// Closing everything at entry hands the trader back exactly their margin.
    #[test]
    fn settle_at_entry_is_flat(
        quantity in quantity_strategy(),
        entry in price_strategy(),
        leverage in leverage_strategy(),
    ) {
        let c = contract(Direction::Long, quantity, entry, leverage);
        let split = settle_split(&c, quantity, c.average_entry_price);
        prop_assert_eq!(split.trader_payout, c.trader_margin);
        prop_assert_eq!(split.realized_pnl, Sats::ZERO);
    }

    /// Funding is a transfer: the long side pays what the short side receives.
    #[test]
    fn funding_zero_sum(
        quantity in quantity_strategy(),
        entry in price_strategy(),
        rate in (-100i64..=100i64).prop_map(|x| Decimal::new(x, 5)),
    ) {
        let price = Price::new_unchecked(entry);
        let long = funding_fee(Direction::Long, quantity, price, rate);
        let short = funding_fee(Direction::Short, quantity, price, rate);
        prop_assert_eq!(long.amount.add(short.amount), Sats::ZERO);
    }

    /// A revert split plus its fee adds up to the funding output.
    #[test]
    fn revert_split_adds_up(
        quantity in quantity_strategy(),
        entry in price_strategy(),
        revert_price in price_strategy(),
        leverage in leverage_strategy(),
        reserve in 0i64..2_000_000i64,
        fee_rate in 1u64..50u64,
    ) {
        let mut channel = Channel::offered(
            ChannelId::new(),
            PeerId::new("trader"),
            ChannelReserves { trader: Sats::new(reserve), coordinator: Sats::new(reserve) },
            fee_rate,
            Timestamp::from_millis(0),
        );
        channel.funding = Some(TxRef::new("funding", 0));
        channel.contract = Some(contract(Direction::Short, quantity, entry, leverage));

        if let Ok(proposal) = propose_split(
            &channel,
            Price::new_unchecked(revert_price),
            COLLAB_REVERT_TX_WEIGHT,
            fee_rate,
            "bcrt1qpayout".to_string(),
        ) {
            let total = proposal.trader_amount.add(proposal.coordinator_amount).add(proposal.fee);
            prop_assert_eq!(total, channel.value());
            prop_assert!(proposal.trader_amount.value() >= 0);
            prop_assert!(proposal.coordinator_amount.value() >= 0);
        }
    }

    /// Mainnet contracts always expire on a later sunday at 15:00 utc.
    #[test]
    fn mainnet_expiry_is_a_later_sunday(secs in 1_600_000_000i64..1_900_000_000i64) {
        let calendar = RolloverCalendar::new(Network::Mainnet, 2);
        let at = Utc.timestamp_opt(secs, 0).unwrap();
        let expiry = calendar.next_expiry(at);
        prop_assert!(expiry > at);
        prop_assert_eq!(expiry.weekday(), Weekday::Sun);
        prop_assert_eq!(expiry.hour(), 15);
        prop_assert!(expiry - at <= chrono::Duration::days(14));
    }
}

#[test]
fn rollover_window_only_on_the_weekend() {
    let calendar = RolloverCalendar::new(Network::Mainnet, 2);
    // 2024-06-12 is a wednesday, 2024-06-15 a saturday
    let wednesday = Utc.with_ymd_and_hms(2024, 6, 12, 12, 0, 0).unwrap();
    let saturday = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
    assert!(!calendar.is_eligible(wednesday));
    assert!(calendar.is_eligible(saturday));

    let expiring = Timestamp::from_datetime(Utc.with_ymd_and_hms(2024, 6, 16, 15, 0, 0).unwrap());
    assert!(calendar.should_roll(expiring, Timestamp::from_datetime(saturday)));
    assert!(!calendar.should_roll(expiring, Timestamp::from_datetime(wednesday)));
}

#[test]
fn regtest_expiry_is_next_midnight_outside_the_window() {
    let calendar = RolloverCalendar::new(Network::Regtest, 2);
    let morning = Utc.with_ymd_and_hms(2024, 6, 12, 9, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2024, 6, 12, 23, 0, 0).unwrap();
    assert_eq!(calendar.next_expiry(morning), Utc.with_ymd_and_hms(2024, 6, 13, 0, 0, 0).unwrap());
    assert_eq!(calendar.next_expiry(late), Utc.with_ymd_and_hms(2024, 6, 14, 0, 0, 0).unwrap());
}
