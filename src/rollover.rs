// 6.5 rollover.rs: expiry calendar and rollover terms.
// mainnet contracts expire sunday 15:00 utc and may roll from friday 15:00.
// test networks expire daily at midnight with a short window before it.
// a rollover keeps quantity, direction and entry; margins and liquidation
// prices are recomputed at the current price and the funding fee is settled.

use crate::channel::{Contract, RenewPurpose, RenewTerms};
use crate::config::Network;
use crate::funding::{funding_fee, FundingFee};
use crate::margin::{liquidation_price, margin_sats};
use crate::types::{ChannelId, ContractId, Leverage, PeerId, Price, ProtocolId, Sats, Timestamp};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn expiry_time() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Rollover calendar for one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverCalendar {
    pub network: Network,
    pub test_window_hours: i64,
}

impl RolloverCalendar {
    pub fn new(network: Network, test_window_hours: i64) -> Self {
        Self { network, test_window_hours }
    }

    // 6.5.1: is `at` inside the window before the expiry that follows it
    pub fn is_eligible(&self, at: DateTime<Utc>) -> bool {
        match self.network {
            Network::Mainnet => match at.weekday() {
                Weekday::Fri => at.time() >= expiry_time(),
                Weekday::Sat => true,
                Weekday::Sun => at.time() < expiry_time(),
                _ => false,
            },
            _ => {
                let midnight = next_midnight(at);
                midnight - at < Duration::hours(self.test_window_hours)
            }
        }
    }

    // 6.5.2: expiry for a contract opened or rolled at `at`. inside the window
    // the contract skips to the expiry after the upcoming one.
    pub fn next_expiry(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self.network {
            Network::Mainnet => {
                let from_monday = i64::from(at.weekday().number_from_monday());
                let days = if self.is_eligible(at) || at.weekday() == Weekday::Sun {
                    7 - from_monday + 7
                } else {
                    7 - from_monday
                };
                let sunday = at.date_naive() + Duration::days(days);
                Utc.from_utc_datetime(&sunday.and_time(expiry_time()))
            }
            _ => {
                let midnight = next_midnight(at);
                if self.is_eligible(at) {
                    midnight + Duration::days(1)
                } else {
                    midnight
                }
            }
        }
    }

    /// True when a contract expiring at `expiry` should be rolled at `now`.
    pub fn should_roll(&self, expiry: Timestamp, now: Timestamp) -> bool {
        let (Some(expiry), Some(now)) = (expiry.to_datetime(), now.to_datetime()) else {
            return false;
        };
        now < expiry && self.is_eligible(now) && self.next_expiry(now) > expiry
    }
}

fn next_midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = at.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_time(NaiveTime::MIN))
}

/** 6.6: one record per rollover attempt. a later attempt supersedes, never edits */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverParams {
    pub protocol_id: ProtocolId,
    pub channel_id: ChannelId,
    pub counterparty: PeerId,
    pub trader_margin: Sats,
    pub coordinator_margin: Sats,
    pub trader_leverage: Leverage,
    pub coordinator_leverage: Leverage,
    pub trader_liquidation_price: Price,
    pub coordinator_liquidation_price: Price,
    pub funding_fee: FundingFee,
    pub price: Price,
    pub expiry: Timestamp,
    pub created_at: Timestamp,
}

/// Inputs that come from the market at rollover time.
#[derive(Debug, Clone, Copy)]
pub struct RolloverMarket {
    pub price: Price,
    pub funding_rate: Decimal,
    pub maintenance_margin_rate: Decimal,
    pub coordinator_leverage: Leverage,
}

// 6.7: renew terms for the rollover plus the params record to persist
pub fn rollover_terms(
    protocol_id: ProtocolId,
    channel_id: ChannelId,
    counterparty: PeerId,
    contract: &Contract,
    market: &RolloverMarket,
    expiry: Timestamp,
    now: Timestamp,
) -> (RenewTerms, RolloverParams) {
    let price = market.price;
    let mmr = market.maintenance_margin_rate;
    let direction = contract.trader_direction;

    let trader_margin = margin_sats(contract.quantity, price, contract.trader_leverage);
    let coordinator_margin = margin_sats(contract.quantity, price, market.coordinator_leverage);
    let trader_liquidation_price = liquidation_price(price, contract.trader_leverage, direction, mmr);
    let coordinator_liquidation_price =
        liquidation_price(price, market.coordinator_leverage, direction.opposite(), mmr);
    let fee = funding_fee(direction, contract.quantity, price, market.funding_rate);

    let rolled = Contract {
        contract_id: ContractId::new(),
        coordinator_leverage: market.coordinator_leverage,
        trader_margin,
        coordinator_margin,
        trader_liquidation_price,
        coordinator_liquidation_price,
        expiry,
        ..contract.clone()
    };

    let terms = RenewTerms {
        purpose: RenewPurpose::Rollover,
        trader_margin_delta: trader_margin.sub(contract.trader_margin),
        coordinator_margin_delta: coordinator_margin.sub(contract.coordinator_margin),
        trader_fee: fee.amount,
        contract: rolled,
        order_id: None,
    };

    let params = RolloverParams {
        protocol_id,
        channel_id,
        counterparty,
        trader_margin,
        coordinator_margin,
        trader_leverage: contract.trader_leverage,
        coordinator_leverage: market.coordinator_leverage,
        trader_liquidation_price,
        coordinator_liquidation_price,
        funding_fee: fee,
        price,
        expiry,
        created_at: now,
    };

    (terms, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContractSymbol, Direction};
    use rust_decimal_macros::dec;

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    fn mainnet() -> RolloverCalendar {
        RolloverCalendar::new(Network::Mainnet, 8)
    }

    #[test]
    fn wednesday_is_not_eligible() {
        // Wed Aug 09 2023 09:30:23 UTC
        assert!(!mainnet().is_eligible(at(1_691_573_423)));
    }

    #[test]
    fn window_opens_friday_15_00() {
        // Fri Aug 11 2023 15:00:00 UTC
        assert!(mainnet().is_eligible(at(1_691_766_000)));
        // one second earlier
        assert!(!mainnet().is_eligible(at(1_691_765_999)));
    }

    #[test]
    fn window_closes_sunday_15_00() {
        // Sun Aug 13 2023 14:59:59 UTC
        assert!(mainnet().is_eligible(at(1_691_938_799)));
        // Sun Aug 13 2023 15:00:00 UTC
        assert!(!mainnet().is_eligible(at(1_691_938_800)));
    }

    #[test]
    fn mainnet_expiry_is_next_sunday() {
        // Wed Aug 09 2023 -> Sun Aug 13 2023 15:00 UTC
        assert_eq!(mainnet().next_expiry(at(1_691_573_423)), at(1_691_938_800));
        // Sat Aug 12 2023 (in window) -> Sun Aug 20 2023 15:00 UTC
        assert_eq!(mainnet().next_expiry(at(1_691_841_600)), at(1_692_543_600));
    }

    #[test]
    fn daily_expiry_on_regtest() {
        let calendar = RolloverCalendar::new(Network::Regtest, 8);
        // Wed Aug 09 2023 09:30:23 -> Thu Aug 10 00:00
        assert_eq!(calendar.next_expiry(at(1_691_573_423)), at(1_691_625_600));
        // Wed Aug 09 2023 20:00:00 is inside the 8h window -> Fri Aug 11 00:00
        assert!(calendar.is_eligible(at(1_691_611_200)));
        assert_eq!(calendar.next_expiry(at(1_691_611_200)), at(1_691_712_000));
    }

    #[test]
    fn should_roll_only_inside_window_before_expiry() {
        let calendar = mainnet();
        let expiry = Timestamp::from_datetime(at(1_691_938_800));
        assert!(!calendar.should_roll(expiry, Timestamp::from_datetime(at(1_691_573_423))));
        assert!(calendar.should_roll(expiry, Timestamp::from_datetime(at(1_691_841_600))));
        // already past expiry
        assert!(!calendar.should_roll(expiry, Timestamp::from_datetime(at(1_691_938_801))));
    }

    #[test]
    fn rollover_keeps_quantity_and_entry() {
        let contract = Contract {
            contract_id: ContractId::new(),
            symbol: ContractSymbol::BtcUsd,
            trader_direction: Direction::Long,
            quantity: dec!(1000),
            average_entry_price: Price::new_unchecked(dec!(20000)),
            trader_leverage: Leverage::new(dec!(2)).unwrap(),
            coordinator_leverage: Leverage::new(dec!(2)).unwrap(),
            trader_margin: Sats::new(2_500_000),
            coordinator_margin: Sats::new(2_500_000),
            trader_liquidation_price: Price::new_unchecked(dec!(13334)),
            coordinator_liquidation_price: Price::new_unchecked(dec!(40000)),
            expiry: Timestamp::from_millis(0),
        };
        let market = RolloverMarket {
            price: Price::new_unchecked(dec!(25000)),
            funding_rate: dec!(0.001),
            maintenance_margin_rate: Decimal::ZERO,
            coordinator_leverage: Leverage::new(dec!(2)).unwrap(),
        };
        let (terms, params) = rollover_terms(
            ProtocolId::new(),
            ChannelId::new(),
            PeerId::new("t"),
            &contract,
            &market,
            Timestamp::from_millis(10),
            Timestamp::from_millis(5),
        );
        assert_eq!(terms.contract.quantity, dec!(1000));
        assert_eq!(terms.contract.average_entry_price, contract.average_entry_price);
        // 1000 / (25000 * 2) = 0.02 btc
        assert_eq!(terms.contract.trader_margin.value(), 2_000_000);
        assert_eq!(terms.trader_margin_delta.value(), -500_000);
        // 1000 / 25000 * 0.001 = 0.00004 btc paid by the long
        assert_eq!(terms.trader_fee.value(), 4_000);
        assert_eq!(params.expiry, Timestamp::from_millis(10));
    }
}
