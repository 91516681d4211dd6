// 6.0: funding fee charged when a contract is rolled over.
// fee = quantity / price * rate btc. positive rate: longs pay shorts.

use crate::types::{Direction, Price, Sats};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Signed from the trader's side: positive = trader pays the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingFee {
    pub amount: Sats,
    pub rate: Decimal,
}

impl FundingFee {
    pub fn zero() -> Self {
        Self { amount: Sats::ZERO, rate: Decimal::ZERO }
    }

    pub fn trader_pays(&self) -> bool {
        self.amount.value() > 0
    }
}

// 6.1: fee for the trader holding `direction`
pub fn funding_fee(direction: Direction, quantity: Decimal, price: Price, rate: Decimal) -> FundingFee {
    let btc = (quantity.abs() / price.value() * rate.abs())
        .round_dp_with_strategy(8, RoundingStrategy::MidpointAwayFromZero);
    let magnitude = Sats::from_btc(btc);

    let longs_pay = rate > Decimal::ZERO;
    let trader_pays = match direction {
        Direction::Long => longs_pay,
        Direction::Short => !longs_pay,
    };

    let amount = if rate.is_zero() {
        Sats::ZERO
    } else if trader_pays {
        magnitude
    } else {
        magnitude.negate()
    };

    FundingFee { amount, rate }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn long_pays_on_positive_rate() {
        let price = Price::new_unchecked(dec!(40000));
        let fee = funding_fee(Direction::Long, dec!(4000), price, dec!(0.001));
        // 4000 / 40000 * 0.001 = 0.0001 btc
        assert_eq!(fee.amount.value(), 10_000);
        assert!(fee.trader_pays());
    }

    #[test]
    fn short_receives_on_positive_rate() {
        let price = Price::new_unchecked(dec!(40000));
        let fee = funding_fee(Direction::Short, dec!(4000), price, dec!(0.001));
        assert_eq!(fee.amount.value(), -10_000);
    }

    #[test]
    fn short_pays_on_negative_rate() {
        let price = Price::new_unchecked(dec!(40000));
        let fee = funding_fee(Direction::Short, dec!(4000), price, dec!(-0.001));
        assert_eq!(fee.amount.value(), 10_000);
    }

    #[test]
    fn zero_rate_is_free() {
        let price = Price::new_unchecked(dec!(40000));
        assert_eq!(funding_fee(Direction::Long, dec!(4000), price, Decimal::ZERO), FundingFee::zero());
    }
}
