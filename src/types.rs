// 1.0: all the primitives live here. nothing in the engine works without these types.
// ids, prices, quantities, leverage, sats, timestamps. each is a newtype so the compiler catches mixups.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::iter::Sum;
use uuid::Uuid;

pub const SATS_PER_BTC: Decimal = dec!(100_000_000);

// price used for a short at 1x. liquidation goes towards infinity there.
pub const BTCUSD_MAX_PRICE: Decimal = dec!(21_000_000);

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }
    };
}

uuid_id!(ChannelId);
uuid_id!(ContractId);
uuid_id!(ProtocolId);
uuid_id!(OrderId);
uuid_id!(TaskId);

impl ProtocolId {
    /// Deterministic child id for one phase of a multi-phase protocol. The same
    /// owner and phase always give the same id, so a resumed task finds its work.
    pub fn for_phase(&self, phase: u32) -> ProtocolId {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update(phase.to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        ProtocolId(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

/// Node id of the other side of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContractSymbol {
    BtcUsd,
}

impl fmt::Display for ContractSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractSymbol::BtcUsd => write!(f, "BTCUSD"),
        }
    }
}

// Long = profit when price goes up. Short = profit when price goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => dec!(1),
            Direction::Short => dec!(-1),
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

// 1.1: signed quantity in usd contracts: positive = long, negative = short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedQuantity(Decimal);

impl SignedQuantity {
    pub fn new(quantity: Decimal) -> Self {
        Self(quantity)
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn from_direction(direction: Direction, abs_quantity: Decimal) -> Self {
        Self(direction.sign() * abs_quantity.abs())
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn abs(&self) -> Decimal {
        self.0.abs()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn direction(&self) -> Option<Direction> {
        if self.0 > Decimal::ZERO {
            Some(Direction::Long)
        } else if self.0 < Decimal::ZERO {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

impl fmt::Display for SignedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.2: usd per btc. must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    #[must_use]
    pub fn new(value: Decimal) -> Option<Self> {
        if value > Decimal::ZERO {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn new_unchecked(value: Decimal) -> Self {
        debug_assert!(value > Decimal::ZERO);
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.3: satoshi amounts. margins, reserves, fees and pnl all use this. signed so pnl fits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sats(i64);

impl Sats {
    pub const ZERO: Sats = Sats(0);

    pub fn new(sats: i64) -> Self {
        Self(sats)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    // rounds to 8 dp (whole sats) midpoint away from zero
    pub fn from_btc(btc: Decimal) -> Self {
        let sats = (btc * SATS_PER_BTC)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        let sats = sats.to_i64().unwrap_or(if sats.is_sign_negative() {
            i64::MIN
        } else {
            i64::MAX
        });
        Self(sats)
    }

    pub fn to_btc(&self) -> Decimal {
        Decimal::from(self.0) / SATS_PER_BTC
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn add(&self, other: Sats) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn sub(&self, other: Sats) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    pub fn negate(&self) -> Self {
        Self(-self.0)
    }

    pub fn max(self, other: Sats) -> Self {
        Self(self.0.max(other.0))
    }

    pub fn min(self, other: Sats) -> Self {
        Self(self.0.min(other.0))
    }
}

impl fmt::Display for Sats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

impl Sum for Sats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Sats::ZERO, |acc, s| acc.add(s))
    }
}

impl<'a> Sum<&'a Sats> for Sats {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Sats::ZERO, |acc, s| acc.add(*s))
    }
}

// 1.4: leverage multiplier. must be >= 1x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Leverage(Decimal);

impl Leverage {
    #[must_use]
    pub fn new(value: Decimal) -> Option<Self> {
        if value >= Decimal::ONE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn one() -> Self {
        Self(Decimal::ONE)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    // 10x leverage → 10% margin fraction (1/10)
    pub fn initial_margin_fraction(&self) -> Decimal {
        Decimal::ONE / self.0
    }
}

impl fmt::Display for Leverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0)
    }
}

// 1.5: millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn from_datetime(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.0)
    }

    pub fn plus_millis(&self, ms: i64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Wall clock with a manual override for simulations and tests.
#[derive(Debug, Default)]
pub struct Clock {
    manual: parking_lot::Mutex<Option<Timestamp>>,
}

impl Clock {
    pub fn now(&self) -> Timestamp {
        self.manual.lock().unwrap_or_else(Timestamp::now)
    }

    pub fn set(&self, timestamp: Timestamp) {
        *self.manual.lock() = Some(timestamp);
    }

    pub fn advance(&self, millis: i64) {
        let mut manual = self.manual.lock();
        let current = manual.unwrap_or_else(Timestamp::now);
        *manual = Some(current.plus_millis(millis));
    }
}

/// On-chain output reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxRef {
    pub txid: String,
    pub vout: u32,
}

impl TxRef {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signed_quantity_operations() {
        let long = SignedQuantity::from_direction(Direction::Long, dec!(100));
        assert_eq!(long.direction(), Some(Direction::Long));
        assert_eq!(long.abs(), dec!(100));

        let short = SignedQuantity::from_direction(Direction::Short, dec!(100));
        assert_eq!(short.direction(), Some(Direction::Short));
        assert_eq!(short.value(), dec!(-100));
        assert_eq!(SignedQuantity::zero().direction(), None);
    }

    #[test]
    fn leverage_margin_fraction() {
        let lev_2x = Leverage::new(dec!(2)).unwrap();
        assert_eq!(lev_2x.initial_margin_fraction(), dec!(0.5));
        assert!(Leverage::new(dec!(0.5)).is_none());
    }

    #[test]
    fn sats_btc_conversion_rounds_half_away() {
        assert_eq!(Sats::from_btc(dec!(0.001)).value(), 100_000);
        assert_eq!(Sats::from_btc(dec!(0.000000005)).value(), 1);
        assert_eq!(Sats::from_btc(dec!(-0.000000005)).value(), -1);
        assert_eq!(Sats::new(250_000).to_btc(), dec!(0.0025));
    }

    #[test]
    fn timestamp_roundtrips_through_chrono() {
        let ts = Timestamp::from_millis(1_691_938_800_000);
        let dt = ts.to_datetime().unwrap();
        assert_eq!(Timestamp::from_datetime(dt), ts);
    }
}
