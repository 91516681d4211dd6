// Price Feed Integration
//
// This module abstracts how the engine receives quotes. The core is agnostic to
// whether bid/ask comes from an exchange websocket, an index, or a test script.
// Sources push snapshots into the PriceCache; the engine reads the latest one and
// refuses to trade on a quote older than the configured staleness bound.

use crate::events::{EventHub, EventPayload, Service, ServiceStatus};
use crate::types::{ContractSymbol, Price, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A single quote for one contract symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub symbol: ContractSymbol,
    pub bid: Price,
    pub ask: Price,
    /// Funding rate applied at the next rollover. Positive: longs pay shorts.
    pub funding_rate: Decimal,
    pub timestamp: Timestamp,
}

impl PriceSnapshot {
    pub fn mid(&self) -> Price {
        Price::new_unchecked((self.bid.value() + self.ask.value()) / Decimal::TWO)
    }

    pub fn is_stale(&self, now: Timestamp, max_staleness_ms: i64) -> bool {
        now.as_millis() - self.timestamp.as_millis() > max_staleness_ms
    }
}

/// Errors that can occur when reading a quote
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceFeedError {
    #[error("no quote for {0}")]
    NoPriceAvailable(ContractSymbol),

    #[error("quote for {symbol} is {age_ms}ms old")]
    Stale { symbol: ContractSymbol, age_ms: i64 },

    #[error("crossed quote for {symbol}: bid {bid} above ask {ask}")]
    Crossed { symbol: ContractSymbol, bid: Price, ask: Price },
}

/// Upstream quote source. The engine polls it and feeds the cache.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn latest(&self, symbol: ContractSymbol) -> Result<PriceSnapshot, PriceFeedError>;
}

/// In-memory quote store. Every accepted snapshot is published as a
/// PriceUpdate event; staleness flips the price feed service health.
pub struct PriceCache {
    quotes: RwLock<HashMap<ContractSymbol, PriceSnapshot>>,
    hub: Arc<EventHub>,
    max_staleness_ms: i64,
}

impl PriceCache {
    pub fn new(hub: Arc<EventHub>, max_staleness_secs: u64) -> Self {
        let max_staleness_ms = i64::try_from(max_staleness_secs.saturating_mul(1_000)).unwrap_or(i64::MAX);
        Self {
            quotes: RwLock::new(HashMap::new()),
            hub,
            max_staleness_ms,
        }
    }

    /// Submit a quote. Crossed quotes are rejected and leave the previous one in place.
    pub fn submit(&self, snapshot: PriceSnapshot) -> Result<(), PriceFeedError> {
        if snapshot.bid > snapshot.ask {
            return Err(PriceFeedError::Crossed { symbol: snapshot.symbol, bid: snapshot.bid, ask: snapshot.ask });
        }
        self.quotes.write().insert(snapshot.symbol, snapshot);
        self.hub.publish(
            snapshot.timestamp,
            EventPayload::PriceUpdate {
                symbol: snapshot.symbol,
                bid: snapshot.bid,
                ask: snapshot.ask,
                funding_rate: snapshot.funding_rate,
            },
        );
        self.hub.report_health(snapshot.timestamp, Service::PriceFeed, ServiceStatus::Online, None);
        Ok(())
    }

    /// Latest quote that is fresh at `now`.
    pub fn get(&self, symbol: ContractSymbol, now: Timestamp) -> Result<PriceSnapshot, PriceFeedError> {
        let snapshot = self
            .quotes
            .read()
            .get(&symbol)
            .copied()
            .ok_or(PriceFeedError::NoPriceAvailable(symbol))?;

        if snapshot.is_stale(now, self.max_staleness_ms) {
            let age_ms = now.as_millis() - snapshot.timestamp.as_millis();
            self.hub.report_health(
                now,
                Service::PriceFeed,
                ServiceStatus::Degraded,
                Some(format!("{symbol} quote is {age_ms}ms old")),
            );
            return Err(PriceFeedError::Stale { symbol, age_ms });
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(bid: Decimal, ask: Decimal, at: i64) -> PriceSnapshot {
        PriceSnapshot {
            symbol: ContractSymbol::BtcUsd,
            bid: Price::new_unchecked(bid),
            ask: Price::new_unchecked(ask),
            funding_rate: dec!(0.0001),
            timestamp: Timestamp::from_millis(at),
        }
    }

    fn cache() -> (Arc<EventHub>, PriceCache) {
        let hub = Arc::new(EventHub::new(16, 16));
        let cache = PriceCache::new(Arc::clone(&hub), 60);
        (hub, cache)
    }

    #[test]
    fn fresh_quote_is_returned_and_published() {
        let (hub, cache) = cache();
        cache.submit(snapshot(dec!(29990), dec!(30010), 1_000)).unwrap();
        let quote = cache.get(ContractSymbol::BtcUsd, Timestamp::from_millis(2_000)).unwrap();
        assert_eq!(quote.mid().value(), dec!(30000));
        assert!(hub
            .history_since(None)
            .iter()
            .any(|e| matches!(e.payload, EventPayload::PriceUpdate { .. })));
    }

    #[test]
    fn stale_quote_degrades_health() {
        let (hub, cache) = cache();
        cache.submit(snapshot(dec!(29990), dec!(30010), 0)).unwrap();
        let err = cache.get(ContractSymbol::BtcUsd, Timestamp::from_millis(61_000)).unwrap_err();
        assert!(matches!(err, PriceFeedError::Stale { .. }));
        assert_eq!(hub.health(Service::PriceFeed), Some(ServiceStatus::Degraded));
    }

    #[test]
    fn crossed_quote_is_rejected() {
        let (_, cache) = cache();
        assert!(cache.submit(snapshot(dec!(30010), dec!(29990), 0)).is_err());
        assert!(matches!(
            cache.get(ContractSymbol::BtcUsd, Timestamp::from_millis(0)),
            Err(PriceFeedError::NoPriceAvailable(_))
        ));
    }
}
