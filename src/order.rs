// 5.0 order.rs: market orders, trades, and the mapping from an order onto
// channel renegotiations. no book here: the coordinator is always the
// counterparty and fills at its quote (longs at the ask, shorts at the bid).
//
// 5.1 classification:
//   no contract / same direction -> Open / Resize (renew)
//   opposite, smaller            -> Reduce (partial settle)
//   opposite, equal              -> Close (full settle)
//   opposite, larger             -> Flip (full settle, then renew)

use crate::channel::{ChannelReserves, Contract, ProposedTerms, RenewPurpose, RenewTerms, SettleTerms};
use crate::margin::{liquidation_price, margin_sats, order_matching_fee_with_rebate};
use crate::position::{harmonic_average_entry, settle_split};
use crate::types::{
    ChannelId, ContractId, ContractSymbol, Direction, Leverage, OrderId, PeerId, Price, ProtocolId, Sats, SignedQuantity,
    Timestamp,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Open,
    Filling,
    Filled,
    Failed,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Failed | OrderState::Rejected)
    }

    pub fn can_transition_to(&self, next: OrderState) -> bool {
        match self {
            OrderState::Open => matches!(next, OrderState::Filling | OrderState::Rejected),
            OrderState::Filling => {
                matches!(next, OrderState::Filled | OrderState::Failed | OrderState::Rejected)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderReason {
    Manual,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("order {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition { id: OrderId, from: OrderState, to: OrderState },

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("leverage {requested} above max {max}")]
    LeverageTooHigh { requested: Leverage, max: Leverage },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub trader: PeerId,
    pub symbol: ContractSymbol,
    pub leverage: Leverage,
    pub quantity: Decimal,
    pub direction: Direction,
    pub order_type: OrderType,
    pub state: OrderState,
    pub reason: OrderReason,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub execution_price: Option<Price>,
    pub failure: Option<String>,
}

impl Order {
    pub fn market(
        trader: PeerId,
        symbol: ContractSymbol,
        direction: Direction,
        quantity: Decimal,
        leverage: Leverage,
        reason: OrderReason,
        now: Timestamp,
    ) -> Self {
        Self {
            id: OrderId::new(),
            trader,
            symbol,
            leverage,
            quantity,
            direction,
            order_type: OrderType::Market,
            state: OrderState::Open,
            reason,
            created_at: now,
            updated_at: now,
            execution_price: None,
            failure: None,
        }
    }

    pub fn validate(&self, max_leverage: Leverage) -> Result<(), OrderError> {
        if self.quantity <= Decimal::ZERO {
            return Err(OrderError::InvalidQuantity(self.quantity));
        }
        if self.leverage > max_leverage {
            return Err(OrderError::LeverageTooHigh { requested: self.leverage, max: max_leverage });
        }
        Ok(())
    }

    fn transition(&mut self, next: OrderState, now: Timestamp) -> Result<(), OrderError> {
        if !self.state.can_transition_to(next) {
            return Err(OrderError::InvalidTransition { id: self.id, from: self.state, to: next });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn start_filling(&mut self, price: Price, now: Timestamp) -> Result<(), OrderError> {
        self.transition(OrderState::Filling, now)?;
        self.execution_price = Some(price);
        Ok(())
    }

    pub fn fill(&mut self, now: Timestamp) -> Result<(), OrderError> {
        self.transition(OrderState::Filled, now)
    }

    pub fn fail(&mut self, detail: impl Into<String>, now: Timestamp) -> Result<(), OrderError> {
        self.transition(OrderState::Failed, now)?;
        self.failure = Some(detail.into());
        Ok(())
    }

    pub fn reject(&mut self, detail: impl Into<String>, now: Timestamp) -> Result<(), OrderError> {
        self.transition(OrderState::Rejected, now)?;
        self.failure = Some(detail.into());
        Ok(())
    }

    // longs take the ask, shorts the bid
    pub fn fill_price(&self, bid: Price, ask: Price) -> Price {
        match self.direction {
            Direction::Long => ask,
            Direction::Short => bid,
        }
    }
}

/// Append-only fill record. One per finalized phase of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub order_id: OrderId,
    /// Negotiation that produced this fill. A flip books one row per phase.
    pub protocol_id: ProtocolId,
    pub trader: PeerId,
    pub symbol: ContractSymbol,
    pub quantity: SignedQuantity,
    pub direction: Direction,
    pub cost: Sats,
    pub fee: Sats,
    pub realized_pnl: Option<Sats>,
    pub price: Price,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Open,
    Resize,
    Reduce,
    Close,
    Flip,
}

pub fn classify(existing: Option<&Contract>, direction: Direction, quantity: Decimal) -> TradeAction {
    match existing {
        None => TradeAction::Open,
        Some(contract) if contract.quantity.is_zero() => TradeAction::Open,
        Some(contract) if contract.trader_direction == direction => TradeAction::Resize,
        Some(contract) if quantity < contract.quantity => TradeAction::Reduce,
        Some(contract) if quantity == contract.quantity => TradeAction::Close,
        Some(_) => TradeAction::Flip,
    }
}

/// Everything the planner needs besides the order and the current contract.
#[derive(Debug, Clone, Copy)]
pub struct TradeParams {
    pub price: Price,
    pub fee_rate: Decimal,
    pub fee_rebate: Decimal,
    pub maintenance_margin_rate: Decimal,
    pub coordinator_leverage: Leverage,
    pub expiry: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradePlan {
    pub action: TradeAction,
    pub phases: Vec<ProposedTerms>,
}

fn new_contract(
    symbol: ContractSymbol,
    direction: Direction,
    quantity: Decimal,
    trader_leverage: Leverage,
    coordinator_leverage: Leverage,
    params: &TradeParams,
) -> Contract {
    let mmr = params.maintenance_margin_rate;
    let price = params.price;
    Contract {
        contract_id: ContractId::new(),
        symbol,
        trader_direction: direction,
        quantity,
        average_entry_price: price,
        trader_leverage,
        coordinator_leverage,
        trader_margin: margin_sats(quantity, price, trader_leverage),
        coordinator_margin: margin_sats(quantity, price, coordinator_leverage),
        trader_liquidation_price: liquidation_price(price, trader_leverage, direction, mmr),
        coordinator_liquidation_price: liquidation_price(price, coordinator_leverage, direction.opposite(), mmr),
        expiry: params.expiry,
    }
}

fn open_terms(order: &Order, quantity: Decimal, params: &TradeParams) -> ProposedTerms {
    let contract = new_contract(
        order.symbol,
        order.direction,
        quantity,
        order.leverage,
        params.coordinator_leverage,
        params,
    );
    ProposedTerms::Renew(RenewTerms {
        purpose: RenewPurpose::Open,
        trader_margin_delta: contract.trader_margin,
        coordinator_margin_delta: contract.coordinator_margin,
        trader_fee: order_matching_fee_with_rebate(quantity, params.price, params.fee_rate, params.fee_rebate),
        contract,
        order_id: Some(order.id),
    })
}

fn resize_terms(order: &Order, existing: &Contract, params: &TradeParams) -> ProposedTerms {
    let quantity = existing.quantity + order.quantity;
    let entry = harmonic_average_entry(existing.quantity, existing.average_entry_price, order.quantity, params.price);
    let trader_margin_delta = margin_sats(order.quantity, params.price, existing.trader_leverage);
    let coordinator_margin_delta = margin_sats(order.quantity, params.price, existing.coordinator_leverage);
    let mmr = params.maintenance_margin_rate;

    let contract = Contract {
        contract_id: ContractId::new(),
        quantity,
        average_entry_price: entry,
        trader_margin: existing.trader_margin.add(trader_margin_delta),
        coordinator_margin: existing.coordinator_margin.add(coordinator_margin_delta),
        trader_liquidation_price: liquidation_price(entry, existing.trader_leverage, existing.trader_direction, mmr),
        coordinator_liquidation_price: liquidation_price(
            entry,
            existing.coordinator_leverage,
            existing.trader_direction.opposite(),
            mmr,
        ),
        ..existing.clone()
    };

    ProposedTerms::Renew(RenewTerms {
        purpose: RenewPurpose::Resize,
        contract,
        trader_margin_delta,
        coordinator_margin_delta,
        trader_fee: order_matching_fee_with_rebate(order.quantity, params.price, params.fee_rate, params.fee_rebate),
        order_id: Some(order.id),
    })
}

fn settle_terms(order: &Order, existing: &Contract, quantity: Decimal, params: &TradeParams) -> ProposedTerms {
    let split = settle_split(existing, quantity, params.price);
    let remaining_quantity = existing.quantity - quantity;
    let remaining = if remaining_quantity > Decimal::ZERO {
        Some(Contract {
            contract_id: ContractId::new(),
            quantity: remaining_quantity,
            trader_margin: split.remaining_trader_margin,
            coordinator_margin: split.remaining_coordinator_margin,
            ..existing.clone()
        })
    } else {
        None
    };

    ProposedTerms::Settle(SettleTerms {
        price: params.price,
        settled_quantity: quantity,
        trader_payout: split.trader_payout,
        coordinator_payout: split.coordinator_payout,
        trader_fee: order_matching_fee_with_rebate(quantity, params.price, params.fee_rate, params.fee_rebate),
        realized_pnl: split.realized_pnl,
        remaining,
        order_id: Some(order.id),
    })
}

// 5.2: phases to run in order. a flip holds the slot across both.
pub fn plan_trade(existing: Option<&Contract>, order: &Order, params: &TradeParams) -> TradePlan {
    let action = classify(existing, order.direction, order.quantity);
    let phases = match (action, existing) {
        (TradeAction::Resize, Some(contract)) => vec![resize_terms(order, contract, params)],
        (TradeAction::Reduce, Some(contract)) => vec![settle_terms(order, contract, order.quantity, params)],
        (TradeAction::Close, Some(contract)) => vec![settle_terms(order, contract, contract.quantity, params)],
        (TradeAction::Flip, Some(contract)) => vec![
            settle_terms(order, contract, contract.quantity, params),
            open_terms(order, order.quantity - contract.quantity, params),
        ],
        _ => vec![open_terms(order, order.quantity, params)],
    };
    TradePlan { action, phases }
}

/// Channel-opening order waiting for its funding transaction. Removed when
/// the funding arrives or the trader aborts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnfundedOrder {
    pub order: Order,
    pub channel_id: ChannelId,
    pub reserves: ChannelReserves,
    pub funding_address: String,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Contract;
    use rust_decimal_macros::dec;

    fn params() -> TradeParams {
        TradeParams {
            price: Price::new_unchecked(dec!(30000)),
            fee_rate: dec!(0.003),
            fee_rebate: Decimal::ZERO,
            maintenance_margin_rate: dec!(0.1),
            coordinator_leverage: Leverage::new(dec!(2)).unwrap(),
            expiry: Timestamp::from_millis(1_000),
        }
    }

    fn order(direction: Direction, quantity: Decimal) -> Order {
        Order::market(
            PeerId::new("trader"),
            ContractSymbol::BtcUsd,
            direction,
            quantity,
            Leverage::new(dec!(2)).unwrap(),
            OrderReason::Manual,
            Timestamp::from_millis(1),
        )
    }

    fn opened(direction: Direction, quantity: Decimal) -> Contract {
        match plan_trade(None, &order(direction, quantity), &params()).phases.remove(0) {
            ProposedTerms::Renew(renew) => renew.contract,
            other => panic!("expected renew, got {other:?}"),
        }
    }

    #[test]
    fn order_state_is_monotonic() {
        let mut o = order(Direction::Long, dec!(100));
        let now = Timestamp::from_millis(2);
        o.start_filling(Price::new_unchecked(dec!(30000)), now).unwrap();
        o.fill(now).unwrap();
        assert!(o.fail("late", now).is_err());
        assert!(o.state.is_terminal());

        let mut open = order(Direction::Long, dec!(100));
        open.reject("no price", now).unwrap();
        assert_eq!(open.state, OrderState::Rejected);
    }

    #[test]
    fn classification_covers_all_cases() {
        let long = opened(Direction::Long, dec!(100));
        assert_eq!(classify(None, Direction::Long, dec!(1)), TradeAction::Open);
        assert_eq!(classify(Some(&long), Direction::Long, dec!(1)), TradeAction::Resize);
        assert_eq!(classify(Some(&long), Direction::Short, dec!(50)), TradeAction::Reduce);
        assert_eq!(classify(Some(&long), Direction::Short, dec!(100)), TradeAction::Close);
        assert_eq!(classify(Some(&long), Direction::Short, dec!(150)), TradeAction::Flip);
    }

    #[test]
    fn open_100_long_at_2x() {
        let contract = opened(Direction::Long, dec!(100));
        assert_eq!(contract.trader_margin.value(), 166_667);
        assert!(contract.trader_liquidation_price.value() < dec!(30000));
        assert!(contract.coordinator_liquidation_price.value() > dec!(30000));
    }

    #[test]
    fn flip_plans_settle_then_open() {
        let long = opened(Direction::Long, dec!(100));
        let plan = plan_trade(Some(&long), &order(Direction::Short, dec!(150)), &params());
        assert_eq!(plan.action, TradeAction::Flip);
        assert_eq!(plan.phases.len(), 2);
        match (&plan.phases[0], &plan.phases[1]) {
            (ProposedTerms::Settle(settle), ProposedTerms::Renew(renew)) => {
                assert!(settle.remaining.is_none());
                assert_eq!(renew.contract.quantity, dec!(50));
                assert_eq!(renew.contract.trader_direction, Direction::Short);
            }
            other => panic!("unexpected phases {other:?}"),
        }
    }

    #[test]
    fn reduce_keeps_entry_and_direction() {
        let long = opened(Direction::Long, dec!(100));
        let plan = plan_trade(Some(&long), &order(Direction::Short, dec!(40)), &params());
        match &plan.phases[0] {
            ProposedTerms::Settle(settle) => {
                let remaining = settle.remaining.as_ref().unwrap();
                assert_eq!(remaining.quantity, dec!(60));
                assert_eq!(remaining.average_entry_price, long.average_entry_price);
                assert_eq!(
                    settle.trader_payout.add(settle.coordinator_payout).add(remaining.total_margin()),
                    long.total_margin()
                );
            }
            other => panic!("expected settle, got {other:?}"),
        }
    }
}
