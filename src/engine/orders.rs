//! Order intake and trade execution.
//!
//! Intake is synchronous: the order is validated, planned against the channel,
//! checked for capacity and the channel slot is claimed before anything is sent.
//! A second order for a busy channel fails right here with `NegotiationInProgress`.
//! The negotiation itself runs as an `AsyncTrade` background task.

use super::core::Engine;
use super::results::{ChannelOpening, EngineError, FundingSource, OrderResult};
use crate::channel::{Channel, ChannelReserves, ChannelState, ProposedTerms, SlotPurpose};
use crate::events::EventPayload;
use crate::margin::{coordinator_leverage_for, referral_rebate};
use crate::order::{plan_trade, Order, OrderReason, TradeAction, TradeParams, TradePlan, UnfundedOrder};
use crate::position::PositionState;
use crate::price_feed::PriceSnapshot;
use crate::supervisor::{BackgroundTask, TaskContext, TaskInput};
use crate::types::{ChannelId, ContractSymbol, Direction, Leverage, OrderId, PeerId, Price, ProtocolId, Sats, TxRef};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

impl Engine {
    /// Market order against the coordinator quote. Opens a channel first when
    /// the trader has none.
    pub fn submit_market_order(
        &self,
        trader: PeerId,
        symbol: ContractSymbol,
        direction: Direction,
        quantity: Decimal,
        leverage: Leverage,
    ) -> Result<OrderResult, EngineError> {
        let order = Order::market(trader, symbol, direction, quantity, leverage, OrderReason::Manual, self.time());
        self.place_order(order)
    }

    pub(super) fn place_order(&self, mut order: Order) -> Result<OrderResult, EngineError> {
        self.save_order(&order)?;
        if let Err(e) = order.validate(self.settings.max_leverage()) {
            return Err(self.reject_order(&mut order, e.into()));
        }
        let quote = match self.quote(order.symbol) {
            Ok(quote) => quote,
            Err(e) => return Err(self.reject_order(&mut order, e)),
        };
        let price = order.fill_price(quote.bid, quote.ask);
        let params = self.trade_params(&order, price)?;

        let owner = ProtocolId::new();
        let now = self.time();
        let _guard = self.channel_guard.lock();

        let (mut channel, purpose) = match self.storage.open_channel_for(&order.trader)? {
            Some(channel) if channel.is_signed() => (channel, SlotPurpose::Trade),
            Some(channel) => {
                let owner = channel.slot_owner().unwrap_or_default();
                let e = EngineError::NegotiationInProgress { channel_id: channel.channel_id, owner };
                return Err(self.reject_order(&mut order, e));
            }
            None => {
                let plan = plan_trade(None, &order, &params);
                let reserves = self.reserves_for(&plan);
                let channel = Channel::offered(
                    ChannelId::new(),
                    order.trader.clone(),
                    reserves,
                    self.settings.channel.fee_rate_sats_vb,
                    now,
                );
                (channel, SlotPurpose::ChannelOpen)
            }
        };

        if let Some(claim) = channel.slot.filter(|claim| claim.owner != owner) {
            let e = EngineError::NegotiationInProgress { channel_id: channel.channel_id, owner: claim.owner };
            return Err(self.reject_order(&mut order, e));
        }

        let plan = plan_trade(channel.contract.as_ref(), &order, &params);
        if let Err(e) = channel.preview(&plan.phases) {
            return Err(self.reject_order(&mut order, e.into()));
        }

        channel.claim_slot(owner, purpose, now)?;
        self.storage.upsert_channel(&channel)?;
        if purpose == SlotPurpose::ChannelOpen {
            self.publish_channel(channel.channel_id)?;
        }

        order.start_filling(price, now)?;
        self.save_order(&order)?;

        let action = plan.action;
        let channel_id = channel.channel_id;
        match self.supervisor.spawn_planned(
            TaskInput::Trade { order_id: order.id },
            Some(channel_id),
            owner,
            Some(plan),
            self.runner(),
        ) {
            Ok(handle) => {
                info!(
                    order_id = %order.id,
                    channel_id = %channel_id,
                    protocol_id = %owner,
                    action = ?action,
                    price = %price,
                    "order accepted"
                );
                Ok(OrderResult { order_id: order.id, channel_id, action, task_id: handle.task_id })
            }
            Err(e) => {
                // nothing was sent, hand the slot back
                channel.release_slot(owner, now)?;
                if purpose == SlotPurpose::ChannelOpen {
                    channel.cancel(now)?;
                }
                self.storage.upsert_channel(&channel)?;
                Err(self.reject_order(&mut order, e))
            }
        }
    }

    // 8.3: params for planning at `price`
    fn trade_params(&self, order: &Order, price: Price) -> Result<TradeParams, EngineError> {
        let volume: Decimal = self
            .storage
            .trades_for(&order.trader)?
            .iter()
            .map(|trade| trade.quantity.abs())
            .sum();
        let table = self.storage.coordinator_leverages()?;
        Ok(TradeParams {
            price,
            fee_rate: self.settings.fees.matching_fee_rate,
            fee_rebate: referral_rebate(&self.settings.fees.referral_tiers, volume),
            maintenance_margin_rate: self.settings.margin.maintenance_margin_rate,
            coordinator_leverage: coordinator_leverage_for(&table, order.leverage),
            expiry: self.next_expiry(),
        })
    }

    // default reserves, grown to cover the opening renew
    fn reserves_for(&self, plan: &TradePlan) -> ChannelReserves {
        let defaults = &self.settings.channel;
        let (trader, coordinator) = match plan.phases.first() {
            Some(ProposedTerms::Renew(renew)) => (
                renew.trader_margin_delta.add(renew.trader_fee),
                renew.coordinator_margin_delta.sub(renew.trader_fee),
            ),
            _ => (Sats::ZERO, Sats::ZERO),
        };
        ChannelReserves {
            trader: defaults.default_trader_reserve.max(trader),
            coordinator: defaults.default_coordinator_reserve.max(coordinator),
        }
    }

    pub(super) fn save_order(&self, order: &Order) -> Result<(), EngineError> {
        self.storage.upsert_order(order)?;
        self.emit(EventPayload::OrderUpdate(order.clone()));
        Ok(())
    }

    // marks the order rejected and hands back the reason
    fn reject_order(&self, order: &mut Order, reason: EngineError) -> EngineError {
        if let Err(e) = order.reject(reason.to_string(), self.time()) {
            warn!(order_id = %order.id, error = %e, "order already final");
            return reason;
        }
        if let Err(e) = self.save_order(order) {
            error!(order_id = %order.id, error = %e, "could not persist rejected order");
        }
        warn!(order_id = %order.id, trader = %order.trader, reason = %reason, "order rejected");
        reason
    }

    // 8.3.1: channel opening with explicit reserves
    pub async fn submit_channel_opening_order(
        &self,
        trader: PeerId,
        symbol: ContractSymbol,
        direction: Direction,
        quantity: Decimal,
        leverage: Leverage,
        reserves: ChannelReserves,
        funding: FundingSource,
    ) -> Result<ChannelOpening, EngineError> {
        let mut order = Order::market(trader, symbol, direction, quantity, leverage, OrderReason::Manual, self.time());
        self.save_order(&order)?;
        if let Err(e) = order.validate(self.settings.max_leverage()) {
            return Err(self.reject_order(&mut order, e.into()));
        }
        if self.storage.open_channel_for(&order.trader)?.is_some() {
            let e = EngineError::ChannelExists(order.trader.clone());
            return Err(self.reject_order(&mut order, e));
        }
        let quote = match self.quote(order.symbol) {
            Ok(quote) => quote,
            Err(e) => return Err(self.reject_order(&mut order, e)),
        };

        let channel_id = ChannelId::new();
        if let Err(e) = self.opening_plan(&order, channel_id, reserves, &quote) {
            return Err(self.reject_order(&mut order, e));
        }

        match funding {
            FundingSource::Wallet => {
                let result = self.start_channel_opening(order, channel_id, reserves, None)?;
                Ok(ChannelOpening {
                    order_id: result.order_id,
                    channel_id,
                    funding_address: None,
                    task_id: Some(result.task_id),
                })
            }
            FundingSource::External => {
                let funding_address = self.chain.new_address().await?;
                self.storage.insert_unfunded_order(&UnfundedOrder {
                    order: order.clone(),
                    channel_id,
                    reserves,
                    funding_address: funding_address.clone(),
                    created_at: self.time(),
                })?;
                info!(order_id = %order.id, channel_id = %channel_id, address = %funding_address, "waiting for funding");
                Ok(ChannelOpening { order_id: order.id, channel_id, funding_address: Some(funding_address), task_id: None })
            }
        }
    }

    fn opening_plan(
        &self,
        order: &Order,
        channel_id: ChannelId,
        reserves: ChannelReserves,
        quote: &PriceSnapshot,
    ) -> Result<(Channel, TradePlan), EngineError> {
        let price = order.fill_price(quote.bid, quote.ask);
        let params = self.trade_params(order, price)?;
        let plan = plan_trade(None, order, &params);
        let channel = Channel::offered(
            channel_id,
            order.trader.clone(),
            reserves,
            self.settings.channel.fee_rate_sats_vb,
            self.time(),
        );
        channel.preview(&plan.phases)?;
        Ok((channel, plan))
    }

    // creates the channel record with the slot held and hands it to a trade task
    fn start_channel_opening(
        &self,
        mut order: Order,
        channel_id: ChannelId,
        reserves: ChannelReserves,
        funding: Option<TxRef>,
    ) -> Result<OrderResult, EngineError> {
        let quote = match self.quote(order.symbol) {
            Ok(quote) => quote,
            Err(e) => return Err(self.reject_order(&mut order, e)),
        };
        let (mut channel, plan) = match self.opening_plan(&order, channel_id, reserves, &quote) {
            Ok(planned) => planned,
            Err(e) => return Err(self.reject_order(&mut order, e)),
        };
        let price = order.fill_price(quote.bid, quote.ask);
        let owner = ProtocolId::new();
        let now = self.time();

        let _guard = self.channel_guard.lock();
        if self.storage.open_channel_for(&order.trader)?.is_some() {
            let e = EngineError::ChannelExists(order.trader.clone());
            return Err(self.reject_order(&mut order, e));
        }
        channel.funding = funding;
        channel.claim_slot(owner, SlotPurpose::ChannelOpen, now)?;
        self.storage.upsert_channel(&channel)?;
        self.publish_channel(channel_id)?;

        order.start_filling(price, now)?;
        self.save_order(&order)?;

        let action = plan.action;
        let handle = self.supervisor.spawn_planned(
            TaskInput::Trade { order_id: order.id },
            Some(channel_id),
            owner,
            Some(plan),
            self.runner(),
        )?;
        info!(order_id = %order.id, channel_id = %channel_id, protocol_id = %owner, "channel opening started");
        Ok(OrderResult { order_id: order.id, channel_id, action, task_id: handle.task_id })
    }

    pub fn funding_address(&self, order_id: OrderId) -> Result<String, EngineError> {
        self.storage
            .get_unfunded_order(order_id)?
            .map(|unfunded| unfunded.funding_address)
            .ok_or(EngineError::NotUnfunded(order_id))
    }

    /// The trader's funding transaction arrived. The channel opening starts now
    /// at the current quote.
    pub fn notify_funding_received(&self, order_id: OrderId, funding: TxRef) -> Result<OrderResult, EngineError> {
        let unfunded = self
            .storage
            .remove_unfunded_order(order_id)?
            .ok_or(EngineError::NotUnfunded(order_id))?;
        info!(order_id = %order_id, funding = %funding, "external funding received");
        self.start_channel_opening(unfunded.order, unfunded.channel_id, unfunded.reserves, Some(funding))
    }

    pub fn abort_unfunded_order(&self, order_id: OrderId) -> Result<Order, EngineError> {
        let unfunded = self
            .storage
            .remove_unfunded_order(order_id)?
            .ok_or(EngineError::NotUnfunded(order_id))?;
        let mut order = unfunded.order;
        order.reject("aborted by trader", self.time())?;
        self.save_order(&order)?;
        info!(order_id = %order_id, "unfunded order aborted");
        Ok(order)
    }

    // 8.3.2: positions past expiry are closed with an opposite order
    pub fn close_expired_positions(&self) -> Result<Vec<OrderResult>, EngineError> {
        let now = self.time();
        let mut results = Vec::new();
        for position in self.storage.positions()? {
            if !position.is_expired(now) || position.state != PositionState::Open {
                continue;
            }
            let order = Order::market(
                position.trader.clone(),
                position.symbol,
                position.direction.opposite(),
                position.quantity,
                position.trader_leverage,
                OrderReason::Expired,
                now,
            );
            match self.place_order(order) {
                Ok(result) => {
                    info!(trader = %position.trader, channel_id = %position.channel_id, "closing expired position");
                    results.push(result);
                }
                Err(e) => warn!(trader = %position.trader, error = %e, "could not close expired position"),
            }
        }
        Ok(results)
    }

    // 8.3.3: the AsyncTrade task body
    pub(super) async fn run_trade(
        &self,
        task: BackgroundTask,
        order_id: OrderId,
        ctx: &TaskContext,
    ) -> Result<(), EngineError> {
        let order = self.storage.get_order(order_id)?.ok_or(EngineError::OrderNotFound(order_id))?;
        if order.state.is_terminal() {
            return Ok(());
        }
        let channel_id = task.channel_id.ok_or(EngineError::TaskWithoutChannel(task.id))?;

        match self.execute_trade(&task, &order, channel_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let last_attempt = !e.is_retryable() || ctx.attempt >= self.supervisor.retry_policy().max_attempts;
                if last_attempt {
                    self.abandon_trade(&task, order, channel_id, &e)?;
                }
                Err(e)
            }
        }
    }

    async fn execute_trade(&self, task: &BackgroundTask, order: &Order, channel_id: ChannelId) -> Result<(), EngineError> {
        let owner = task.protocol_id;
        let channel = self.load_channel(channel_id)?;
        if matches!(channel.state, ChannelState::Offered | ChannelState::Accepted) {
            self.open_channel(channel_id, owner).await?;
        }

        let plan = match &task.plan {
            Some(plan) => plan.clone(),
            None => {
                let price = match order.execution_price {
                    Some(price) => price,
                    None => {
                        let quote = self.quote(order.symbol)?;
                        order.fill_price(quote.bid, quote.ask)
                    }
                };
                let params = self.trade_params(order, price)?;
                let plan = plan_trade(self.load_channel(channel_id)?.contract.as_ref(), order, &params);
                self.supervisor.set_plan(task.id, plan.clone())?;
                plan
            }
        };

        let state = match plan.action {
            TradeAction::Resize => PositionState::Resizing,
            TradeAction::Reduce | TradeAction::Close | TradeAction::Flip => PositionState::Closing,
            TradeAction::Open => PositionState::Open,
        };
        self.set_channel_position_state(channel_id, state)?;

        for (index, terms) in plan.phases.iter().enumerate().skip(task.phase as usize) {
            let phase = u32::try_from(index).unwrap_or(u32::MAX);
            let protocol_id = owner.for_phase(phase);
            self.drive_negotiation(channel_id, owner, protocol_id, terms.clone()).await?;
            self.record_fill(order, channel_id, protocol_id, terms)?;
            self.supervisor.set_phase(task.id, phase + 1)?;
        }

        let mut filled = order.clone();
        filled.fill(self.time())?;
        self.save_order(&filled)?;
        self.release_slot(channel_id, owner)?;
        info!(order_id = %order.id, channel_id = %channel_id, action = ?plan.action, "order filled");
        Ok(())
    }

    // final failure: nothing in flight, slot free, order failed with the reason
    pub(super) fn abandon_trade(
        &self,
        task: &BackgroundTask,
        mut order: Order,
        channel_id: ChannelId,
        reason: &EngineError,
    ) -> Result<(), EngineError> {
        let owner = task.protocol_id;
        let phase = self.supervisor.task(task.id)?.map(|t| t.phase).unwrap_or(task.phase);
        let channel = self.load_channel(channel_id)?;

        if let Some(negotiation) = channel.negotiation.as_ref() {
            let stale = (0..=phase).any(|p| owner.for_phase(p) == negotiation.protocol_id);
            if stale {
                self.abort_negotiation(channel_id, negotiation.protocol_id)?;
            }
        }
        if Self::is_open_channel(&channel) && channel.state != ChannelState::Signed {
            let now = self.time();
            self.update_channel(channel_id, |c| Ok(c.cancel(now)?))?;
        } else {
            self.release_slot(channel_id, owner)?;
        }

        let flat_after_flip = matches!(&task.plan, Some(plan) if plan.action == TradeAction::Flip) && phase >= 1;
        let detail = if flat_after_flip {
            format!("flip settled the old position but the new one failed, position is flat: {reason}")
        } else {
            reason.to_string()
        };

        self.sync_position(channel_id)?;
        if !order.state.is_terminal() {
            order.fail(detail.clone(), self.time())?;
            self.save_order(&order)?;
        }
        error!(order_id = %order.id, channel_id = %channel_id, detail = %detail, "order failed");
        Ok(())
    }
}
