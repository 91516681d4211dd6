// 8.4 engine/positions.rs: trade rows and the position view. a position is
// always re-derived from the channel's contract, so writing it twice is harmless.

use super::core::Engine;
use super::results::EngineError;
use crate::channel::{ProposedTerms, RenewPurpose};
use crate::events::EventPayload;
use crate::order::{Order, Trade};
use crate::position::{Position, PositionState};
use crate::types::{ChannelId, ProtocolId, SignedQuantity};
use tracing::{debug, info};

impl Engine {
    // 8.4.1: one trade row per finalized phase
    pub(super) fn record_fill(
        &self,
        order: &Order,
        channel_id: ChannelId,
        protocol_id: ProtocolId,
        terms: &ProposedTerms,
    ) -> Result<(), EngineError> {
        let now = self.time();
        let trade = match terms {
            ProposedTerms::Renew(renew) => {
                let added = match renew.purpose {
                    RenewPurpose::Resize => order.quantity,
                    RenewPurpose::Open | RenewPurpose::Rollover => renew.contract.quantity,
                };
                Trade {
                    order_id: order.id,
                    protocol_id,
                    trader: order.trader.clone(),
                    symbol: order.symbol,
                    quantity: SignedQuantity::from_direction(renew.contract.trader_direction, added),
                    direction: renew.contract.trader_direction,
                    cost: renew.trader_margin_delta,
                    fee: renew.trader_fee,
                    realized_pnl: None,
                    price: order.execution_price.unwrap_or(renew.contract.average_entry_price),
                    timestamp: now,
                }
            }
            ProposedTerms::Settle(settle) => Trade {
                order_id: order.id,
                protocol_id,
                trader: order.trader.clone(),
                symbol: order.symbol,
                quantity: SignedQuantity::from_direction(order.direction, settle.settled_quantity),
                direction: order.direction,
                cost: settle.trader_payout.negate(),
                fee: settle.trader_fee,
                realized_pnl: Some(settle.realized_pnl),
                price: settle.price,
                timestamp: now,
            },
        };

        // a resumed task may book the same phase again
        let booked = self
            .storage
            .trades_for(&order.trader)?
            .iter()
            .any(|t| t.order_id == trade.order_id && t.protocol_id == trade.protocol_id);
        if booked {
            debug!(order_id = %order.id, "trade already booked");
        } else {
            self.storage.insert_trade(&trade)?;
        }

        self.sync_position(channel_id)
    }

    // 8.4.2: position from the channel's current contract. no contract, no position.
    pub(super) fn sync_position(&self, channel_id: ChannelId) -> Result<(), EngineError> {
        let channel = self.load_channel(channel_id)?;
        let trader = channel.counterparty.clone();
        let now = self.time();

        let contract = channel.contract.as_ref().filter(|_| channel.is_signed());
        let existing = self
            .storage
            .positions()?
            .into_iter()
            .find(|p| p.channel_id == channel_id);

        match contract {
            Some(contract) => {
                let created_at = existing.as_ref().map(|p| p.created_at).unwrap_or(now);
                match Position::from_contract(trader, channel_id, contract, created_at, now) {
                    Some(position) => {
                        self.storage.upsert_position(&position)?;
                        debug!(channel_id = %channel_id, quantity = %position.quantity, "position updated");
                        self.emit(EventPayload::PositionUpdate(position));
                    }
                    None => self.remove_channel_positions(channel_id)?,
                }
            }
            None => self.remove_channel_positions(channel_id)?,
        }
        Ok(())
    }

    pub(super) fn remove_channel_positions(&self, channel_id: ChannelId) -> Result<(), EngineError> {
        for position in self.storage.positions()?.into_iter().filter(|p| p.channel_id == channel_id) {
            self.storage.delete_position(&position.trader, position.symbol)?;
            info!(channel_id = %channel_id, trader = %position.trader, "position closed");
            self.emit(EventPayload::PositionClosed {
                trader: position.trader,
                symbol: position.symbol,
                channel_id,
            });
        }
        Ok(())
    }

    pub(super) fn set_channel_position_state(&self, channel_id: ChannelId, state: PositionState) -> Result<(), EngineError> {
        let now = self.time();
        for mut position in self.storage.positions()?.into_iter().filter(|p| p.channel_id == channel_id) {
            if position.state == state {
                continue;
            }
            position.state = state;
            position.updated_at = now;
            self.storage.upsert_position(&position)?;
            self.emit(EventPayload::PositionUpdate(position));
        }
        Ok(())
    }
}
