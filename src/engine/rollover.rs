// 8.5 engine/rollover.rs: rollover scheduling and the Rollover task.
// a signed channel whose contract expires after the upcoming expiry is left alone;
// inside the window it is renewed with the same quantity and a later expiry.

use super::core::Engine;
use super::results::EngineError;
use crate::channel::{ProposedTerms, SlotPurpose};
use crate::events::EventPayload;
use crate::margin::coordinator_leverage_for;
use crate::position::PositionState;
use crate::rollover::{rollover_terms, RolloverMarket};
use crate::supervisor::{BackgroundTask, TaskContext, TaskHandle, TaskInput};
use crate::types::{ChannelId, ProtocolId};
use tracing::{error, info, warn};

impl Engine {
    /// Starts a rollover task for every channel inside its rollover window.
    /// Each one is announced with a `RolloverRequired` event first.
    pub fn check_rollovers(&self) -> Result<Vec<TaskHandle>, EngineError> {
        if !self.settings.rollover.enabled {
            return Ok(Vec::new());
        }
        let now = self.time();
        let mut started = Vec::new();

        for channel in self.storage.channels()? {
            if !channel.is_signed() || channel.manual_recovery {
                continue;
            }
            let Some(contract) = channel.contract.as_ref() else {
                continue;
            };
            if !self.calendar.should_roll(contract.expiry, now) {
                continue;
            }
            self.emit(EventPayload::RolloverRequired { channel_id: channel.channel_id, expiry: contract.expiry });
            started.push(self.request_rollover(channel.channel_id)?);
        }
        Ok(started)
    }

    /// A pending rollover for the same channel is returned instead of a new one.
    pub fn request_rollover(&self, channel_id: ChannelId) -> Result<TaskHandle, EngineError> {
        self.supervisor
            .spawn(TaskInput::Rollover, Some(channel_id), ProtocolId::new(), self.runner())
    }

    pub(super) async fn run_rollover(&self, task: &BackgroundTask, ctx: &TaskContext) -> Result<(), EngineError> {
        let channel_id = task.channel_id.ok_or(EngineError::TaskWithoutChannel(task.id))?;
        let owner = task.protocol_id;
        let protocol_id = owner.for_phase(0);

        let channel = self.load_channel(channel_id)?;
        if channel.last_finalized == Some(protocol_id) {
            self.sync_position(channel_id)?;
            return self.release_slot(channel_id, owner);
        }

        let terms = match channel.active_negotiation(protocol_id) {
            Some(negotiation) => negotiation.terms.clone(),
            None => {
                let now = self.time();
                self.update_channel(channel_id, |c| Ok(c.claim_slot(owner, SlotPurpose::Rollover, now)?))?;
                match self.rollover_offer(channel_id, protocol_id) {
                    Ok(terms) => terms,
                    Err(e) => return self.rollover_failed(task, ctx, protocol_id, e),
                }
            }
        };

        match self.drive_negotiation(channel_id, owner, protocol_id, terms).await {
            Ok(()) => {
                self.sync_position(channel_id)?;
                self.release_slot(channel_id, owner)?;
                info!(channel_id = %channel_id, protocol_id = %protocol_id, "rollover finalized");
                Ok(())
            }
            Err(e) => self.rollover_failed(task, ctx, protocol_id, e),
        }
    }

    // 8.5.1: terms at the current mid price. the params row is written before the offer.
    fn rollover_offer(&self, channel_id: ChannelId, protocol_id: ProtocolId) -> Result<ProposedTerms, EngineError> {
        let channel = self.load_channel(channel_id)?;
        let contract = channel
            .contract
            .as_ref()
            .ok_or(crate::channel::ChannelError::NoContract(channel_id))?;
        let quote = self.quote(contract.symbol)?;
        let table = self.storage.coordinator_leverages()?;
        let market = RolloverMarket {
            price: quote.mid(),
            funding_rate: quote.funding_rate,
            maintenance_margin_rate: self.settings.margin.maintenance_margin_rate,
            coordinator_leverage: coordinator_leverage_for(&table, contract.trader_leverage),
        };
        let expiry = self.next_expiry();
        let (terms, params) = rollover_terms(
            protocol_id,
            channel_id,
            channel.counterparty.clone(),
            contract,
            &market,
            expiry,
            self.time(),
        );
        self.storage.insert_rollover_params(&params)?;
        self.set_channel_position_state(channel_id, PositionState::Rollover)?;
        info!(
            channel_id = %channel_id,
            protocol_id = %protocol_id,
            expiry = %expiry,
            funding_fee = %params.funding_fee.amount,
            "rollover offered"
        );
        Ok(ProposedTerms::Renew(terms))
    }

    // 8.5.2: timeouts past the bound go to collaborative revert when enabled.
    // any other last failure leaves the channel flagged for manual recovery.
    fn rollover_failed(
        &self,
        task: &BackgroundTask,
        ctx: &TaskContext,
        protocol_id: ProtocolId,
        reason: EngineError,
    ) -> Result<(), EngineError> {
        let channel_id = task.channel_id.ok_or(EngineError::TaskWithoutChannel(task.id))?;
        let owner = task.protocol_id;
        let retry = &self.settings.retry;
        let now = self.time();

        // only unanswered sends count toward escalation, not price or link outages
        let timeouts = if reason.is_timeout() {
            self.update_channel(channel_id, |c| {
                if c.active_negotiation(protocol_id).is_some() {
                    Ok(c.note_timeout(protocol_id)?)
                } else {
                    Ok(0)
                }
            })?
        } else {
            0
        };

        if reason.is_timeout() && retry.escalate_to_collab_revert && timeouts >= retry.escalate_after_timeouts {
            let revert_owner = ProtocolId::new();
            self.update_channel(channel_id, |c| {
                if c.active_negotiation(protocol_id).is_some() {
                    c.rollback_negotiation(protocol_id, now)?;
                }
                c.handover_slot(owner, revert_owner, SlotPurpose::CollaborativeRevert, now)?;
                c.manual_recovery = true;
                Ok(())
            })?;
            self.set_channel_position_state(channel_id, PositionState::Open)?;
            self.supervisor.spawn(
                TaskInput::CollaborativeRevert { price: None },
                Some(channel_id),
                revert_owner,
                self.runner(),
            )?;
            warn!(channel_id = %channel_id, timeouts, "rollover escalated to collaborative revert");
            return Err(EngineError::Escalated { timeouts });
        }

        let last_attempt = !reason.is_retryable() || ctx.attempt >= self.supervisor.retry_policy().max_attempts;
        if last_attempt {
            self.update_channel(channel_id, |c| {
                if c.active_negotiation(protocol_id).is_some() {
                    c.rollback_negotiation(protocol_id, now)?;
                }
                if c.slot_owner() == Some(owner) {
                    c.release_slot(owner, now)?;
                }
                c.manual_recovery = true;
                Ok(())
            })?;
            self.set_channel_position_state(channel_id, PositionState::Open)?;
            error!(channel_id = %channel_id, error = %reason, "rollover failed, channel needs manual recovery");
        }
        Err(reason)
    }
}
