// 8.6 engine/revert.rs: collaborative revert. the coordinator proposes a split of
// the funding output, the trader signs it, and the persisted record closes the
// channel. a rejected proposal leaves a unilateral close as the only exit.

use super::core::Engine;
use super::results::EngineError;
use crate::channel::{ChannelError, ChannelState, SlotPurpose, SubchannelState};
use crate::collab_revert::{propose_split, CollaborativeRevert, RevertProposal};
use crate::message::{digest, DlcMessage};
use crate::position::PositionState;
use crate::supervisor::{BackgroundTask, TaskContext, TaskHandle, TaskInput};
use crate::types::{ChannelId, ContractSymbol, PeerId, Price, ProtocolId};
use tracing::{error, info, warn};

impl Engine {
    /// Starts a collaborative revert. Without a price the split uses the current mid.
    pub fn request_collaborative_revert(
        &self,
        channel_id: ChannelId,
        price: Option<Price>,
    ) -> Result<TaskHandle, EngineError> {
        let channel = self.load_channel(channel_id)?;
        if !channel.is_signed() {
            return Err(ChannelError::NotSigned(channel_id).into());
        }
        self.supervisor.spawn(
            TaskInput::CollaborativeRevert { price },
            Some(channel_id),
            ProtocolId::new(),
            self.runner(),
        )
    }

    pub(super) async fn run_collaborative_revert(
        &self,
        task: &BackgroundTask,
        price: Option<Price>,
        ctx: &TaskContext,
    ) -> Result<(), EngineError> {
        let channel_id = task.channel_id.ok_or(EngineError::TaskWithoutChannel(task.id))?;
        let owner = task.protocol_id;
        let protocol_id = owner.for_phase(0);

        // the record is the commit point. anything after it is replayed.
        if let Some(record) = self.storage.get_collaborative_revert(channel_id)? {
            return self.complete_revert(channel_id, record.split_txid);
        }

        let now = self.time();
        let channel = self.update_channel(channel_id, |c| {
            c.claim_slot(owner, SlotPurpose::CollaborativeRevert, now)?;
            c.offer_collaborative_close(owner, now)?;
            Ok(c.clone())
        })?;
        let peer = channel.counterparty.clone();

        let proposal = match self.logged_proposal(&peer, protocol_id)? {
            Some(proposal) => proposal,
            None => {
                let price = match price {
                    Some(price) => price,
                    None => {
                        let symbol = channel.contract.as_ref().map(|c| c.symbol).unwrap_or(ContractSymbol::BtcUsd);
                        self.quote(symbol)?.mid()
                    }
                };
                let payout_address = self.chain.new_address().await?;
                let revert = &self.settings.collab_revert;
                propose_split(&channel, price, revert.tx_weight, revert.fee_rate_sats_vb, payout_address)?
            }
        };

        info!(
            channel_id = %channel_id,
            price = %proposal.price,
            trader_amount = %proposal.trader_amount,
            coordinator_amount = %proposal.coordinator_amount,
            fee = %proposal.fee,
            "proposing collaborative revert"
        );

        let message = DlcMessage::CollabRevertPropose { protocol_id, channel_id, proposal: proposal.clone() };
        let reply = match self.send(&peer, message.clone()).await {
            Ok(reply) => reply,
            Err(e) => return self.revert_failed(channel_id, owner, ctx, e),
        };

        match reply {
            // only this protocol's answer reaches the commit point
            DlcMessage::CollabRevertAccept { protocol_id: id, signature, .. } if id == protocol_id => {
                let signed_tx = digest(&(&proposal, &signature));
                let record = CollaborativeRevert {
                    channel_id,
                    counterparty: peer,
                    price: proposal.price,
                    payout_address: proposal.payout_address.clone(),
                    coordinator_amount: proposal.coordinator_amount,
                    trader_amount: proposal.trader_amount,
                    fee: proposal.fee,
                    split_txid: signed_tx.clone(),
                    timestamp: self.time(),
                };
                self.storage.insert_collaborative_revert(&record)?;
                self.complete_revert(channel_id, signed_tx.clone())?;

                match self.chain.broadcast(&signed_tx).await {
                    Ok(txid) => info!(channel_id = %channel_id, txid = %txid, "collaborative revert broadcast"),
                    Err(e) => warn!(channel_id = %channel_id, error = %e, "split broadcast failed, record kept"),
                }
                Ok(())
            }
            DlcMessage::Reject { protocol_id: id, reason, .. } if id == protocol_id => {
                self.force_close(channel_id)?;
                error!(channel_id = %channel_id, reason = %reason, "collaborative revert rejected, channel force closed");
                Err(EngineError::FailedAccept { peer, reason })
            }
            other => self.revert_failed(channel_id, owner, ctx, Self::unexpected(&message, &other)),
        }
    }

    // a proposal already sent for this protocol is resent as is
    fn logged_proposal(&self, peer: &PeerId, protocol_id: ProtocolId) -> Result<Option<RevertProposal>, EngineError> {
        Ok(match self.storage.last_outbound(peer)? {
            Some(last) => match last.message {
                DlcMessage::CollabRevertPropose { protocol_id: sent, proposal, .. } if sent == protocol_id => Some(proposal),
                _ => None,
            },
            None => None,
        })
    }

    // idempotent: close the channel with the split and drop its positions
    pub(super) fn complete_revert(&self, channel_id: ChannelId, split_txid: String) -> Result<(), EngineError> {
        let now = self.time();
        self.update_channel(channel_id, |c| {
            if c.state != ChannelState::CollaborativelyClosed {
                c.record_collaborative_close(split_txid, now)?;
            }
            Ok(())
        })?;
        self.remove_channel_positions(channel_id)?;
        info!(channel_id = %channel_id, "channel collaboratively reverted");
        Ok(())
    }

    // 8.6.1: on the last attempt the close offer is withdrawn and the slot given back
    fn revert_failed(
        &self,
        channel_id: ChannelId,
        owner: ProtocolId,
        ctx: &TaskContext,
        reason: EngineError,
    ) -> Result<(), EngineError> {
        let last_attempt = !reason.is_retryable() || ctx.attempt >= self.supervisor.retry_policy().max_attempts;
        if last_attempt {
            let now = self.time();
            self.update_channel(channel_id, |c| {
                if c.subchannel == Some(SubchannelState::CollaborativeCloseOffered) {
                    c.withdraw_collaborative_close(now)?;
                }
                if c.slot_owner() == Some(owner) {
                    c.release_slot(owner, now)?;
                }
                c.manual_recovery = true;
                Ok(())
            })?;
            self.set_channel_position_state(channel_id, PositionState::Open)?;
            error!(channel_id = %channel_id, error = %reason, "collaborative revert gave up");
        }
        Err(reason)
    }
}
