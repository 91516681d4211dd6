//! Peer protocol driver.
//!
//! Every step re-reads the persisted channel and acts on its state, so the same
//! call finishes a fresh negotiation, resumes one interrupted by a timeout, and
//! is a no-op for one that already finalized. A stalled step is retried by
//! resending the logged outbound message, never by restarting the offer.

use super::core::Engine;
use super::results::EngineError;
use crate::channel::{ChannelError, ChannelReserves, ChannelState, ProposedTerms, SubchannelState};
use crate::events::{EventPayload, Service, ServiceStatus};
use crate::message::{DlcMessage, RejectKind};
use crate::position::PositionState;
use crate::storage::{LastOutboundMessage, MessageDirection, StoredDlcMessage};
use crate::transport::{with_deadline, TransportError};
use crate::types::{ChannelId, PeerId, ProtocolId};
use std::time::Duration;
use tracing::{debug, info, warn};

impl Engine {
    // 8.2: log, send, wait for the reply within the negotiation deadline
    pub(super) async fn send(&self, peer: &PeerId, message: DlcMessage) -> Result<DlcMessage, EngineError> {
        let now = self.time();
        let sent = message.kind();
        self.storage
            .record_dlc_message(&StoredDlcMessage::new(peer.clone(), MessageDirection::Outbound, &message, now))?;
        self.storage.upsert_last_outbound(&LastOutboundMessage {
            peer: peer.clone(),
            message: message.clone(),
            timestamp: now,
        })?;

        if !self.transport.is_connected(peer) {
            self.hub
                .report_health(now, Service::Transport, ServiceStatus::Offline, Some(format!("{peer} not connected")));
            return Err(TransportError::Disconnected(peer.clone()).into());
        }

        let deadline = Duration::from_millis(self.settings.negotiation.timeout_ms);
        let protocol_id = message.protocol_id();
        debug!(peer = %peer, protocol_id = %protocol_id, message = ?sent, "sending");

        match with_deadline(peer, deadline, self.transport.request(peer, message)).await {
            Ok(reply) => {
                let now = self.time();
                let fresh = self
                    .storage
                    .record_dlc_message(&StoredDlcMessage::new(peer.clone(), MessageDirection::Inbound, &reply, now))?;
                if !fresh {
                    debug!(peer = %peer, message = ?reply.kind(), "duplicate inbound message");
                }
                self.hub.report_health(now, Service::Transport, ServiceStatus::Online, None);
                Ok(reply)
            }
            Err(e) => {
                let status = match e {
                    TransportError::Timeout { .. } => ServiceStatus::Degraded,
                    _ => ServiceStatus::Offline,
                };
                self.hub.report_health(self.time(), Service::Transport, status, Some(e.to_string()));
                warn!(peer = %peer, protocol_id = %protocol_id, error = %e, "no reply");
                Err(e.into())
            }
        }
    }

    // the logged message if it is the same step of the same protocol, else `fresh`
    fn resend_or(&self, peer: &PeerId, fresh: DlcMessage) -> Result<DlcMessage, EngineError> {
        match self.storage.last_outbound(peer)? {
            Some(last) if last.message.protocol_id() == fresh.protocol_id() && last.message.kind() == fresh.kind() => {
                debug!(peer = %peer, protocol_id = %fresh.protocol_id(), "resending last outbound message");
                Ok(last.message)
            }
            _ => Ok(fresh),
        }
    }

    pub(super) fn unexpected(sent: &DlcMessage, got: &DlcMessage) -> EngineError {
        EngineError::UnexpectedMessage { sent: sent.kind(), got: got.kind() }
    }

    // 8.2.1: offer -> accept -> funding -> sign. the slot owner doubles as the protocol id.
    pub(super) async fn open_channel(&self, channel_id: ChannelId, owner: ProtocolId) -> Result<(), EngineError> {
        loop {
            let channel = self.load_channel(channel_id)?;
            let peer = channel.counterparty.clone();
            match channel.state {
                ChannelState::Signed => return Ok(()),
                ChannelState::Offered => {
                    let offer = self.resend_or(
                        &peer,
                        DlcMessage::ChannelOffer {
                            protocol_id: owner,
                            channel_id,
                            reserves: ChannelReserves {
                                trader: channel.trader_reserve,
                                coordinator: channel.coordinator_reserve,
                            },
                            fee_rate_sats_vb: channel.fee_rate_sats_vb,
                        },
                    )?;
                    let reply = self.send(&peer, offer.clone()).await?;
                    match reply {
                        DlcMessage::ChannelAccept { protocol_id, .. } if protocol_id == owner => {
                            let now = self.time();
                            self.update_channel(channel_id, |c| Ok(c.on_channel_accepted(now)?))?;
                            info!(channel_id = %channel_id, peer = %peer, "channel accepted");
                        }
                        DlcMessage::Reject { reason, .. } => {
                            let now = self.time();
                            self.update_channel(channel_id, |c| Ok(c.fail_accept(now)?))?;
                            warn!(channel_id = %channel_id, peer = %peer, reason = %reason, "channel offer rejected");
                            return Err(EngineError::FailedAccept { peer, reason });
                        }
                        other => return Err(Self::unexpected(&offer, &other)),
                    }
                }
                ChannelState::Accepted => {
                    let funding = match channel.funding.clone() {
                        Some(funding) => funding,
                        None => {
                            let funding = self.chain.publish_funding(channel_id, channel.value()).await?;
                            let recorded = funding.clone();
                            self.update_channel(channel_id, |c| {
                                c.funding = Some(recorded);
                                Ok(())
                            })?;
                            info!(channel_id = %channel_id, funding = %funding, "funding published");
                            funding
                        }
                    };
                    let sign = self.resend_or(
                        &peer,
                        DlcMessage::ChannelSign { protocol_id: owner, channel_id, funding: funding.clone() },
                    )?;
                    let reply = self.send(&peer, sign.clone()).await?;
                    match reply {
                        DlcMessage::ChannelSignAck { protocol_id, .. } if protocol_id == owner => {
                            let now = self.time();
                            self.update_channel(channel_id, |c| Ok(c.on_channel_signed(funding, now)?))?;
                            info!(channel_id = %channel_id, peer = %peer, "channel signed");
                        }
                        DlcMessage::Reject { reason, .. } => {
                            let now = self.time();
                            self.update_channel(channel_id, |c| Ok(c.fail_sign(now)?))?;
                            warn!(channel_id = %channel_id, peer = %peer, reason = %reason, "channel sign rejected");
                            return Err(EngineError::FailedSign { peer, reason });
                        }
                        other => return Err(Self::unexpected(&sign, &other)),
                    }
                }
                state => {
                    return Err(ChannelError::InvalidTransition { from: state, to: ChannelState::Signed }.into());
                }
            }
        }
    }

    // 8.2.2: renew or settle as `protocol_id`, with the slot held by `owner`.
    // resume-aware: picks up from whatever step the channel record is in.
    pub(super) async fn drive_negotiation(
        &self,
        channel_id: ChannelId,
        owner: ProtocolId,
        protocol_id: ProtocolId,
        terms: ProposedTerms,
    ) -> Result<(), EngineError> {
        let settle = terms.is_settle();
        loop {
            let channel = self.load_channel(channel_id)?;
            if channel.last_finalized == Some(protocol_id) {
                return Ok(());
            }
            let peer = channel.counterparty.clone();

            if channel.active_negotiation(protocol_id).is_none() {
                let now = self.time();
                let offered = terms.clone();
                self.update_channel(channel_id, |c| Ok(c.begin_negotiation(owner, protocol_id, offered, now)?))?;
                info!(channel_id = %channel_id, protocol_id = %protocol_id, settle, "negotiation started");
                continue;
            }

            match channel.subchannel {
                Some(SubchannelState::RenewOffered | SubchannelState::SettledOffered) => {
                    let offer = self.resend_or(&peer, DlcMessage::offer(protocol_id, channel_id, terms.clone()))?;
                    self.update_channel(channel_id, |c| Ok(c.note_attempt(protocol_id)?))?;
                    let reply = self.send(&peer, offer.clone()).await?;
                    match reply {
                        DlcMessage::RenewAccept { protocol_id: id, .. } | DlcMessage::SettleAccept { protocol_id: id, .. }
                            if id == protocol_id =>
                        {
                            let now = self.time();
                            self.update_channel(channel_id, |c| Ok(c.on_accept(protocol_id, now)?))?;
                        }
                        DlcMessage::Reject { kind, reason, .. } => {
                            self.abort_negotiation(channel_id, protocol_id)?;
                            warn!(channel_id = %channel_id, protocol_id = %protocol_id, reason = %reason, "offer rejected");
                            return Err(match kind {
                                RejectKind::InvalidSignature => EngineError::SignatureRejected { peer, reason },
                                RejectKind::Declined => EngineError::FailedAccept { peer, reason },
                            });
                        }
                        other => return Err(Self::unexpected(&offer, &other)),
                    }
                }
                Some(SubchannelState::RenewAccepted | SubchannelState::SettledAccepted) => {
                    // confirmed is persisted before the confirm goes out
                    let now = self.time();
                    self.update_channel(channel_id, |c| Ok(c.on_confirm(protocol_id, now)?))?;
                }
                Some(SubchannelState::RenewConfirmed | SubchannelState::SettledConfirmed) => {
                    let confirm = self.resend_or(&peer, DlcMessage::confirm(protocol_id, channel_id, settle))?;
                    self.update_channel(channel_id, |c| Ok(c.note_attempt(protocol_id)?))?;
                    let reply = self.send(&peer, confirm.clone()).await?;
                    match reply {
                        DlcMessage::RenewFinalize { protocol_id: id, .. }
                        | DlcMessage::SettleFinalize { protocol_id: id, .. }
                            if id == protocol_id =>
                        {
                            let now = self.time();
                            self.update_channel(channel_id, |c| {
                                c.finalize(protocol_id, now)?;
                                Ok(())
                            })?;
                            info!(channel_id = %channel_id, protocol_id = %protocol_id, settle, "negotiation finalized");
                            return Ok(());
                        }
                        DlcMessage::Reject { reason, .. } => {
                            self.abort_negotiation(channel_id, protocol_id)?;
                            warn!(channel_id = %channel_id, protocol_id = %protocol_id, reason = %reason, "confirm rejected");
                            return Err(EngineError::FailedSign { peer, reason });
                        }
                        other => return Err(Self::unexpected(&confirm, &other)),
                    }
                }
                other => {
                    return Err(ChannelError::InvalidSubchannelTransition {
                        from: other,
                        to: if settle { SubchannelState::Settled } else { SubchannelState::Established },
                    }
                    .into());
                }
            }
        }
    }

    /// Rolls an in-flight negotiation back to the last confirmed state. The slot stays held.
    pub(super) fn abort_negotiation(&self, channel_id: ChannelId, protocol_id: ProtocolId) -> Result<(), EngineError> {
        let now = self.time();
        self.update_channel(channel_id, |c| {
            if c.active_negotiation(protocol_id).is_some() {
                c.rollback_negotiation(protocol_id, now)?;
            }
            Ok(())
        })
    }

    /// Drops the slot if `owner` still holds it.
    pub(super) fn release_slot(&self, channel_id: ChannelId, owner: ProtocolId) -> Result<(), EngineError> {
        let now = self.time();
        self.update_channel(channel_id, |c| {
            if c.slot_owner() == Some(owner) {
                c.release_slot(owner, now)?;
            }
            Ok(())
        })
    }

    // 8.2.3: unilateral exit. reported, the close itself is not orchestrated here.
    pub fn force_close(&self, channel_id: ChannelId) -> Result<(), EngineError> {
        let now = self.time();
        self.update_channel(channel_id, |c| Ok(c.force_close(now)?))?;
        self.set_channel_position_state(channel_id, PositionState::Closing)?;
        warn!(channel_id = %channel_id, "channel force closed");
        Ok(())
    }

    pub fn mark_closed(&self, channel_id: ChannelId, final_state: ChannelState) -> Result<(), EngineError> {
        let now = self.time();
        self.update_channel(channel_id, |c| {
            if final_state == ChannelState::Closed && c.state == ChannelState::Signed {
                c.force_close(now)?;
            }
            Ok(c.mark_closed(final_state, now)?)
        })?;
        self.remove_channel_positions(channel_id)?;
        info!(channel_id = %channel_id, state = ?final_state, "channel closed");
        Ok(())
    }

    pub(super) fn publish_channel(&self, channel_id: ChannelId) -> Result<(), EngineError> {
        let channel = self.load_channel(channel_id)?;
        self.emit(EventPayload::ChannelStateUpdate {
            channel_id,
            state: channel.state,
            subchannel: channel.subchannel,
        });
        Ok(())
    }
}
