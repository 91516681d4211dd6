// 8.7 engine/recovery.rs: restart reconciliation, dlc recovery and chain sync.
//
// on start every pending task is looked at once. work that already landed is
// marked done, work that still owns its channel is resumed, and a trade that
// never got its slot is failed. RecoverDlc then frees channels whose slot owner
// is gone, and FullSync folds on-chain closes into the channel records.

use super::core::Engine;
use super::results::EngineError;
use crate::channel::{ChannelState, SubchannelState};
use crate::events::{Service, ServiceStatus, TaskStatus};
use crate::order::OrderState;
use crate::supervisor::{BackgroundTask, TaskHandle, TaskInput};
use crate::transport::SpendKind;
use crate::types::PeerId;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// What reconciliation decided for one stored task.
#[derive(Debug)]
enum Verdict {
    Done(TaskStatus),
    Resume,
    Skip,
}

impl Engine {
    pub(super) fn reconcile_pending(&self) -> Result<Vec<TaskHandle>, EngineError> {
        let mut resumed = Vec::new();
        for task in self.storage.pending_tasks()? {
            let verdict = match self.reconcile(&task) {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(task = %task.kind, task_id = %task.id, error = %e, "could not reconcile task");
                    Verdict::Done(TaskStatus::Failed(e.to_string()))
                }
            };
            debug!(task = %task.kind, task_id = %task.id, verdict = ?verdict, "reconciled");
            match verdict {
                Verdict::Done(status) => self.supervisor.settle_task(task.id, status)?,
                Verdict::Resume => resumed.push(self.supervisor.resume(task, self.runner())),
                Verdict::Skip => {}
            }
        }
        if !resumed.is_empty() {
            info!(count = resumed.len(), "resumed pending tasks");
        }
        Ok(resumed)
    }

    fn reconcile(&self, task: &BackgroundTask) -> Result<Verdict, EngineError> {
        match (&task.input, task.channel_id) {
            (TaskInput::Trade { order_id }, Some(channel_id)) => {
                let order = self.storage.get_order(*order_id)?.ok_or(EngineError::OrderNotFound(*order_id))?;
                let channel = self.load_channel(channel_id)?;
                if order.state == OrderState::Filled {
                    return Ok(Verdict::Done(TaskStatus::Success));
                }
                if order.state.is_terminal() {
                    let detail = order.failure.clone().unwrap_or_else(|| format!("order {:?}", order.state));
                    return Ok(Verdict::Done(TaskStatus::Failed(detail)));
                }
                if channel.slot_owner() == Some(task.protocol_id) {
                    return Ok(Verdict::Resume);
                }
                // the slot is gone, so nothing of this trade can still be in flight
                let reason = EngineError::Cancelled;
                self.abandon_trade(task, order, channel_id, &reason)?;
                let detail = self
                    .storage
                    .get_order(*order_id)?
                    .and_then(|o| o.failure)
                    .unwrap_or_else(|| reason.to_string());
                Ok(Verdict::Done(TaskStatus::Failed(detail)))
            }
            (TaskInput::Rollover, Some(channel_id)) => {
                let channel = self.load_channel(channel_id)?;
                if channel.last_finalized == Some(task.protocol_id.for_phase(0)) {
                    self.sync_position(channel_id)?;
                    self.release_slot(channel_id, task.protocol_id)?;
                    return Ok(Verdict::Done(TaskStatus::Success));
                }
                Ok(Verdict::Resume)
            }
            (TaskInput::CollaborativeRevert { .. }, Some(channel_id)) => {
                if let Some(record) = self.storage.get_collaborative_revert(channel_id)? {
                    self.complete_revert(channel_id, record.split_txid)?;
                    return Ok(Verdict::Done(TaskStatus::Success));
                }
                Ok(Verdict::Resume)
            }
            // picked up by start() through the supervisor's dedup
            (TaskInput::FullSync | TaskInput::RecoverDlc, _) => Ok(Verdict::Skip),
            (_, None) => Err(EngineError::TaskWithoutChannel(task.id)),
        }
    }

    // 8.7.1: channels whose slot owner has no pending task. unsigned ones are
    // cancelled, signed ones go back to their last confirmed state.
    pub(super) fn run_recover_dlc(&self) -> Result<(), EngineError> {
        let now = self.time();
        let mut recovered = 0usize;

        for channel in self.storage.channels()? {
            if !Self::is_open_channel(&channel) || (channel.slot.is_none() && channel.negotiation.is_none()) {
                continue;
            }
            let channel_id = channel.channel_id;
            let has_revert = self.storage.get_collaborative_revert(channel_id)?.is_some();

            let touched = self.update_channel(channel_id, |c| {
                // read under the guard so a task spawned meanwhile is seen
                let owners: HashSet<_> = self
                    .storage
                    .pending_tasks()?
                    .into_iter()
                    .filter(|t| t.channel_id == Some(channel_id))
                    .map(|t| t.protocol_id)
                    .collect();
                if c.slot_owner().is_some_and(|owner| owners.contains(&owner)) {
                    return Ok(false);
                }

                match c.state {
                    ChannelState::Offered | ChannelState::Accepted => c.cancel(now)?,
                    ChannelState::Signed => {
                        if let Some(protocol_id) = c.negotiation.as_ref().map(|n| n.protocol_id) {
                            c.rollback_negotiation(protocol_id, now)?;
                        }
                        if c.subchannel == Some(SubchannelState::CollaborativeCloseOffered) && !has_revert {
                            c.withdraw_collaborative_close(now)?;
                        }
                        if let Some(owner) = c.slot_owner() {
                            c.release_slot(owner, now)?;
                        }
                    }
                    _ => return Ok(false),
                }
                Ok(true)
            })?;

            if touched {
                self.sync_position(channel_id)?;
                self.fail_orphaned_orders(&channel.counterparty)?;
                warn!(channel_id = %channel_id, "recovered channel left behind by a lost task");
                recovered += 1;
            }
        }

        info!(recovered, "dlc recovery done");
        Ok(())
    }

    // orders still Filling after their trade task ended, e.g. a cancelled one
    fn fail_orphaned_orders(&self, trader: &PeerId) -> Result<(), EngineError> {
        let live: HashSet<_> = self
            .storage
            .pending_tasks()?
            .into_iter()
            .filter_map(|t| match t.input {
                TaskInput::Trade { order_id } => Some(order_id),
                _ => None,
            })
            .collect();
        for mut order in self.storage.orders_for(trader)? {
            if order.state != OrderState::Filling || live.contains(&order.id) {
                continue;
            }
            order.fail("trade task ended before the order filled", self.time())?;
            self.save_order(&order)?;
            warn!(order_id = %order.id, trader = %trader, "failed orphaned order");
        }
        Ok(())
    }

    // 8.7.2: spent funding outputs close their channels
    pub(super) async fn run_full_sync(&self) -> Result<(), EngineError> {
        let snapshot = match self.chain.sync().await {
            Ok(snapshot) => {
                self.hub.report_health(self.time(), Service::Chain, ServiceStatus::Online, None);
                snapshot
            }
            Err(e) => {
                self.hub
                    .report_health(self.time(), Service::Chain, ServiceStatus::Offline, Some(e.to_string()));
                return Err(e.into());
            }
        };

        let mut closed = 0usize;
        for channel in self.storage.channels()? {
            if !matches!(channel.state, ChannelState::Signed | ChannelState::Closing) {
                continue;
            }
            let Some(kind) = channel.funding.as_ref().and_then(|f| snapshot.spent.get(f)) else {
                continue;
            };
            let final_state = match kind {
                SpendKind::Counterparty => ChannelState::CounterClosed,
                SpendKind::Punish => ChannelState::ClosedPunished,
                SpendKind::Own => ChannelState::Closed,
            };
            self.mark_closed(channel.channel_id, final_state)?;
            closed += 1;
        }

        info!(height = snapshot.height, closed, "chain sync done");
        Ok(())
    }
}
