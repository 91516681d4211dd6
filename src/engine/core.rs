// 8.0 engine/core.rs: the engine context. built once at startup, shared by every task.

use super::results::EngineError;
use crate::channel::{Channel, ChannelState};
use crate::collab_revert::CollaborativeRevert;
use crate::config::Settings;
use crate::events::{Event, EventHub, EventId, EventPayload, Subscription, TaskStatus};
use crate::order::{Order, Trade};
use crate::position::Position;
use crate::price_feed::{PriceCache, PriceFeed, PriceSnapshot};
use crate::rollover::{RolloverCalendar, RolloverParams};
use crate::storage::Storage;
use crate::supervisor::{BackgroundTask, RetryPolicy, Supervisor, TaskContext, TaskHandle, TaskInput, TaskRunner};
use crate::transport::{Blockchain, DlcTransport};
use crate::types::{ChannelId, Clock, ContractSymbol, OrderId, PeerId, Price, TaskId, Timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/** 8.1: engine handle. all state lives in storage, the rest is shared plumbing */
#[derive(Clone)]
pub struct Engine {
    pub(super) settings: Arc<Settings>,
    pub(super) storage: Arc<dyn Storage>,
    pub(super) transport: Arc<dyn DlcTransport>,
    pub(super) chain: Arc<dyn Blockchain>,
    pub(super) prices: Arc<PriceCache>,
    pub(super) hub: Arc<EventHub>,
    pub(super) supervisor: Supervisor,
    pub(super) clock: Arc<Clock>,
    pub(super) calendar: RolloverCalendar,
    // slot claims and every read-modify-write of a channel record go through here
    pub(super) channel_guard: Arc<Mutex<()>>,
    pub(super) shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        settings: Settings,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn DlcTransport>,
        chain: Arc<dyn Blockchain>,
    ) -> Result<Self, EngineError> {
        settings.validate()?;

        let hub = Arc::new(EventHub::new(settings.events.broadcast_capacity, settings.events.history_size));
        let clock = Arc::new(Clock::default());
        let prices = Arc::new(PriceCache::new(Arc::clone(&hub), settings.price_feed.max_staleness_secs));
        let supervisor = Supervisor::new(
            Arc::clone(&storage),
            Arc::clone(&hub),
            Arc::clone(&clock),
            RetryPolicy::from_settings(&settings.retry),
        );

        // the table is seeded once; later edits in storage win over the config
        if storage.coordinator_leverages()?.is_empty() {
            storage.set_coordinator_leverages(&settings.coordinator_leverages)?;
        }

        info!(network = ?settings.network, "engine ready");

        Ok(Self {
            calendar: RolloverCalendar::new(settings.network, settings.rollover.test_window_hours),
            settings: Arc::new(settings),
            storage,
            transport,
            chain,
            prices,
            hub,
            supervisor,
            clock,
            channel_guard: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn set_time(&self, timestamp: Timestamp) {
        self.clock.set(timestamp);
    }

    pub fn time(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn advance_time(&self, millis: i64) {
        self.clock.advance(millis);
    }

    pub(super) fn now_utc(&self) -> DateTime<Utc> {
        self.time().to_datetime().unwrap_or_default()
    }

    // expiry for a contract opened or rolled right now
    pub(super) fn next_expiry(&self) -> Timestamp {
        Timestamp::from_datetime(self.calendar.next_expiry(self.now_utc()))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub fn events_since(&self, after: Option<EventId>) -> Vec<Event> {
        self.hub.history_since(after)
    }

    pub fn hub(&self) -> Arc<EventHub> {
        Arc::clone(&self.hub)
    }

    pub(super) fn emit(&self, payload: EventPayload) -> Event {
        self.hub.publish(self.time(), payload)
    }

    /// Quote stamped with the engine clock.
    pub fn submit_price(
        &self,
        symbol: ContractSymbol,
        bid: Price,
        ask: Price,
        funding_rate: Decimal,
    ) -> Result<(), EngineError> {
        self.prices.submit(PriceSnapshot { symbol, bid, ask, funding_rate, timestamp: self.time() })?;
        Ok(())
    }

    pub(super) fn quote(&self, symbol: ContractSymbol) -> Result<PriceSnapshot, EngineError> {
        Ok(self.prices.get(symbol, self.time())?)
    }

    /// Polls `feed` until shutdown and pushes every quote into the cache.
    pub fn follow_price_feed(&self, feed: Arc<dyn PriceFeed>, symbol: ContractSymbol, every: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                match feed.latest(symbol).await {
                    Ok(snapshot) => {
                        if let Err(e) = engine.prices.submit(snapshot) {
                            warn!(symbol = %symbol, error = %e, "dropping quote");
                        }
                    }
                    Err(e) => debug!(symbol = %symbol, error = %e, "price feed has nothing yet"),
                }
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
            }
        })
    }

    // 8.1.1: queries. all read the last persisted snapshot.

    pub fn channel(&self, channel_id: ChannelId) -> Result<Option<Channel>, EngineError> {
        Ok(self.storage.get_channel(channel_id)?)
    }

    pub fn channel_with(&self, trader: &PeerId) -> Result<Option<Channel>, EngineError> {
        Ok(self.storage.open_channel_for(trader)?)
    }

    pub fn position(&self, trader: &PeerId, symbol: ContractSymbol) -> Result<Option<Position>, EngineError> {
        Ok(self.storage.get_position(trader, symbol)?)
    }

    pub fn positions(&self) -> Result<Vec<Position>, EngineError> {
        Ok(self.storage.positions()?)
    }

    pub fn order(&self, order_id: OrderId) -> Result<Option<Order>, EngineError> {
        Ok(self.storage.get_order(order_id)?)
    }

    pub fn orders_for(&self, trader: &PeerId) -> Result<Vec<Order>, EngineError> {
        Ok(self.storage.orders_for(trader)?)
    }

    pub fn trades_for(&self, trader: &PeerId) -> Result<Vec<Trade>, EngineError> {
        Ok(self.storage.trades_for(trader)?)
    }

    pub fn collaborative_revert(&self, channel_id: ChannelId) -> Result<Option<CollaborativeRevert>, EngineError> {
        Ok(self.storage.get_collaborative_revert(channel_id)?)
    }

    pub fn latest_rollover_params(&self, channel_id: ChannelId) -> Result<Option<RolloverParams>, EngineError> {
        Ok(self.storage.latest_rollover_params(channel_id)?)
    }

    pub fn task(&self, task_id: TaskId) -> Result<Option<BackgroundTask>, EngineError> {
        self.supervisor.task(task_id)
    }

    pub fn watch_task(&self, task_id: TaskId) -> Option<TaskHandle> {
        self.supervisor.watch(task_id)
    }

    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        self.supervisor.cancel(task_id)
    }

    /// Waits until the task is done. A task that already finished returns its stored status.
    pub async fn wait_for_task(&self, task_id: TaskId) -> Result<TaskStatus, EngineError> {
        if let Some(handle) = self.supervisor.watch(task_id) {
            let status = handle.wait().await;
            if !status.is_pending() {
                return Ok(status);
            }
        }
        self.supervisor
            .task(task_id)?
            .map(|task| task.status)
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    pub(super) fn load_channel(&self, channel_id: ChannelId) -> Result<Channel, EngineError> {
        self.storage.get_channel(channel_id)?.ok_or(EngineError::ChannelNotFound(channel_id))
    }

    /// Read-modify-write of one channel under the channel guard. Nothing is
    /// persisted when `f` fails. State changes are published.
    pub(super) fn update_channel<R>(
        &self,
        channel_id: ChannelId,
        f: impl FnOnce(&mut Channel) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let _guard = self.channel_guard.lock();
        let mut channel = self.load_channel(channel_id)?;
        let before = (channel.state, channel.subchannel);

        let result = f(&mut channel)?;
        self.storage.upsert_channel(&channel)?;

        if before != (channel.state, channel.subchannel) {
            debug!(
                channel_id = %channel_id,
                state = ?channel.state,
                subchannel = ?channel.subchannel,
                "channel transition"
            );
            self.emit(EventPayload::ChannelStateUpdate {
                channel_id,
                state: channel.state,
                subchannel: channel.subchannel,
            });
        }
        Ok(result)
    }

    pub(super) fn runner(&self) -> Arc<dyn TaskRunner> {
        Arc::new(self.clone())
    }

    // 8.1.2: startup. pending tasks are re-entered first so recovery leaves their slots alone.
    pub fn start(&self) -> Result<Vec<TaskHandle>, EngineError> {
        let mut handles = self.reconcile_pending()?;
        let runner = self.runner();
        handles.push(self.supervisor.spawn(TaskInput::RecoverDlc, None, Default::default(), Arc::clone(&runner))?);
        handles.push(self.supervisor.spawn(TaskInput::FullSync, None, Default::default(), runner)?);
        Ok(handles)
    }

    /// Periodic rollover check until shutdown.
    pub fn spawn_rollover_scheduler(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let every = Duration::from_secs(self.settings.rollover.check_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                match engine.check_rollovers() {
                    Ok(started) if !started.is_empty() => info!(count = started.len(), "rollovers started"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "rollover check failed"),
                }
                match engine.close_expired_positions() {
                    Ok(closing) if !closing.is_empty() => info!(count = closing.len(), "expired positions closing"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "expired position check failed"),
                }
            }
            debug!("rollover scheduler stopped");
        })
    }

    /// Stops background loops and tasks. Unfinished tasks stay pending in storage.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.supervisor.shutdown().await;
    }

    pub(super) fn is_open_channel(channel: &Channel) -> bool {
        matches!(channel.state, ChannelState::Offered | ChannelState::Accepted | ChannelState::Signed)
    }
}

#[async_trait]
impl TaskRunner for Engine {
    async fn run(&self, task: BackgroundTask, ctx: TaskContext) -> Result<(), EngineError> {
        match task.input.clone() {
            TaskInput::Trade { order_id } => self.run_trade(task, order_id, &ctx).await,
            TaskInput::Rollover => self.run_rollover(&task, &ctx).await,
            TaskInput::CollaborativeRevert { price } => self.run_collaborative_revert(&task, price, &ctx).await,
            TaskInput::FullSync => self.run_full_sync().await,
            TaskInput::RecoverDlc => self.run_recover_dlc(),
        }
    }
}
