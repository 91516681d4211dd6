// 11.0: every state change produces an event. consumers are external (app, push,
// dashboards) and must be idempotent: delivery is at-least-once per transition.
// the EventPayload enum lists all event types.
//
// 11.1 EventHub fans events out over a tokio broadcast channel and keeps a bounded
// history. a subscriber that lags replays from the history instead of losing events.

use crate::channel::{ChannelState, SubchannelState};
use crate::order::Order;
use crate::position::Position;
use crate::types::{ChannelId, ContractSymbol, PeerId, Price, TaskId, Timestamp};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self { id, timestamp, payload }
    }

    /// Channel the event belongs to, if any. Ordering holds per channel.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match &self.payload {
            EventPayload::PositionUpdate(p) => Some(p.channel_id),
            EventPayload::PositionClosed { channel_id, .. } => Some(*channel_id),
            EventPayload::BackgroundTask(t) => t.channel_id,
            EventPayload::ChannelStateUpdate { channel_id, .. } => Some(*channel_id),
            EventPayload::RolloverRequired { channel_id, .. } => Some(*channel_id),
            EventPayload::OrderUpdate(_) | EventPayload::ServiceHealth { .. } | EventPayload::PriceUpdate { .. } => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Rollover,
    AsyncTrade,
    CollaborativeRevert,
    FullSync,
    RecoverDlc,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Rollover => "rollover",
            TaskKind::AsyncTrade => "async_trade",
            TaskKind::CollaborativeRevert => "collaborative_revert",
            TaskKind::FullSync => "full_sync",
            TaskKind::RecoverDlc => "recover_dlc",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Success,
    Failed(String),
}

impl TaskStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub channel_id: Option<ChannelId>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    PriceFeed,
    Transport,
    Chain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Online,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    // Trade events
    OrderUpdate(Order),
    PositionUpdate(Position),
    PositionClosed {
        trader: PeerId,
        symbol: ContractSymbol,
        channel_id: ChannelId,
    },

    // Channel events
    ChannelStateUpdate {
        channel_id: ChannelId,
        state: ChannelState,
        subchannel: Option<SubchannelState>,
    },
    RolloverRequired {
        channel_id: ChannelId,
        expiry: Timestamp,
    },

    // Supervisor events
    BackgroundTask(TaskUpdate),

    // Service events
    ServiceHealth {
        service: Service,
        status: ServiceStatus,
        detail: Option<String>,
    },
    PriceUpdate {
        symbol: ContractSymbol,
        bid: Price,
        ask: Price,
        funding_rate: Decimal,
    },
}

struct HubState {
    next_id: u64,
    history: VecDeque<Event>,
    health: HashMap<Service, ServiceStatus>,
}

/** 11.2: publisher. cloneable through Arc, cheap to share with every component */
pub struct EventHub {
    sender: broadcast::Sender<Event>,
    state: Arc<Mutex<HubState>>,
    history_size: usize,
}

impl EventHub {
    pub fn new(capacity: usize, history_size: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            state: Arc::new(Mutex::new(HubState {
                next_id: 1,
                history: VecDeque::with_capacity(history_size),
                health: HashMap::new(),
            })),
            history_size,
        }
    }

    // ids are handed out and sent under the lock so history and channel agree on order
    pub fn publish(&self, timestamp: Timestamp, payload: EventPayload) -> Event {
        let mut state = self.state.lock();
        let event = Event::new(EventId(state.next_id), timestamp, payload);
        state.next_id += 1;
        if self.history_size > 0 {
            if state.history.len() == self.history_size {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }
        // no receivers is fine, the history still has it
        let _ = self.sender.send(event.clone());
        tracing::trace!(event_id = event.id.0, "event published");
        event
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            state: Arc::clone(&self.state),
            last_seen: None,
            backlog: VecDeque::new(),
        }
    }

    /// Events with id greater than `after`, oldest first.
    pub fn history_since(&self, after: Option<EventId>) -> Vec<Event> {
        let state = self.state.lock();
        state
            .history
            .iter()
            .filter(|e| after.map_or(true, |after| e.id > after))
            .cloned()
            .collect()
    }

    // 11.3: only status changes are published
    pub fn report_health(&self, timestamp: Timestamp, service: Service, status: ServiceStatus, detail: Option<String>) {
        let changed = {
            let mut state = self.state.lock();
            state.health.insert(service, status) != Some(status)
        };
        if changed {
            tracing::info!(?service, ?status, detail = detail.as_deref().unwrap_or(""), "service health changed");
            self.publish(timestamp, EventPayload::ServiceHealth { service, status, detail });
        }
    }

    pub fn health(&self, service: Service) -> Option<ServiceStatus> {
        self.state.lock().health.get(&service).copied()
    }
}

/// Handle returned by `EventHub::subscribe`. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    state: Arc<Mutex<HubState>>,
    last_seen: Option<EventId>,
    backlog: VecDeque<Event>,
}

impl Subscription {
    fn accept(&mut self, event: Event) -> Option<Event> {
        if self.last_seen.is_some_and(|seen| event.id <= seen) {
            return None;
        }
        self.last_seen = Some(event.id);
        Some(event)
    }

    fn replay(&mut self) {
        let last_seen = self.last_seen;
        let state = self.state.lock();
        self.backlog = state
            .history
            .iter()
            .filter(|e| last_seen.map_or(true, |seen| e.id > seen))
            .cloned()
            .collect();
    }

    /// Next event, or None once the hub is gone. Cancellation safe: an event is
    /// only marked seen when it is returned.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if let Some(event) = self.accept(event) {
                    return Some(event);
                }
                continue;
            }
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged, replaying from history");
                    self.replay();
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant for tests and polling consumers.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if let Some(event) = self.accept(event) {
                    return Some(event);
                }
                continue;
            }
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => self.replay(),
                Err(_) => return None,
            }
        }
    }

    pub fn last_seen(&self) -> Option<EventId> {
        self.last_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_event(hub: &EventHub, n: i64) -> Event {
        hub.publish(
            Timestamp::from_millis(n),
            EventPayload::RolloverRequired { channel_id: ChannelId::new(), expiry: Timestamp::from_millis(n) },
        )
    }

    #[test]
    fn ids_are_increasing() {
        let hub = EventHub::new(8, 8);
        let a = price_event(&hub, 1);
        let b = price_event(&hub, 2);
        assert!(b.id > a.id);
    }

    #[test]
    fn history_is_bounded() {
        let hub = EventHub::new(8, 3);
        for n in 0..5 {
            price_event(&hub, n);
        }
        let history = hub.history_since(None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, EventId(3));
    }

    #[test]
    fn lagged_subscriber_replays_from_history() {
        let hub = EventHub::new(2, 16);
        let mut sub = hub.subscribe();
        for n in 0..6 {
            price_event(&hub, n);
        }
        let mut ids = Vec::new();
        while let Some(event) = sub.try_recv() {
            ids.push(event.id.0);
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn health_is_only_published_on_change() {
        let hub = EventHub::new(8, 8);
        let now = Timestamp::from_millis(1);
        hub.report_health(now, Service::PriceFeed, ServiceStatus::Online, None);
        hub.report_health(now, Service::PriceFeed, ServiceStatus::Online, None);
        hub.report_health(now, Service::PriceFeed, ServiceStatus::Degraded, Some("stale".into()));
        assert_eq!(hub.history_since(None).len(), 2);
        assert_eq!(hub.health(Service::PriceFeed), Some(ServiceStatus::Degraded));
    }

    #[tokio::test]
    async fn recv_delivers_in_order() {
        let hub = EventHub::new(8, 8);
        let mut sub = hub.subscribe();
        price_event(&hub, 1);
        price_event(&hub, 2);
        assert_eq!(sub.recv().await.map(|e| e.id), Some(EventId(1)));
        assert_eq!(sub.recv().await.map(|e| e.id), Some(EventId(2)));
    }
}
