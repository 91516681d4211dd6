// 10.0 storage.rs: persisted tables. one sync trait over all of them so the engine
// can run against memory in tests and a json snapshot file in the simulator.
//
// 10.1 every write is all-or-nothing. the file store applies the change to a copy,
// writes it to a temp file, renames it over the snapshot, then swaps it in.

use crate::channel::Channel;
use crate::collab_revert::CollaborativeRevert;
use crate::margin::CoordinatorLeverage;
use crate::message::{DlcMessage, MessageKind};
use crate::order::{Order, Trade, UnfundedOrder};
use crate::position::Position;
use crate::rollover::RolloverParams;
use crate::supervisor::BackgroundTask;
use crate::types::{ChannelId, ContractSymbol, OrderId, PeerId, ProtocolId, TaskId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("{table} already holds {key}")]
    Duplicate { table: &'static str, key: String },

    #[error("{table} has no row {key}")]
    NotFound { table: &'static str, key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

/// Row of `dlc_messages`. Keyed by the message hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDlcMessage {
    pub hash: String,
    pub peer: PeerId,
    pub direction: MessageDirection,
    pub kind: MessageKind,
    pub protocol_id: ProtocolId,
    pub channel_id: ChannelId,
    pub timestamp: Timestamp,
}

impl StoredDlcMessage {
    pub fn new(peer: PeerId, direction: MessageDirection, message: &DlcMessage, timestamp: Timestamp) -> Self {
        Self {
            hash: message.hash(),
            peer,
            direction,
            kind: message.kind(),
            protocol_id: message.protocol_id(),
            channel_id: message.channel_id(),
            timestamp,
        }
    }
}

/// Row of `last_outbound_dlc_messages`. One per peer, replaced on every send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOutboundMessage {
    pub peer: PeerId,
    pub message: DlcMessage,
    pub timestamp: Timestamp,
}

pub trait Storage: Send + Sync {
    fn upsert_position(&self, position: &Position) -> Result<(), StorageError>;
    fn get_position(&self, trader: &PeerId, symbol: ContractSymbol) -> Result<Option<Position>, StorageError>;
    fn delete_position(&self, trader: &PeerId, symbol: ContractSymbol) -> Result<Option<Position>, StorageError>;
    fn positions(&self) -> Result<Vec<Position>, StorageError>;

    fn upsert_order(&self, order: &Order) -> Result<(), StorageError>;
    fn get_order(&self, id: OrderId) -> Result<Option<Order>, StorageError>;
    fn orders_for(&self, trader: &PeerId) -> Result<Vec<Order>, StorageError>;

    fn insert_trade(&self, trade: &Trade) -> Result<(), StorageError>;
    fn trades_for(&self, trader: &PeerId) -> Result<Vec<Trade>, StorageError>;

    /// Fails with `Duplicate` if the channel already has a revert recorded.
    fn insert_collaborative_revert(&self, revert: &CollaborativeRevert) -> Result<(), StorageError>;
    fn get_collaborative_revert(&self, channel_id: ChannelId) -> Result<Option<CollaborativeRevert>, StorageError>;

    fn insert_rollover_params(&self, params: &RolloverParams) -> Result<(), StorageError>;
    fn latest_rollover_params(&self, channel_id: ChannelId) -> Result<Option<RolloverParams>, StorageError>;

    /// Returns false when a message with the same hash was already recorded.
    fn record_dlc_message(&self, message: &StoredDlcMessage) -> Result<bool, StorageError>;
    fn upsert_last_outbound(&self, outbound: &LastOutboundMessage) -> Result<(), StorageError>;
    fn last_outbound(&self, peer: &PeerId) -> Result<Option<LastOutboundMessage>, StorageError>;

    fn set_coordinator_leverages(&self, rows: &[CoordinatorLeverage]) -> Result<(), StorageError>;
    fn coordinator_leverages(&self) -> Result<Vec<CoordinatorLeverage>, StorageError>;

    fn upsert_channel(&self, channel: &Channel) -> Result<(), StorageError>;
    fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>, StorageError>;
    fn channels(&self) -> Result<Vec<Channel>, StorageError>;

    fn upsert_task(&self, task: &BackgroundTask) -> Result<(), StorageError>;
    fn get_task(&self, id: TaskId) -> Result<Option<BackgroundTask>, StorageError>;
    fn tasks(&self) -> Result<Vec<BackgroundTask>, StorageError>;

    fn insert_unfunded_order(&self, order: &UnfundedOrder) -> Result<(), StorageError>;
    fn get_unfunded_order(&self, id: OrderId) -> Result<Option<UnfundedOrder>, StorageError>;
    fn remove_unfunded_order(&self, id: OrderId) -> Result<Option<UnfundedOrder>, StorageError>;

    /// Newest channel with `peer` that has not reached a terminal state.
    fn open_channel_for(&self, peer: &PeerId) -> Result<Option<Channel>, StorageError> {
        Ok(self
            .channels()?
            .into_iter()
            .filter(|c| &c.counterparty == peer && c.is_open())
            .max_by_key(|c| c.created_at))
    }

    fn pending_tasks(&self) -> Result<Vec<BackgroundTask>, StorageError> {
        Ok(self.tasks()?.into_iter().filter(|t| t.status.is_pending()).collect())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    positions: Vec<Position>,
    orders: BTreeMap<OrderId, Order>,
    trades: Vec<Trade>,
    collaborative_reverts: BTreeMap<ChannelId, CollaborativeRevert>,
    rollover_params: Vec<RolloverParams>,
    dlc_messages: BTreeMap<String, StoredDlcMessage>,
    last_outbound_dlc_messages: BTreeMap<PeerId, LastOutboundMessage>,
    coordinator_leverages: Vec<CoordinatorLeverage>,
    channels: BTreeMap<ChannelId, Channel>,
    background_tasks: BTreeMap<TaskId, BackgroundTask>,
    unfunded_orders: BTreeMap<OrderId, UnfundedOrder>,
}

impl Tables {
    fn position_index(&self, trader: &PeerId, symbol: ContractSymbol) -> Option<usize> {
        self.positions
            .iter()
            .position(|p| &p.trader == trader && p.symbol == symbol)
    }
}

trait TableAccess {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R;
    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R, StorageError>) -> Result<R, StorageError>;
}

// both stores share one implementation over TableAccess
macro_rules! impl_storage {
    ($store:ty) => {
        impl Storage for $store {
            fn upsert_position(&self, position: &Position) -> Result<(), StorageError> {
                self.write(|t| {
                    match t.position_index(&position.trader, position.symbol) {
                        Some(i) => t.positions[i] = position.clone(),
                        None => t.positions.push(position.clone()),
                    }
                    Ok(())
                })
            }

            fn get_position(&self, trader: &PeerId, symbol: ContractSymbol) -> Result<Option<Position>, StorageError> {
                Ok(self.read(|t| t.position_index(trader, symbol).map(|i| t.positions[i].clone())))
            }

            fn delete_position(&self, trader: &PeerId, symbol: ContractSymbol) -> Result<Option<Position>, StorageError> {
                self.write(|t| Ok(t.position_index(trader, symbol).map(|i| t.positions.remove(i))))
            }

            fn positions(&self) -> Result<Vec<Position>, StorageError> {
                Ok(self.read(|t| t.positions.clone()))
            }

            fn upsert_order(&self, order: &Order) -> Result<(), StorageError> {
                self.write(|t| {
                    t.orders.insert(order.id, order.clone());
                    Ok(())
                })
            }

            fn get_order(&self, id: OrderId) -> Result<Option<Order>, StorageError> {
                Ok(self.read(|t| t.orders.get(&id).cloned()))
            }

            fn orders_for(&self, trader: &PeerId) -> Result<Vec<Order>, StorageError> {
                Ok(self.read(|t| t.orders.values().filter(|o| &o.trader == trader).cloned().collect()))
            }

            fn insert_trade(&self, trade: &Trade) -> Result<(), StorageError> {
                self.write(|t| {
                    t.trades.push(trade.clone());
                    Ok(())
                })
            }

            fn trades_for(&self, trader: &PeerId) -> Result<Vec<Trade>, StorageError> {
                Ok(self.read(|t| t.trades.iter().filter(|tr| &tr.trader == trader).cloned().collect()))
            }

            fn insert_collaborative_revert(&self, revert: &CollaborativeRevert) -> Result<(), StorageError> {
                self.write(|t| {
                    if t.collaborative_reverts.contains_key(&revert.channel_id) {
                        return Err(StorageError::Duplicate {
                            table: "collaborative_reverts",
                            key: revert.channel_id.to_string(),
                        });
                    }
                    t.collaborative_reverts.insert(revert.channel_id, revert.clone());
                    Ok(())
                })
            }

            fn get_collaborative_revert(&self, channel_id: ChannelId) -> Result<Option<CollaborativeRevert>, StorageError> {
                Ok(self.read(|t| t.collaborative_reverts.get(&channel_id).cloned()))
            }

            fn insert_rollover_params(&self, params: &RolloverParams) -> Result<(), StorageError> {
                self.write(|t| {
                    t.rollover_params.push(params.clone());
                    Ok(())
                })
            }

            fn latest_rollover_params(&self, channel_id: ChannelId) -> Result<Option<RolloverParams>, StorageError> {
                Ok(self.read(|t| {
                    t.rollover_params
                        .iter()
                        .rev()
                        .find(|p| p.channel_id == channel_id)
                        .cloned()
                }))
            }

            fn record_dlc_message(&self, message: &StoredDlcMessage) -> Result<bool, StorageError> {
                if self.read(|t| t.dlc_messages.contains_key(&message.hash)) {
                    return Ok(false);
                }
                self.write(|t| Ok(t.dlc_messages.insert(message.hash.clone(), message.clone()).is_none()))
            }

            fn upsert_last_outbound(&self, outbound: &LastOutboundMessage) -> Result<(), StorageError> {
                self.write(|t| {
                    t.last_outbound_dlc_messages.insert(outbound.peer.clone(), outbound.clone());
                    Ok(())
                })
            }

            fn last_outbound(&self, peer: &PeerId) -> Result<Option<LastOutboundMessage>, StorageError> {
                Ok(self.read(|t| t.last_outbound_dlc_messages.get(peer).cloned()))
            }

            fn set_coordinator_leverages(&self, rows: &[CoordinatorLeverage]) -> Result<(), StorageError> {
                self.write(|t| {
                    t.coordinator_leverages = rows.to_vec();
                    Ok(())
                })
            }

            fn coordinator_leverages(&self) -> Result<Vec<CoordinatorLeverage>, StorageError> {
                Ok(self.read(|t| t.coordinator_leverages.clone()))
            }

            fn upsert_channel(&self, channel: &Channel) -> Result<(), StorageError> {
                self.write(|t| {
                    t.channels.insert(channel.channel_id, channel.clone());
                    Ok(())
                })
            }

            fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>, StorageError> {
                Ok(self.read(|t| t.channels.get(&id).cloned()))
            }

            fn channels(&self) -> Result<Vec<Channel>, StorageError> {
                Ok(self.read(|t| t.channels.values().cloned().collect()))
            }

            fn upsert_task(&self, task: &BackgroundTask) -> Result<(), StorageError> {
                self.write(|t| {
                    t.background_tasks.insert(task.id, task.clone());
                    Ok(())
                })
            }

            fn get_task(&self, id: TaskId) -> Result<Option<BackgroundTask>, StorageError> {
                Ok(self.read(|t| t.background_tasks.get(&id).cloned()))
            }

            fn tasks(&self) -> Result<Vec<BackgroundTask>, StorageError> {
                Ok(self.read(|t| t.background_tasks.values().cloned().collect()))
            }

            fn insert_unfunded_order(&self, order: &UnfundedOrder) -> Result<(), StorageError> {
                self.write(|t| {
                    if t.unfunded_orders.contains_key(&order.order.id) {
                        return Err(StorageError::Duplicate {
                            table: "unfunded_orders",
                            key: order.order.id.to_string(),
                        });
                    }
                    t.unfunded_orders.insert(order.order.id, order.clone());
                    Ok(())
                })
            }

            fn get_unfunded_order(&self, id: OrderId) -> Result<Option<UnfundedOrder>, StorageError> {
                Ok(self.read(|t| t.unfunded_orders.get(&id).cloned()))
            }

            fn remove_unfunded_order(&self, id: OrderId) -> Result<Option<UnfundedOrder>, StorageError> {
                self.write(|t| Ok(t.unfunded_orders.remove(&id)))
            }
        }
    };
}

/** 10.2: in-memory store. shared between engines in tests to simulate restarts */
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableAccess for MemoryStorage {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.lock())
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R, StorageError>) -> Result<R, StorageError> {
        f(&mut self.tables.lock())
    }
}

impl_storage!(MemoryStorage);

/** 10.3: json snapshot of all tables, rewritten on every change */
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl FileStorage {
    /// Opens the snapshot at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let tables = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(io_error(&path, e)),
        };
        tracing::info!(path = %path.display(), "opened snapshot store");
        Ok(Self { path, tables: Mutex::new(tables) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, tables: &Tables) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(tables).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))
    }
}

fn io_error(path: &Path, error: std::io::Error) -> StorageError {
    StorageError::Io { path: path.display().to_string(), reason: error.to_string() }
}

impl TableAccess for FileStorage {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.lock())
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R, StorageError>) -> Result<R, StorageError> {
        let mut guard = self.tables.lock();
        let mut next = guard.clone();
        let result = f(&mut next)?;
        self.flush(&next)?;
        *guard = next;
        Ok(result)
    }
}

impl_storage!(FileStorage);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderReason;
    use crate::types::{Direction, Leverage, Price, Sats};
    use rust_decimal_macros::dec;

    fn order(trader: &str) -> Order {
        Order::market(
            PeerId::new(trader),
            ContractSymbol::BtcUsd,
            Direction::Long,
            dec!(100),
            Leverage::new(dec!(2)).unwrap(),
            OrderReason::Manual,
            Timestamp::from_millis(1),
        )
    }

    fn revert(channel_id: ChannelId) -> CollaborativeRevert {
        CollaborativeRevert {
            channel_id,
            counterparty: PeerId::new("t"),
            price: Price::new_unchecked(dec!(30000)),
            payout_address: "bcrt1q".into(),
            coordinator_amount: Sats::new(10),
            trader_amount: Sats::new(10),
            fee: Sats::new(2),
            split_txid: "ab".into(),
            timestamp: Timestamp::from_millis(1),
        }
    }

    #[test]
    fn collaborative_revert_is_write_once() {
        let store = MemoryStorage::new();
        let channel_id = ChannelId::new();
        store.insert_collaborative_revert(&revert(channel_id)).unwrap();
        let err = store.insert_collaborative_revert(&revert(channel_id)).unwrap_err();
        assert!(matches!(err, StorageError::Duplicate { .. }));
    }

    #[test]
    fn duplicate_message_hash_is_reported() {
        let store = MemoryStorage::new();
        let msg = DlcMessage::RenewAccept { protocol_id: ProtocolId::new(), channel_id: ChannelId::new() };
        let row = StoredDlcMessage::new(PeerId::new("t"), MessageDirection::Inbound, &msg, Timestamp::from_millis(1));
        assert!(store.record_dlc_message(&row).unwrap());
        assert!(!store.record_dlc_message(&row).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let o = order("alice");
        {
            let store = FileStorage::open(&path).unwrap();
            store.upsert_order(&o).unwrap();
            store.insert_collaborative_revert(&revert(ChannelId::new())).unwrap();
        }
        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.get_order(o.id).unwrap(), Some(o));
        assert_eq!(reopened.orders_for(&PeerId::new("bob")).unwrap().len(), 0);
    }

    #[test]
    fn failed_write_leaves_file_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStorage::open(dir.path().join("store.json")).unwrap();
        let channel_id = ChannelId::new();
        store.insert_collaborative_revert(&revert(channel_id)).unwrap();
        assert!(store.insert_collaborative_revert(&revert(channel_id)).is_err());
        assert!(store.get_collaborative_revert(channel_id).unwrap().is_some());
    }
}
