// dlc-perps-core: coordinator side of self-custodial perpetuals over dlc channels.
// every position lives inside a channel shared with one trader. trades, rollovers
// and reverts are renegotiations of that channel, run as durable background tasks.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: ids, Price, Sats, Leverage, Timestamp, Clock
//   2.x  channel.rs: channel + subchannel state machine, slot, negotiation
//   2.7  message.rs: wire messages between the peers
//   3.x  margin.rs: margin, liquidation price, coordinator leverage table
//   4.x  order.rs: orders, trades, trade planning (open/resize/close/flip)
//   4.5  position.rs: position view, pnl, settlement split
//   5.x  funding.rs: funding fee for a rollover
//   6.x  rollover.rs: expiry calendar, rollover terms
//   7.x  config.rs: settings, yaml + env overrides
//   8.x  engine/: orders, channels, rollover, revert, recovery
//   9.x  price_feed.rs: quote cache and feed seam
//   10.x storage.rs / transport.rs: persistence, peer and chain seams
//   11.x events.rs: event hub with replay
//   12.x supervisor.rs: background tasks, retries, dedup
//   13.x collab_revert.rs: collaborative revert split
//   14.x logging.rs: tracing setup
//   15.x loopback.rs: in-process trader, chain and feed

// protocol core
pub mod channel;
pub mod collab_revert;
pub mod engine;
pub mod message;
pub mod supervisor;
pub mod types;

// trading math
pub mod funding;
pub mod margin;
pub mod order;
pub mod position;
pub mod rollover;

// integration modules
pub mod config;
pub mod events;
pub mod logging;
pub mod loopback;
pub mod price_feed;
pub mod storage;
pub mod transport;

// re exports for convenience
pub use channel::*;
pub use engine::*;
pub use events::*;
pub use order::*;
pub use position::*;
pub use types::*;
pub use collab_revert::{CollaborativeRevert, RevertProposal};
pub use config::{load_settings, load_settings_from_path, load_settings_from_str, Network, Settings};
pub use logging::{init_logging, LogFormat};
pub use loopback::{LoopbackTransport, MockChain, StaticPriceFeed, Step};
pub use message::{DlcMessage, RejectKind};
pub use price_feed::{PriceFeed, PriceSnapshot};
pub use rollover::{RolloverCalendar, RolloverParams};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use supervisor::{BackgroundTask, TaskHandle, TaskInput};
pub use transport::{Blockchain, DlcTransport, SpendKind};
