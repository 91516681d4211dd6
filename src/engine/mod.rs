// 8.0: coordinator engine. maps trader orders onto channel renegotiations, drives
// the peer protocol, and runs everything long-lived as supervised background tasks.
// cheap to clone: every field is shared, so each task holds its own handle.

mod channels;
mod core;
mod orders;
mod positions;
mod recovery;
mod results;
mod revert;
mod rollover;

pub use core::Engine;
pub use results::{ChannelOpening, EngineError, FundingSource, OrderResult};
