//! WebSocket support for sync progress.
//!
//! Clients connect to `/ws`, receive a `sync_update` for every persisted
//! change of runs started through the server, and may start, stop or read
//! syncs over the same socket.

mod hub;
mod protocol;

pub use hub::ProgressHub;
pub use protocol::*;
