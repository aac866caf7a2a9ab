//! Request handlers for sync operations.

pub mod syncs;
mod websocket;

pub use websocket::handle_websocket_connection;
#[cfg(test)]
pub(crate) use websocket::process_message;
