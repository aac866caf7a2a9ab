//! JSON frames exchanged over `/ws`.
//!
//! Frames are tagged by `type` with snake_case names. Sync states inside a
//! frame keep their persisted camelCase shape.

use serde::{Deserialize, Serialize};
use soupsync_engine::{SyncId, SyncState};

/// A request from the client. `request_id` is echoed on the reply.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RunSync {
        sync_id: SyncId,
        #[serde(default)]
        request_id: Option<String>,
    },
    StopSync {
        sync_id: SyncId,
        #[serde(default)]
        request_id: Option<String>,
    },
    GetSync {
        sync_id: SyncId,
        #[serde(default)]
        request_id: Option<String>,
    },
    Ping,
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::RunSync { request_id, .. }
            | ClientMessage::StopSync { request_id, .. }
            | ClientMessage::GetSync { request_id, .. } => request_id.as_deref(),
            ClientMessage::Ping => None,
        }
    }
}

/// A frame pushed by the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Answer to `run_sync`, `stop_sync` or `get_sync`
    SyncState {
        state: SyncState,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Persisted progress of a run, sent to every subscriber
    SyncUpdate { state: SyncState },
    Pong,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    pub fn sync_update(state: &SyncState) -> Self {
        ServerMessage::SyncUpdate {
            state: state.clone(),
        }
    }
}
