//! HTTP error type of the server.
//!
//! Every failure becomes a JSON body `{"error": ..., "details"?: ...}`.
//! Server-side failures hide their cause behind a generic message and put
//! it in `details`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use soupsync_engine::Error as EngineError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

fn engine_status(error: &EngineError) -> StatusCode {
    use EngineError::*;
    match error {
        SoupNotFound(_) | SyncNotFound(_) | EntryNotFound { .. } | IndexNotFound { .. } | UnknownSoup(_) => {
            StatusCode::NOT_FOUND
        }
        AlreadyRunning(_) | SoupAlreadyExists(_) => StatusCode::CONFLICT,
        ManagerStopped => StatusCode::SERVICE_UNAVAILABLE,
        Remote(_) => StatusCode::BAD_GATEWAY,
        Database(_) | Io(_) | SchemaVersionMismatch { .. } | NoCurrentUser => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Engine(e) => engine_status(e),
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "request failed: {:?}", self);
            ErrorBody {
                error: status
                    .canonical_reason()
                    .unwrap_or("server error")
                    .to_string(),
                details: Some(self.to_string()),
            }
        } else {
            tracing::debug!(status = status.as_u16(), "request rejected: {}", self);
            ErrorBody {
                error: self.to_string(),
                details: None,
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use soupsync_engine::RestError;

    #[test]
    fn engine_errors_map_to_statuses() {
        let status = |e: EngineError| AppError::from(e).status();
        assert_eq!(status(EngineError::SyncNotFound("7".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(EngineError::AlreadyRunning(7)), StatusCode::CONFLICT);
        assert_eq!(status(EngineError::NotASyncDown(7)), StatusCode::BAD_REQUEST);
        assert_eq!(status(EngineError::ManagerStopped), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(EngineError::Remote(RestError::Transport("offline".into()))),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn client_errors_keep_their_message() {
        let err = AppError::from(EngineError::SyncNotFound("7".into()));
        assert_eq!(err.to_string(), "sync not found: 7");
        assert_eq!(
            AppError::BadRequest("syncName must not be empty".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
