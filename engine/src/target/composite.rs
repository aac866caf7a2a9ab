//! Record-level requests and responses shared by the up targets.
//!
//! A [`RecordRequest`] is sent either on its own or bundled into a
//! composite call; both paths yield a [`RecordResponse`] so callers handle
//! outcomes the same way.

use crate::rest::{
    parse_composite_response, CompositeSubresponse, RestClient, RestError, RestRequest,
    MAX_COMPOSITE_SUBREQUESTS,
};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Kind of remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRequestKind {
    Create,
    Update,
    Delete,
}

/// One remote write.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRequest {
    pub kind: RecordRequestKind,
    pub object_type: String,
    pub record_id: Option<String>,
    pub fields: Map<String, Value>,
    pub reference_id: String,
}

impl RecordRequest {
    pub fn create(object_type: &str, fields: Map<String, Value>, reference_id: String) -> Self {
        Self {
            kind: RecordRequestKind::Create,
            object_type: object_type.to_string(),
            record_id: None,
            fields,
            reference_id,
        }
    }

    pub fn update(
        object_type: &str,
        record_id: &str,
        fields: Map<String, Value>,
        reference_id: String,
    ) -> Self {
        Self {
            kind: RecordRequestKind::Update,
            object_type: object_type.to_string(),
            record_id: Some(record_id.to_string()),
            fields,
            reference_id,
        }
    }

    pub fn delete(object_type: &str, record_id: &str, reference_id: String) -> Self {
        Self {
            kind: RecordRequestKind::Delete,
            object_type: object_type.to_string(),
            record_id: Some(record_id.to_string()),
            fields: Map::new(),
            reference_id,
        }
    }

    pub fn to_rest_request(&self) -> RestRequest {
        let id = self.record_id.as_deref().unwrap_or_default();
        match self.kind {
            RecordRequestKind::Create => {
                RestRequest::create(&self.object_type, Value::Object(self.fields.clone()))
            }
            RecordRequestKind::Update => {
                RestRequest::update(&self.object_type, id, Value::Object(self.fields.clone()))
            }
            RecordRequestKind::Delete => RestRequest::delete(&self.object_type, id),
        }
    }
}

/// Outcome of one remote write.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordResponse {
    pub success: bool,
    /// Id of a created record
    pub record_id: Option<String>,
    /// The target record does not exist (404)
    pub record_does_not_exist: bool,
    /// A related record was deleted (`ENTITY_IS_DELETED`)
    pub related_record_does_not_exist: bool,
    pub body: Value,
}

impl RecordResponse {
    pub fn from_subresponse(sub: &CompositeSubresponse) -> Self {
        if sub.is_success() {
            return Self::success(sub.body.clone());
        }
        Self::failure(sub.http_status_code, sub.body.clone())
    }

    fn success(body: Value) -> Self {
        Self {
            success: true,
            record_id: body.get("id").and_then(Value::as_str).map(String::from),
            record_does_not_exist: false,
            related_record_does_not_exist: false,
            body,
        }
    }

    fn failure(status: u16, body: Value) -> Self {
        let first_error = body
            .get(0)
            .and_then(|e| e.get("errorCode"))
            .and_then(Value::as_str);
        Self {
            success: false,
            record_id: None,
            record_does_not_exist: status == 404,
            related_record_does_not_exist: first_error == Some("ENTITY_IS_DELETED"),
            body,
        }
    }

    /// Human readable error for `__last_error__`.
    pub fn error_message(&self) -> String {
        self.body
            .get(0)
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| self.body.to_string())
    }
}

/// Send one record request on its own.
///
/// HTTP failures become unsuccessful responses; transport failures are
/// returned as errors.
pub async fn send_single(
    rest: &dyn RestClient,
    request: &RecordRequest,
) -> Result<RecordResponse, RestError> {
    match rest.execute(request.to_rest_request()).await {
        Ok(body) => Ok(RecordResponse::success(body)),
        Err(RestError::Status { status, body }) => {
            let body = serde_json::from_str(&body).unwrap_or(Value::String(body));
            Ok(RecordResponse::failure(status, body))
        }
        Err(e) => Err(e),
    }
}

/// Send record requests as composite calls, keyed by reference id.
///
/// Requests beyond the composite limit are split across several calls.
/// With `all_or_none` the remote rolls back a whole call on any failure.
pub async fn send_composite(
    rest: &dyn RestClient,
    all_or_none: bool,
    requests: &[RecordRequest],
) -> Result<HashMap<String, RecordResponse>, RestError> {
    let mut responses = HashMap::new();
    for chunk in requests.chunks(MAX_COMPOSITE_SUBREQUESTS) {
        let subrequests = chunk
            .iter()
            .map(|r| r.to_rest_request().into_subrequest(r.reference_id.clone()))
            .collect();
        let response = rest
            .execute(RestRequest::composite(all_or_none, subrequests))
            .await?;
        for sub in parse_composite_response(&response)? {
            responses.insert(sub.reference_id.clone(), RecordResponse::from_subresponse(&sub));
        }
    }
    Ok(responses)
}
