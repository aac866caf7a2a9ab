//! Contract with the remote REST collaborator.
//!
//! The engine never authenticates, retries or times out requests itself. It
//! builds [`RestRequest`] values, hands them to a [`RestClient`], and
//! interprets the parsed JSON payload that comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// REST API version used in every generated path.
pub const API_VERSION: &str = "v62.0";

/// Maximum number of subrequests in one composite request.
pub const MAX_COMPOSITE_SUBREQUESTS: usize = 25;

/// Failure reported by the REST collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RestError {
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RestError {
    /// The HTTP status, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RestMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl RestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestMethod::Get => "GET",
            RestMethod::Post => "POST",
            RestMethod::Patch => "PATCH",
            RestMethod::Delete => "DELETE",
        }
    }
}

/// A request to the remote source.
///
/// `path` is relative to the instance URL and always starts with `/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestRequest {
    pub method: RestMethod,
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn data_path(suffix: &str) -> String {
    format!("/services/data/{}/{}", API_VERSION, suffix)
}

impl RestRequest {
    /// Create a request with no query parameters or body.
    pub fn new(method: RestMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Add a query parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Attach a JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Look up a query parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Run a SOQL query.
    pub fn soql(query: &str) -> Self {
        Self::new(RestMethod::Get, data_path("query")).with_param("q", query)
    }

    /// Follow a `nextRecordsUrl` returned by a previous query.
    pub fn query_more(next_records_url: &str) -> Self {
        Self::new(RestMethod::Get, next_records_url)
    }

    /// Run a SOSL search.
    pub fn sosl(search: &str) -> Self {
        Self::new(RestMethod::Get, data_path("search")).with_param("q", search)
    }

    /// Retrieve one record, optionally restricted to `fields`.
    pub fn retrieve(object_type: &str, id: &str, fields: &[String]) -> Self {
        let request = Self::new(
            RestMethod::Get,
            data_path(&format!("sobjects/{}/{}", object_type, id)),
        );
        if fields.is_empty() {
            request
        } else {
            request.with_param("fields", fields.join(","))
        }
    }

    /// Create a record.
    pub fn create(object_type: &str, fields: Value) -> Self {
        Self::new(
            RestMethod::Post,
            data_path(&format!("sobjects/{}", object_type)),
        )
        .with_body(fields)
    }

    /// Update a record.
    pub fn update(object_type: &str, id: &str, fields: Value) -> Self {
        Self::new(
            RestMethod::Patch,
            data_path(&format!("sobjects/{}/{}", object_type, id)),
        )
        .with_body(fields)
    }

    /// Delete a record.
    pub fn delete(object_type: &str, id: &str) -> Self {
        Self::new(
            RestMethod::Delete,
            data_path(&format!("sobjects/{}/{}", object_type, id)),
        )
    }

    /// Describe an object type.
    pub fn describe(object_type: &str) -> Self {
        Self::new(
            RestMethod::Get,
            data_path(&format!("sobjects/{}/describe", object_type)),
        )
    }

    /// Fetch the UI layout of an object type.
    pub fn layout(
        object_type: &str,
        form_factor: Option<&str>,
        layout_type: Option<&str>,
        mode: Option<&str>,
        record_type_id: Option<&str>,
    ) -> Self {
        let mut request = Self::new(
            RestMethod::Get,
            data_path(&format!("ui-api/layout/{}", object_type)),
        );
        for (key, value) in [
            ("formFactor", form_factor),
            ("layoutType", layout_type),
            ("mode", mode),
            ("recordTypeId", record_type_id),
        ] {
            if let Some(value) = value {
                request = request.with_param(key, value);
            }
        }
        request
    }

    /// Fetch picklist values of an object type for a record type.
    pub fn picklist(object_type: &str, record_type_id: &str) -> Self {
        Self::new(
            RestMethod::Get,
            data_path(&format!(
                "ui-api/object-info/{}/picklist-values/{}",
                object_type, record_type_id
            )),
        )
    }

    /// Bundle subrequests into one composite call.
    pub fn composite(all_or_none: bool, subrequests: Vec<CompositeSubrequest>) -> Self {
        Self::new(RestMethod::Post, data_path("composite")).with_body(json!({
            "allOrNone": all_or_none,
            "compositeRequest": subrequests,
        }))
    }

    /// Express this request as a composite subrequest.
    pub fn into_subrequest(self, reference_id: impl Into<String>) -> CompositeSubrequest {
        let mut url = self.path;
        if !self.query.is_empty() {
            let params: Vec<String> = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            url = format!("{}?{}", url, params.join("&"));
        }
        CompositeSubrequest {
            method: self.method,
            url,
            reference_id: reference_id.into(),
            body: self.body,
        }
    }
}

/// One entry of a composite request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSubrequest {
    pub method: RestMethod,
    pub url: String,
    pub reference_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// One entry of a composite response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSubresponse {
    #[serde(default)]
    pub body: Value,
    pub http_status_code: u16,
    pub reference_id: String,
}

impl CompositeSubresponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_status_code)
    }

    /// Convert a failed subresponse into a [`RestError`].
    pub fn to_error(&self) -> RestError {
        RestError::Status {
            status: self.http_status_code,
            body: self.body.to_string(),
        }
    }
}

/// Parse the `compositeResponse` array of a composite call.
pub fn parse_composite_response(
    response: &Value,
) -> std::result::Result<Vec<CompositeSubresponse>, RestError> {
    let entries = response
        .get("compositeResponse")
        .cloned()
        .ok_or_else(|| RestError::UnexpectedResponse("missing compositeResponse".into()))?;
    serde_json::from_value(entries).map_err(|e| RestError::UnexpectedResponse(e.to_string()))
}

/// The remote data source.
///
/// Implementations own authentication, retries and timeouts.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Execute `request` and return the parsed JSON payload.
    ///
    /// Successful calls with an empty body (e.g. 204) return `Value::Null`.
    async fn execute(&self, request: RestRequest) -> std::result::Result<Value, RestError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soql_request() {
        let request = RestRequest::soql("SELECT Id FROM Account");
        assert_eq!(request.method, RestMethod::Get);
        assert_eq!(request.path, "/services/data/v62.0/query");
        assert_eq!(request.param("q"), Some("SELECT Id FROM Account"));
    }

    #[test]
    fn retrieve_with_fields() {
        let request = RestRequest::retrieve(
            "Contact",
            "003A",
            &["Id".to_string(), "LastModifiedDate".to_string()],
        );
        assert_eq!(request.path, "/services/data/v62.0/sobjects/Contact/003A");
        assert_eq!(request.param("fields"), Some("Id,LastModifiedDate"));
    }

    #[test]
    fn composite_body() {
        let sub = RestRequest::update("Account", "001A", json!({"Name": "Acme"}))
            .into_subrequest("ref0");
        let request = RestRequest::composite(true, vec![sub]);
        let body = request.body.unwrap();
        assert_eq!(body["allOrNone"], json!(true));
        assert_eq!(body["compositeRequest"][0]["method"], json!("PATCH"));
        assert_eq!(body["compositeRequest"][0]["referenceId"], json!("ref0"));
        assert_eq!(
            body["compositeRequest"][0]["url"],
            json!("/services/data/v62.0/sobjects/Account/001A")
        );
    }

    #[test]
    fn composite_response_parsing() {
        let response = json!({
            "compositeResponse": [
                {"body": {"id": "001A", "success": true}, "httpStatusCode": 201, "referenceId": "ref0"},
                {"body": [{"errorCode": "NOT_FOUND"}], "httpStatusCode": 404, "referenceId": "ref1"}
            ]
        });
        let parsed = parse_composite_response(&response).unwrap();
        assert!(parsed[0].is_success());
        assert!(!parsed[1].is_success());
        assert!(parsed[1].to_error().is_not_found());
    }

    #[test]
    fn error_status() {
        let err = RestError::Status {
            status: 404,
            body: "not found".into(),
        };
        assert!(err.is_not_found());
        assert_eq!(RestError::Transport("x".into()).status(), None);
    }
}
