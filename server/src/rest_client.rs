//! HTTP implementation of the engine's REST collaborator.

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde_json::Value;
use soupsync_engine::{RestClient, RestError, RestMethod, RestRequest};
use std::time::Duration;

/// Sends engine requests to the remote instance with a bearer token.
pub struct HttpRestClient {
    instance_url: String,
    access_token: String,
    client: Client,
}

impl HttpRestClient {
    pub fn new(instance_url: &str, access_token: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            instance_url: instance_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.instance_url, path)
    }
}

fn method(method: RestMethod) -> Method {
    match method {
        RestMethod::Get => Method::GET,
        RestMethod::Post => Method::POST,
        RestMethod::Patch => Method::PATCH,
        RestMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn execute(&self, request: RestRequest) -> Result<Value, RestError> {
        let mut builder = self
            .client
            .request(method(request.method), self.url(&request.path))
            .bearer_auth(&self.access_token)
            .header(header::ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::debug!(method = request.method.as_str(), path = %request.path, "remote request");
        let response = builder
            .send()
            .await
            .map_err(|e| RestError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RestError::Transport(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(RestError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| RestError::UnexpectedResponse(format!("{} - Text: {}", e, text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_dropped() {
        let client = HttpRestClient::new("https://example.test/", "token").unwrap();
        assert_eq!(
            client.url("/services/data/v62.0/query"),
            "https://example.test/services/data/v62.0/query"
        );
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let client = HttpRestClient::new("http://127.0.0.1:1", "token").unwrap();
        let err = client
            .execute(RestRequest::soql("SELECT Id FROM Account"))
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::Transport(_)));
    }
}
