//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use soupsync_engine::target::SYNC_ID;
use soupsync_engine::{
    IndexSpec, RestClient, RestError, RestMethod, RestRequest, SoupStore, SyncManager,
};
use std::sync::Arc;

pub const ACCOUNTS: &str = "accounts";
pub const QUERY_PATH: &str = "/services/data/v62.0/query";
pub const ACCOUNT_PATH: &str = "/services/data/v62.0/sobjects/Account";

enum Matcher {
    /// Substring of the `q` parameter of a query or search
    Query(String),
    /// Method and path prefix
    Path(RestMethod, String),
}

impl Matcher {
    fn matches(&self, request: &RestRequest) -> bool {
        match self {
            Matcher::Query(needle) => request.param("q").is_some_and(|q| q.contains(needle)),
            Matcher::Path(method, prefix) => {
                request.method == *method && request.path.starts_with(prefix)
            }
        }
    }
}

/// Scripted remote: serves canned replies and records every request.
///
/// Routes added later take precedence. Unmatched requests get a 404.
#[derive(Default)]
pub struct MockRestClient {
    routes: Mutex<Vec<(Matcher, Result<Value, RestError>)>>,
    requests: Mutex<Vec<RestRequest>>,
}

impl MockRestClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_query(&self, needle: &str, reply: Value) {
        self.routes
            .lock()
            .push((Matcher::Query(needle.to_string()), Ok(reply)));
    }

    pub fn fail_query(&self, needle: &str, error: RestError) {
        self.routes
            .lock()
            .push((Matcher::Query(needle.to_string()), Err(error)));
    }

    pub fn on_path(&self, method: RestMethod, prefix: &str, reply: Value) {
        self.routes
            .lock()
            .push((Matcher::Path(method, prefix.to_string()), Ok(reply)));
    }

    pub fn fail_path(&self, method: RestMethod, prefix: &str, error: RestError) {
        self.routes
            .lock()
            .push((Matcher::Path(method, prefix.to_string()), Err(error)));
    }

    pub fn requests(&self) -> Vec<RestRequest> {
        self.requests.lock().clone()
    }

    /// `q` parameters of every query sent, in order.
    pub fn queries(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == QUERY_PATH)
            .filter_map(|r| r.param("q").map(String::from))
            .collect()
    }

    pub fn count(&self, method: RestMethod, prefix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl RestClient for MockRestClient {
    async fn execute(&self, request: RestRequest) -> Result<Value, RestError> {
        self.requests.lock().push(request.clone());
        let routes = self.routes.lock();
        routes
            .iter()
            .rev()
            .find(|(matcher, _)| matcher.matches(&request))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| {
                Err(RestError::Status {
                    status: 404,
                    body: format!("no route for {} {}", request.method.as_str(), request.path),
                })
            })
    }
}

/// A store with an `accounts` soup, a mock remote and a manager over both.
pub fn setup() -> (Arc<SoupStore>, Arc<MockRestClient>, SyncManager) {
    let store = Arc::new(SoupStore::open_in_memory().unwrap());
    store
        .register_soup(
            ACCOUNTS,
            &[
                IndexSpec::string("Id"),
                IndexSpec::string("Name"),
                IndexSpec::string("LastModifiedDate"),
                IndexSpec::integer(SYNC_ID),
            ],
            false,
        )
        .unwrap();
    let rest = MockRestClient::new();
    let manager = SyncManager::new(store.clone(), rest.clone()).unwrap();
    (store, rest, manager)
}

pub fn account(id: &str, name: &str, modified: &str) -> Value {
    json!({
        "attributes": {"type": "Account"},
        "Id": id,
        "Name": name,
        "LastModifiedDate": modified,
    })
}

/// A complete query response.
pub fn records(records: Vec<Value>) -> Value {
    json!({
        "totalSize": records.len(),
        "done": true,
        "records": records,
    })
}

/// Server ids stored in the accounts soup, sorted.
pub fn local_ids(store: &SoupStore) -> Vec<String> {
    let mut ids: Vec<String> = store
        .query_all(&soupsync_engine::QuerySpec::all(ACCOUNTS, 100))
        .unwrap()
        .iter()
        .filter_map(|doc| doc.get("Id").and_then(Value::as_str).map(String::from))
        .collect();
    ids.sort();
    ids
}
