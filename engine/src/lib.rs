//! # Soupsync Engine
//!
//! An offline-first data layer: an indexed JSON document store plus a sync
//! engine that reconciles it with a remote REST record source.
//!
//! ## Core Concepts
//!
//! ### Soups
//!
//! A [`SoupStore`] holds named collections ("soups") of JSON documents.
//! Each soup declares [`IndexSpec`]s; indexed paths are materialized into
//! columns so [`QuerySpec`]s can filter and order on them. Smart queries
//! are SQL written against `{soup:path}` references and translated by
//! [`smart_sql::translate`].
//!
//! ### Syncs
//!
//! A [`SyncState`] is a persisted sync job: a target, options and a soup.
//! Sync down targets fetch remote records into the soup; sync up targets
//! push locally dirty records back. The [`SyncManager`] runs them on tokio
//! tasks and persists progress after every page.
//!
//! Records carry local bookkeeping fields (`__local__`,
//! `__locally_created__`, `__locally_updated__`, `__locally_deleted__`,
//! `__sync_id__`); see [`target`].
//!
//! ### Remote
//!
//! All remote calls go through the [`RestClient`] trait. Hosts plug in
//! their HTTP implementation; tests plug in scripted responses.
//!
//! ## Quick Start
//!
//! ```rust
//! use soupsync_engine::{IndexSpec, QuerySpec, SoupStore};
//! use serde_json::json;
//!
//! let store = SoupStore::open_in_memory().unwrap();
//! store
//!     .register_soup("contacts", &[IndexSpec::string("lastName")], false)
//!     .unwrap();
//!
//! store
//!     .upsert_entries(
//!         "contacts",
//!         vec![
//!             json!({"firstName": "Ada", "lastName": "Lovelace"}),
//!             json!({"firstName": "Alan", "lastName": "Turing"}),
//!         ],
//!         None,
//!     )
//!     .unwrap();
//!
//! let page = store
//!     .query(&QuerySpec::exact("contacts", "lastName", "Turing", 10), 0)
//!     .unwrap();
//! assert_eq!(page.entries.len(), 1);
//! assert_eq!(page.entries[0]["firstName"], json!("Alan"));
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod json_path;
pub mod manager;
pub mod query;
pub mod registry;
pub mod rest;
pub mod smart_sql;
pub mod soql;
pub mod store;
pub mod sync_state;
pub mod target;

// Re-export main types at crate root
pub use config::{SoupConfig, StoreConfig, SyncConfig, SyncsConfig};
pub use error::Error;
pub use index::{IndexSpec, IndexType};
pub use manager::{ManagerState, SyncCallback, SyncManager};
pub use query::{Order, QueryKind, QueryPage, QuerySpec};
pub use registry::{IdentityProvider, StaticIdentity, StoreRegistry, UserScope};
pub use rest::{RestClient, RestError, RestMethod, RestRequest};
pub use store::{SoupStore, SoupTxn};
pub use sync_state::{MergeMode, SyncOptions, SyncState, SyncStatus, SyncTarget, SyncType};
pub use target::down::SyncDownTarget;
pub use target::up::{AdvancedSyncUpTarget, SyncUpOutcome, SyncUpTarget};
pub use target::SyncContext;

/// Type aliases for clarity
pub type SoupName = String;
pub type EntryId = i64;
pub type SyncId = i64;
/// Milliseconds since the Unix epoch
pub type Timestamp = i64;
