//! Per-user store registry.
//!
//! Stores are opened lazily under `<root>/<org>/<user>/<name>.db` and shared
//! by every caller asking for the same scope and name.

use crate::{error::Result, Error, SoupStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Name of the store used when callers do not pick one.
pub const DEFAULT_STORE_NAME: &str = "smartstore";

/// The org/user pair that owns a set of stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserScope {
    pub org_id: String,
    pub user_id: String,
}

impl UserScope {
    pub fn new(org_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Supplies the scope of the currently authenticated user.
pub trait IdentityProvider: Send + Sync {
    fn current_scope(&self) -> Option<UserScope>;
}

/// An identity provider that always returns the same scope.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub UserScope);

impl IdentityProvider for StaticIdentity {
    fn current_scope(&self) -> Option<UserScope> {
        Some(self.0.clone())
    }
}

type StoreKey = (UserScope, String);

/// Registry of open stores keyed by user scope and store name.
pub struct StoreRegistry {
    root: Option<PathBuf>,
    stores: DashMap<StoreKey, Arc<SoupStore>>,
}

impl StoreRegistry {
    /// Create a registry that keeps stores under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            stores: DashMap::new(),
        }
    }

    /// Create a registry whose stores live in memory only.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            stores: DashMap::new(),
        }
    }

    /// Path of a store on disk, if this registry is disk backed.
    pub fn store_path(&self, scope: &UserScope, name: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| {
            root.join(sanitize(&scope.org_id))
                .join(sanitize(&scope.user_id))
                .join(format!("{}.db", sanitize(name)))
        })
    }

    /// Open (or reuse) the store `name` for `scope`.
    pub fn store(&self, scope: &UserScope, name: &str) -> Result<Arc<SoupStore>> {
        let key = (scope.clone(), name.to_string());
        if let Some(store) = self.stores.get(&key) {
            return Ok(store.clone());
        }

        let entry = self.stores.entry(key);
        let store = match entry {
            dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let store = match self.store_path(scope, name) {
                    Some(path) => SoupStore::open(&path)?,
                    None => SoupStore::open_in_memory()?,
                };
                info!(
                    org_id = %scope.org_id,
                    user_id = %scope.user_id,
                    store = name,
                    "opened store"
                );
                vacant.insert(Arc::new(store)).clone()
            }
        };
        Ok(store)
    }

    /// Open the default store for the current identity.
    pub fn current_store(&self, identity: &dyn IdentityProvider) -> Result<Arc<SoupStore>> {
        let scope = identity
            .current_scope()
            .ok_or(Error::NoCurrentUser)?;
        self.store(&scope, DEFAULT_STORE_NAME)
    }

    /// Forget an open store and delete its file.
    pub fn remove_store(&self, scope: &UserScope, name: &str) -> Result<()> {
        self.stores.remove(&(scope.clone(), name.to_string()));
        if let Some(path) = self.store_path(scope, name) {
            for suffix in ["", "-wal", "-shm"] {
                let file = PathBuf::from(format!("{}{}", path.display(), suffix));
                if file.exists() {
                    std::fs::remove_file(file)?;
                }
            }
        }
        Ok(())
    }

    /// Drop every open store of `scope`, e.g. on logout.
    pub fn close_scope(&self, scope: &UserScope) {
        self.stores.retain(|(s, _), _| s != scope);
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IndexSpec;
    use tempfile::TempDir;

    #[test]
    fn same_scope_shares_store() {
        let registry = StoreRegistry::in_memory();
        let scope = UserScope::new("00D1", "0051");
        let a = registry.store(&scope, "main").unwrap();
        let b = registry.store(&scope, "main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.store(&UserScope::new("00D1", "0052"), "main").unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn stores_are_isolated_per_user() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new(temp_dir.path());
        let alice = UserScope::new("org", "alice");
        let bob = UserScope::new("org", "bob");

        registry
            .store(&alice, "main")
            .unwrap()
            .register_soup("contacts", &[IndexSpec::string("Id")], false)
            .unwrap();

        assert!(!registry.store(&bob, "main").unwrap().soup_exists("contacts"));
        assert!(registry
            .store_path(&alice, "main")
            .unwrap()
            .ends_with("org/alice/main.db"));
    }

    #[test]
    fn current_store_requires_identity() {
        struct Anonymous;
        impl IdentityProvider for Anonymous {
            fn current_scope(&self) -> Option<UserScope> {
                None
            }
        }

        let registry = StoreRegistry::in_memory();
        assert!(registry.current_store(&Anonymous).is_err());
        let identity = StaticIdentity(UserScope::new("org", "user"));
        assert!(registry.current_store(&identity).is_ok());
    }

    #[test]
    fn remove_store_deletes_file() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StoreRegistry::new(temp_dir.path());
        let scope = UserScope::new("org", "user");
        registry.store(&scope, "main").unwrap();
        let path = registry.store_path(&scope, "main").unwrap();
        assert!(path.exists());

        registry.close_scope(&scope);
        registry.remove_store(&scope, "main").unwrap();
        assert!(!path.exists());
    }
}
