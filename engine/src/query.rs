//! Query specs.
//!
//! Every non-smart query is lowered to smart SQL with `?` binds, so the
//! store has a single execution path through the translator.

use crate::{error::Result, Error, SoupName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Page size used when none is given.
pub const DEFAULT_PAGE_SIZE: usize = 10;

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Sort order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl Order {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        }
    }
}

/// What a query selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queryType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueryKind {
    /// Index value equals `match_key`.
    Exact { index_path: String, match_key: Value },
    /// Index value within `[begin_key, end_key]`; a missing bound is open.
    Range {
        index_path: String,
        #[serde(default)]
        begin_key: Option<Value>,
        #[serde(default)]
        end_key: Option<Value>,
    },
    /// Index value matches a SQL `LIKE` pattern.
    Like { index_path: String, like_key: String },
    /// Full-text match, on one full-text index or all of them.
    Match {
        #[serde(default)]
        index_path: Option<String>,
        match_key: String,
    },
    /// Raw smart SQL.
    Smart { smart_sql: String },
    /// Every entry of the soup.
    All,
}

/// A query against one soup (or, for smart queries, any soups).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soup_name: Option<SoupName>,
    #[serde(flatten)]
    pub kind: QueryKind,
    /// Project these paths instead of returning whole documents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub select_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_path: Option<String>,
    #[serde(default)]
    pub order: Order,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl QuerySpec {
    fn for_soup(soup_name: impl Into<SoupName>, kind: QueryKind, page_size: usize) -> Self {
        Self {
            soup_name: Some(soup_name.into()),
            kind,
            select_paths: Vec::new(),
            order_path: None,
            order: Order::Ascending,
            page_size,
        }
    }

    /// Create an exact-match query.
    pub fn exact(
        soup_name: impl Into<SoupName>,
        index_path: impl Into<String>,
        match_key: impl Into<Value>,
        page_size: usize,
    ) -> Self {
        Self::for_soup(
            soup_name,
            QueryKind::Exact {
                index_path: index_path.into(),
                match_key: match_key.into(),
            },
            page_size,
        )
    }

    /// Create a range query.
    pub fn range(
        soup_name: impl Into<SoupName>,
        index_path: impl Into<String>,
        begin_key: Option<Value>,
        end_key: Option<Value>,
        page_size: usize,
    ) -> Self {
        Self::for_soup(
            soup_name,
            QueryKind::Range {
                index_path: index_path.into(),
                begin_key,
                end_key,
            },
            page_size,
        )
    }

    /// Create a `LIKE` query.
    pub fn like(
        soup_name: impl Into<SoupName>,
        index_path: impl Into<String>,
        like_key: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self::for_soup(
            soup_name,
            QueryKind::Like {
                index_path: index_path.into(),
                like_key: like_key.into(),
            },
            page_size,
        )
    }

    /// Create a full-text query.
    pub fn full_text(
        soup_name: impl Into<SoupName>,
        index_path: Option<String>,
        match_key: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self::for_soup(
            soup_name,
            QueryKind::Match {
                index_path,
                match_key: match_key.into(),
            },
            page_size,
        )
    }

    /// Create a query returning every entry of a soup.
    pub fn all(soup_name: impl Into<SoupName>, page_size: usize) -> Self {
        Self::for_soup(soup_name, QueryKind::All, page_size)
    }

    /// Create a smart query.
    pub fn smart(smart_sql: impl Into<String>, page_size: usize) -> Self {
        Self {
            soup_name: None,
            kind: QueryKind::Smart {
                smart_sql: smart_sql.into(),
            },
            select_paths: Vec::new(),
            order_path: None,
            order: Order::Ascending,
            page_size,
        }
    }

    pub fn with_order(mut self, order_path: impl Into<String>, order: Order) -> Self {
        self.order_path = Some(order_path.into());
        self.order = order;
        self
    }

    pub fn with_select_paths(mut self, paths: Vec<String>) -> Self {
        self.select_paths = paths;
        self
    }

    /// The index this query filters on, if any.
    pub fn index_path(&self) -> Option<&str> {
        match &self.kind {
            QueryKind::Exact { index_path, .. }
            | QueryKind::Range { index_path, .. }
            | QueryKind::Like { index_path, .. } => Some(index_path),
            QueryKind::Match { index_path, .. } => index_path.as_deref(),
            QueryKind::Smart { .. } | QueryKind::All => None,
        }
    }

    pub fn is_smart(&self) -> bool {
        matches!(self.kind, QueryKind::Smart { .. })
    }

    /// Whether rows come back as whole documents rather than column arrays.
    pub fn returns_documents(&self) -> bool {
        !self.is_smart() && self.select_paths.is_empty()
    }

    /// Check structural constraints.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::InvalidQuerySpec("page size must be > 0".into()));
        }
        if !self.is_smart() && self.soup_name.is_none() {
            return Err(Error::InvalidQuerySpec("soup name is required".into()));
        }
        Ok(())
    }

    /// Lower this spec to smart SQL and its positional bind values.
    pub fn to_smart_sql(&self) -> Result<(String, Vec<Value>)> {
        self.validate()?;
        if let QueryKind::Smart { smart_sql } = &self.kind {
            return Ok((smart_sql.clone(), Vec::new()));
        }
        let soup = self.soup_name.as_deref().unwrap_or_default();

        let select = if self.select_paths.is_empty() {
            format!("{{{}:_soup}}", soup)
        } else {
            self.select_paths
                .iter()
                .map(|path| format!("{{{}:{}}}", soup, path))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut binds = Vec::new();
        let predicate = match &self.kind {
            QueryKind::Exact {
                index_path,
                match_key,
            } => {
                binds.push(match_key.clone());
                Some(format!("{{{}:{}}} = ?", soup, index_path))
            }
            QueryKind::Range {
                index_path,
                begin_key,
                end_key,
            } => {
                let mut clauses = Vec::new();
                if let Some(begin) = begin_key {
                    clauses.push(format!("{{{}:{}}} >= ?", soup, index_path));
                    binds.push(begin.clone());
                }
                if let Some(end) = end_key {
                    clauses.push(format!("{{{}:{}}} <= ?", soup, index_path));
                    binds.push(end.clone());
                }
                (!clauses.is_empty()).then(|| clauses.join(" AND "))
            }
            QueryKind::Like {
                index_path,
                like_key,
            } => {
                binds.push(Value::String(like_key.clone()));
                Some(format!("{{{}:{}}} LIKE ?", soup, index_path))
            }
            QueryKind::Match {
                index_path,
                match_key,
            } => {
                binds.push(Value::String(match_key.clone()));
                let target = match index_path {
                    Some(path) => format!("{{{}:{}}}", soup, path),
                    None => format!("{{{}}}_fts", soup),
                };
                Some(format!(
                    "{{{s}:_soupEntryId}} IN (SELECT rowid FROM {{{s}}}_fts WHERE {t} MATCH ?)",
                    s = soup,
                    t = target
                ))
            }
            QueryKind::Smart { .. } | QueryKind::All => None,
        };

        let mut sql = format!("SELECT {} FROM {{{}}}", select, soup);
        if let Some(predicate) = predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
        }

        let order_path = self
            .order_path
            .as_deref()
            .or(match &self.kind {
                QueryKind::Exact { index_path, .. }
                | QueryKind::Range { index_path, .. }
                | QueryKind::Like { index_path, .. } => Some(index_path.as_str()),
                _ => None,
            })
            .unwrap_or("_soupEntryId");
        sql.push_str(&format!(
            " ORDER BY {{{}:{}}} {}",
            soup,
            order_path,
            self.order.as_sql()
        ));
        Ok((sql, binds))
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    /// Documents, or arrays of column values for smart/projected queries
    pub entries: Vec<Value>,
    pub page_index: usize,
    pub page_size: usize,
    pub total_count: usize,
}

impl QueryPage {
    pub fn total_pages(&self) -> usize {
        self.total_count.div_ceil(self.page_size.max(1))
    }

    pub fn has_more(&self) -> bool {
        self.page_index + 1 < self.total_pages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_lowering() {
        let (sql, binds) = QuerySpec::exact("contacts", "LastName", "Alpha", 10)
            .to_smart_sql()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT {contacts:_soup} FROM {contacts} WHERE {contacts:LastName} = ? \
             ORDER BY {contacts:LastName} ASC"
        );
        assert_eq!(binds, vec![json!("Alpha")]);
    }

    #[test]
    fn open_range_and_projection() {
        let spec = QuerySpec::range("accounts", "Employees", Some(json!(10)), None, 5)
            .with_select_paths(vec!["Id".into(), "Name".into()])
            .with_order("Name", Order::Descending);
        let (sql, binds) = spec.to_smart_sql().unwrap();
        assert_eq!(
            sql,
            "SELECT {accounts:Id}, {accounts:Name} FROM {accounts} \
             WHERE {accounts:Employees} >= ? ORDER BY {accounts:Name} DESC"
        );
        assert_eq!(binds, vec![json!(10)]);
        assert!(!spec.returns_documents());
    }

    #[test]
    fn full_text_lowering() {
        let (sql, _) = QuerySpec::full_text("notes", None, "hello*", 10)
            .to_smart_sql()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT {notes:_soup} FROM {notes} WHERE {notes:_soupEntryId} IN \
             (SELECT rowid FROM {notes}_fts WHERE {notes}_fts MATCH ?) \
             ORDER BY {notes:_soupEntryId} ASC"
        );
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = QuerySpec::all("contacts", 0).to_smart_sql().unwrap_err();
        assert!(matches!(err, Error::InvalidQuerySpec(_)));
    }

    #[test]
    fn deserialize_from_json() {
        let spec: QuerySpec = serde_json::from_value(json!({
            "queryType": "exact",
            "soupName": "contacts",
            "indexPath": "LastName",
            "matchKey": "Alpha",
            "pageSize": 25
        }))
        .unwrap();
        assert_eq!(spec, QuerySpec::exact("contacts", "LastName", "Alpha", 25));

        let smart: QuerySpec = serde_json::from_value(json!({
            "queryType": "smart",
            "smartSql": "select count(*) from {contacts}"
        }))
        .unwrap();
        assert!(smart.is_smart());
        assert_eq!(smart.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn page_math() {
        let page = QueryPage {
            entries: vec![],
            page_index: 0,
            page_size: 10,
            total_count: 25,
        };
        assert_eq!(page.total_pages(), 3);
        assert!(page.has_more());
    }
}
