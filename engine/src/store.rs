//! Soup store - named collections of JSON documents on SQLite.
//!
//! Each soup gets its own table `TABLE_N` holding the raw document plus one
//! column per index spec, materialized at write time. Metadata about soups
//! and their index columns lives in `soup_attrs` and `soup_index_map`.
//!
//! Every mutation runs inside a single SQLite transaction. Use
//! [`SoupStore::transaction`] to group writes across several soups.

use crate::index::{
    self, validate_specs, IndexSpec, IndexType, SoupIndex, SOUP_CREATED_DATE, SOUP_ENTRY_ID,
    SOUP_LAST_MODIFIED_DATE,
};
use crate::query::{QueryKind, QueryPage, QuerySpec};
use crate::smart_sql::{self, SoupSchemaLookup, SoupTable};
use crate::{error::Result, json_path, EntryId, Error, SoupName, Timestamp};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Version of the store's own metadata tables.
pub const SCHEMA_VERSION: i32 = 1;

const METADATA_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS soup_attrs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        soupName TEXT NOT NULL UNIQUE,
        externalStorage INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS soup_index_map (
        soupName TEXT NOT NULL,
        position INTEGER NOT NULL,
        path TEXT NOT NULL,
        columnName TEXT,
        columnType TEXT NOT NULL,
        PRIMARY KEY (soupName, path)
    );
";

/// Current time in millis since epoch.
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// A store of soups backed by one SQLite database.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct SoupStore {
    conn: Arc<Mutex<Connection>>,
    tables: Arc<RwLock<HashMap<SoupName, SoupTable>>>,
}

impl std::fmt::Debug for SoupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoupStore")
            .field("soups", &self.all_soup_names())
            .finish()
    }
}

impl SoupSchemaLookup for SoupStore {
    fn soup_table(&self, soup_name: &str) -> Option<SoupTable> {
        self.tables.read().get(soup_name).cloned()
    }
}

impl SoupStore {
    /// Open or create a store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=10000;
            ",
        )?;
        Self::from_connection(conn)
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        let tables = load_tables(&conn)?;
        debug!(soups = tables.len(), "opened soup store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables: Arc::new(RwLock::new(tables)),
        })
    }

    /// Physical layout of `soup_name`.
    pub fn table(&self, soup_name: &str) -> Result<SoupTable> {
        self.soup_table(soup_name)
            .ok_or_else(|| Error::SoupNotFound(soup_name.to_string()))
    }

    // ------------------------------------------------------------------
    // Soup management
    // ------------------------------------------------------------------

    /// Register a new soup.
    pub fn register_soup(
        &self,
        soup_name: &str,
        specs: &[IndexSpec],
        external_storage: bool,
    ) -> Result<()> {
        if soup_name.trim().is_empty() {
            return Err(Error::InvalidSoupName(soup_name.to_string()));
        }
        validate_specs(specs)?;

        let mut conn = self.conn.lock();
        if self.soup_exists(soup_name) {
            return Err(Error::SoupAlreadyExists(soup_name.to_string()));
        }

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO soup_attrs (soupName, externalStorage) VALUES (?1, ?2)",
            params![soup_name, external_storage],
        )?;
        let table_name = format!("TABLE_{}", tx.last_insert_rowid());
        let table = build_table(soup_name, table_name, specs, external_storage);
        insert_index_map(&tx, &table)?;
        create_soup_tables(&tx, &table)?;
        tx.commit()?;

        info!(
            soup = soup_name,
            table = %table.table_name,
            indexes = specs.len(),
            external_storage,
            "registered soup"
        );
        self.tables.write().insert(soup_name.to_string(), table);
        Ok(())
    }

    /// Drop a soup and all its entries. No-op if it does not exist.
    pub fn remove_soup(&self, soup_name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let Some(table) = self.soup_table(soup_name) else {
            return Ok(());
        };

        let tx = conn.transaction()?;
        drop_soup_tables(&tx, &table)?;
        tx.execute(
            "DELETE FROM soup_index_map WHERE soupName = ?1",
            params![soup_name],
        )?;
        tx.execute("DELETE FROM soup_attrs WHERE soupName = ?1", params![soup_name])?;
        tx.commit()?;

        self.tables.write().remove(soup_name);
        info!(soup = soup_name, "removed soup");
        Ok(())
    }

    /// Replace a soup's index set and rematerialize every entry.
    ///
    /// Entry ids, creation and modification times are preserved.
    pub fn alter_soup(
        &self,
        soup_name: &str,
        specs: &[IndexSpec],
        external_storage: bool,
    ) -> Result<()> {
        validate_specs(specs)?;
        let mut conn = self.conn.lock();
        let old = self.table(soup_name)?;

        let tx = conn.transaction()?;
        let rows = read_raw_rows(&tx, &old)?;
        drop_soup_tables(&tx, &old)?;
        tx.execute(
            "DELETE FROM soup_index_map WHERE soupName = ?1",
            params![soup_name],
        )?;
        tx.execute(
            "UPDATE soup_attrs SET externalStorage = ?1 WHERE soupName = ?2",
            params![external_storage, soup_name],
        )?;

        let table = build_table(soup_name, old.table_name.clone(), specs, external_storage);
        insert_index_map(&tx, &table)?;
        create_soup_tables(&tx, &table)?;
        for row in &rows {
            insert_placeholder(&tx, &table, Some(row.id), row.created, row.last_modified)?;
            write_row(&tx, &table, row.id, &row.doc, row.last_modified)?;
        }
        tx.commit()?;

        info!(
            soup = soup_name,
            entries = rows.len(),
            indexes = specs.len(),
            "altered soup"
        );
        self.tables.write().insert(soup_name.to_string(), table);
        Ok(())
    }

    pub fn soup_exists(&self, soup_name: &str) -> bool {
        self.tables.read().contains_key(soup_name)
    }

    /// Index specs of `soup_name`, in declaration order.
    pub fn index_specs(&self, soup_name: &str) -> Result<Vec<IndexSpec>> {
        Ok(self
            .table(soup_name)?
            .indexes
            .iter()
            .map(SoupIndex::spec)
            .collect())
    }

    /// Whether `soup_name` has an index on `path`.
    pub fn has_index(&self, soup_name: &str, path: &str) -> bool {
        self.soup_table(soup_name)
            .is_some_and(|table| table.index_for(path).is_some())
    }

    /// Names of all registered soups, sorted.
    pub fn all_soup_names(&self) -> Vec<SoupName> {
        let mut names: Vec<SoupName> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    /// Run `f` inside one transaction. Nothing commits unless `f` succeeds.
    ///
    /// `f` must only use the [`SoupTxn`] it is given; calling back into this
    /// store from inside `f` deadlocks.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SoupTxn<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = {
            let txn = SoupTxn {
                conn: &tx,
                store: self,
                now: now_millis(),
            };
            f(&txn)?
        };
        tx.commit()?;
        Ok(result)
    }

    /// Insert or update entries and return them with their reserved fields.
    ///
    /// An entry carrying `_soupEntryId` updates that row. Otherwise, when
    /// `external_id_path` is given, an entry whose value at that path matches
    /// exactly one stored entry updates it, and one matching none is
    /// inserted.
    pub fn upsert_entries(
        &self,
        soup_name: &str,
        entries: Vec<Value>,
        external_id_path: Option<&str>,
    ) -> Result<Vec<Value>> {
        self.transaction(|txn| txn.upsert_entries(soup_name, entries, external_id_path))
    }

    /// Upsert a single entry.
    pub fn upsert_entry(
        &self,
        soup_name: &str,
        entry: Value,
        external_id_path: Option<&str>,
    ) -> Result<Value> {
        self.transaction(|txn| txn.upsert_entry(soup_name, entry, external_id_path))
    }

    /// Fetch entries by id, skipping ids that do not exist.
    pub fn retrieve_entries(&self, soup_name: &str, ids: &[EntryId]) -> Result<Vec<Value>> {
        let table = self.table(soup_name)?;
        let conn = self.conn.lock();
        retrieve_rows(&conn, &table, ids)
    }

    pub fn remove_entries(&self, soup_name: &str, ids: &[EntryId]) -> Result<()> {
        self.transaction(|txn| txn.remove_entries(soup_name, ids))
    }

    /// Remove every entry selected by `spec` and return how many went.
    pub fn remove_entries_by_query(&self, soup_name: &str, spec: &QuerySpec) -> Result<usize> {
        self.transaction(|txn| txn.remove_entries_by_query(soup_name, spec))
    }

    /// Remove every entry of a soup, keeping the soup itself.
    pub fn clear_soup(&self, soup_name: &str) -> Result<()> {
        self.transaction(|txn| txn.clear_soup(soup_name))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Run one page of a query.
    pub fn query(&self, spec: &QuerySpec, page_index: usize) -> Result<QueryPage> {
        let conn = self.conn.lock();
        query_page(&conn, self, spec, page_index)
    }

    /// Run a query and return every matching row, ignoring paging.
    pub fn query_all(&self, spec: &QuerySpec) -> Result<Vec<Value>> {
        let conn = self.conn.lock();
        query_rows(&conn, self, spec)
    }

    /// Number of rows `spec` selects.
    pub fn count(&self, spec: &QuerySpec) -> Result<usize> {
        let conn = self.conn.lock();
        let (sql, binds) = prepare_query(self, spec)?;
        count_rows(&conn, &sql, &binds)
    }
}

/// Write access to a store inside one transaction.
pub struct SoupTxn<'a> {
    conn: &'a Connection,
    store: &'a SoupStore,
    now: Timestamp,
}

impl SoupTxn<'_> {
    /// Timestamp stamped on every write of this transaction.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn upsert_entries(
        &self,
        soup_name: &str,
        entries: Vec<Value>,
        external_id_path: Option<&str>,
    ) -> Result<Vec<Value>> {
        let table = self.store.table(soup_name)?;
        let count = entries.len();
        let saved = entries
            .into_iter()
            .map(|entry| upsert_row(self.conn, &table, entry, external_id_path, self.now))
            .collect::<Result<Vec<_>>>()?;
        debug!(soup = soup_name, entries = count, "upserted entries");
        Ok(saved)
    }

    pub fn upsert_entry(
        &self,
        soup_name: &str,
        entry: Value,
        external_id_path: Option<&str>,
    ) -> Result<Value> {
        let table = self.store.table(soup_name)?;
        upsert_row(self.conn, &table, entry, external_id_path, self.now)
    }

    pub fn retrieve_entries(&self, soup_name: &str, ids: &[EntryId]) -> Result<Vec<Value>> {
        let table = self.store.table(soup_name)?;
        retrieve_rows(self.conn, &table, ids)
    }

    pub fn remove_entries(&self, soup_name: &str, ids: &[EntryId]) -> Result<()> {
        let table = self.store.table(soup_name)?;
        for id in ids {
            delete_row(self.conn, &table, *id)?;
        }
        debug!(soup = soup_name, entries = ids.len(), "removed entries");
        Ok(())
    }

    pub fn remove_entries_by_query(&self, soup_name: &str, spec: &QuerySpec) -> Result<usize> {
        let ids = entry_ids(self.conn, self.store, soup_name, spec)?;
        self.remove_entries(soup_name, &ids)?;
        Ok(ids.len())
    }

    pub fn clear_soup(&self, soup_name: &str) -> Result<()> {
        let table = self.store.table(soup_name)?;
        self.conn
            .execute(&format!("DELETE FROM {}", table.table_name), [])?;
        if table.has_full_text() {
            self.conn
                .execute(&format!("DELETE FROM {}", table.fts_table()), [])?;
        }
        if table.external_storage {
            self.conn
                .execute(&format!("DELETE FROM {}", table.ext_table()), [])?;
        }
        info!(soup = soup_name, "cleared soup");
        Ok(())
    }

    pub fn query(&self, spec: &QuerySpec, page_index: usize) -> Result<QueryPage> {
        query_page(self.conn, self.store, spec, page_index)
    }

    pub fn query_all(&self, spec: &QuerySpec) -> Result<Vec<Value>> {
        query_rows(self.conn, self.store, spec)
    }
}

// ----------------------------------------------------------------------
// Schema
// ----------------------------------------------------------------------

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;

    let current: Option<i32> = conn
        .query_row(
            "SELECT version FROM schema_version WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match current {
        None => {
            conn.execute_batch(METADATA_SCHEMA)?;
            conn.execute(
                "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                params![SCHEMA_VERSION, Utc::now().to_rfc3339()],
            )?;
            info!(version = SCHEMA_VERSION, "initialized store schema");
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            return Err(Error::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                actual: v,
            })
        }
    }
    Ok(())
}

fn load_tables(conn: &Connection) -> Result<HashMap<SoupName, SoupTable>> {
    let mut stmt = conn.prepare("SELECT id, soupName, externalStorage FROM soup_attrs")?;
    let soups = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut index_stmt = conn.prepare(
        "SELECT path, columnName, columnType FROM soup_index_map
         WHERE soupName = ?1 ORDER BY position",
    )?;

    let mut tables = HashMap::new();
    for (id, soup_name, external_storage) in soups {
        let raw = index_stmt
            .query_map(params![soup_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut indexes = Vec::with_capacity(raw.len());
        for (path, column_name, column_type) in raw {
            let index_type = IndexType::parse(&column_type).ok_or_else(|| {
                Error::invalid_path(&path, format!("unknown index type '{}'", column_type))
            })?;
            indexes.push(SoupIndex {
                path,
                index_type,
                column_name,
            });
        }

        tables.insert(
            soup_name.clone(),
            SoupTable {
                soup_name,
                table_name: format!("TABLE_{}", id),
                indexes,
                external_storage,
            },
        );
    }
    Ok(tables)
}

fn build_table(
    soup_name: &str,
    table_name: String,
    specs: &[IndexSpec],
    external_storage: bool,
) -> SoupTable {
    let indexes = specs
        .iter()
        .enumerate()
        .map(|(position, spec)| SoupIndex {
            path: spec.path.clone(),
            index_type: spec.index_type,
            column_name: spec
                .index_type
                .column_affinity()
                .map(|_| format!("{}_{}", table_name, position)),
        })
        .collect();
    SoupTable {
        soup_name: soup_name.to_string(),
        table_name,
        indexes,
        external_storage,
    }
}

fn insert_index_map(conn: &Connection, table: &SoupTable) -> Result<()> {
    for (position, idx) in table.indexes.iter().enumerate() {
        conn.execute(
            "INSERT INTO soup_index_map (soupName, position, path, columnName, columnType)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                table.soup_name,
                position as i64,
                idx.path,
                idx.column_name,
                idx.index_type.as_str()
            ],
        )?;
    }
    Ok(())
}

fn create_soup_tables(conn: &Connection, table: &SoupTable) -> Result<()> {
    let t = &table.table_name;
    let mut columns = vec![
        "id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "soup TEXT".to_string(),
        "created INTEGER NOT NULL".to_string(),
        "lastModified INTEGER NOT NULL".to_string(),
    ];
    for idx in &table.indexes {
        if let (Some(column), Some(affinity)) =
            (&idx.column_name, idx.index_type.column_affinity())
        {
            columns.push(format!("{} {}", column, affinity));
        }
    }

    let mut ddl = format!("CREATE TABLE {} ({});\n", t, columns.join(", "));
    ddl.push_str(&format!(
        "CREATE INDEX {t}_created_idx ON {t} (created);\n\
         CREATE INDEX {t}_lastModified_idx ON {t} (lastModified);\n",
        t = t
    ));
    for (position, idx) in table.indexes.iter().enumerate() {
        match &idx.column_name {
            Some(column) => {
                ddl.push_str(&format!("CREATE INDEX {c}_idx ON {t} ({c});\n", c = column, t = t))
            }
            None if !table.external_storage => ddl.push_str(&format!(
                "CREATE INDEX {t}_{p}_idx ON {t} (json_extract(soup, '$.{path}'));\n",
                t = t,
                p = position,
                path = idx.path
            )),
            None => {}
        }
    }

    let fts_columns: Vec<&str> = table
        .indexes
        .iter()
        .filter(|idx| idx.index_type == IndexType::FullText)
        .filter_map(|idx| idx.column_name.as_deref())
        .collect();
    if !fts_columns.is_empty() {
        ddl.push_str(&format!(
            "CREATE VIRTUAL TABLE {} USING fts5({});\n",
            table.fts_table(),
            fts_columns.join(", ")
        ));
    }
    if table.external_storage {
        ddl.push_str(&format!(
            "CREATE TABLE {} (id INTEGER PRIMARY KEY, soup TEXT NOT NULL);\n",
            table.ext_table()
        ));
    }

    conn.execute_batch(&ddl)?;
    Ok(())
}

fn drop_soup_tables(conn: &Connection, table: &SoupTable) -> Result<()> {
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {};\nDROP TABLE IF EXISTS {};\nDROP TABLE IF EXISTS {};",
        table.table_name,
        table.fts_table(),
        table.ext_table()
    ))?;
    Ok(())
}

// ----------------------------------------------------------------------
// Rows
// ----------------------------------------------------------------------

struct RawRow {
    id: EntryId,
    doc: Value,
    created: Timestamp,
    last_modified: Timestamp,
}

fn read_raw_rows(conn: &Connection, table: &SoupTable) -> Result<Vec<RawRow>> {
    let sql = format!(
        "SELECT {t}.id, {doc}, {t}.created, {t}.lastModified FROM {t} ORDER BY {t}.id",
        t = table.table_name,
        doc = table.document_expr()
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    raw.into_iter()
        .map(|(id, doc, created, last_modified)| {
            Ok(RawRow {
                id,
                doc: parse_document(doc)?,
                created,
                last_modified,
            })
        })
        .collect()
}

fn parse_document(text: Option<String>) -> Result<Value> {
    match text {
        Some(text) => Ok(serde_json::from_str(&text)?),
        None => Ok(Value::Null),
    }
}

fn insert_placeholder(
    conn: &Connection,
    table: &SoupTable,
    id: Option<EntryId>,
    created: Timestamp,
    last_modified: Timestamp,
) -> Result<EntryId> {
    conn.execute(
        &format!(
            "INSERT INTO {} (id, soup, created, lastModified) VALUES (?1, NULL, ?2, ?3)",
            table.table_name
        ),
        params![id, created, last_modified],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Write the document and its materialized index values. Returns false if
/// no row has `id`.
fn write_row(
    conn: &Connection,
    table: &SoupTable,
    id: EntryId,
    doc: &Value,
    last_modified: Timestamp,
) -> Result<bool> {
    let text = serde_json::to_string(doc)?;

    let mut assignments = vec!["soup = ?".to_string(), "lastModified = ?".to_string()];
    let mut values = vec![
        if table.external_storage {
            SqlValue::Null
        } else {
            SqlValue::Text(text.clone())
        },
        SqlValue::Integer(last_modified),
    ];
    for idx in &table.indexes {
        if let Some(column) = &idx.column_name {
            assignments.push(format!("{} = ?", column));
            values.push(idx.materialize(doc));
        }
    }
    values.push(SqlValue::Integer(id));

    let changed = conn.execute(
        &format!(
            "UPDATE {} SET {} WHERE id = ?",
            table.table_name,
            assignments.join(", ")
        ),
        params_from_iter(values.iter()),
    )?;
    if changed == 0 {
        return Ok(false);
    }

    if table.external_storage {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, soup) VALUES (?1, ?2)",
                table.ext_table()
            ),
            params![id, text],
        )?;
    }

    if table.has_full_text() {
        let fts = table.fts_table();
        conn.execute(&format!("DELETE FROM {} WHERE rowid = ?1", fts), params![id])?;

        let full_text: Vec<&SoupIndex> = table
            .indexes
            .iter()
            .filter(|idx| idx.index_type == IndexType::FullText && idx.column_name.is_some())
            .collect();
        let columns: Vec<&str> = full_text
            .iter()
            .filter_map(|idx| idx.column_name.as_deref())
            .collect();
        let placeholders = vec!["?"; columns.len() + 1].join(", ");
        let mut fts_values = vec![SqlValue::Integer(id)];
        fts_values.extend(full_text.iter().map(|idx| idx.materialize(doc)));
        conn.execute(
            &format!(
                "INSERT INTO {} (rowid, {}) VALUES ({})",
                fts,
                columns.join(", "),
                placeholders
            ),
            params_from_iter(fts_values.iter()),
        )?;
    }
    Ok(true)
}

fn delete_row(conn: &Connection, table: &SoupTable, id: EntryId) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", table.table_name),
        params![id],
    )?;
    if table.has_full_text() {
        conn.execute(
            &format!("DELETE FROM {} WHERE rowid = ?1", table.fts_table()),
            params![id],
        )?;
    }
    if table.external_storage {
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", table.ext_table()),
            params![id],
        )?;
    }
    Ok(())
}

fn upsert_row(
    conn: &Connection,
    table: &SoupTable,
    entry: Value,
    external_id_path: Option<&str>,
    now: Timestamp,
) -> Result<Value> {
    let Value::Object(_) = &entry else {
        return Err(Error::InvalidEntry(format!(
            "entries must be JSON objects, got {}",
            entry
        )));
    };
    let mut doc = entry;

    let existing = match doc.get(SOUP_ENTRY_ID) {
        None | Some(Value::Null) => match external_id_path {
            Some(path) => lookup_external_id(conn, table, path, &doc)?,
            None => None,
        },
        Some(value) => Some(value.as_i64().ok_or_else(|| {
            Error::InvalidEntry(format!("{} must be an integer, got {}", SOUP_ENTRY_ID, value))
        })?),
    };

    let id = match existing {
        Some(id) => id,
        None => insert_placeholder(conn, table, None, now, now)?,
    };

    if let Some(map) = doc.as_object_mut() {
        map.insert(SOUP_ENTRY_ID.to_string(), Value::from(id));
        map.insert(SOUP_LAST_MODIFIED_DATE.to_string(), Value::from(now));
    }

    if !write_row(conn, table, id, &doc, now)? {
        return Err(Error::EntryNotFound {
            soup: table.soup_name.clone(),
            id,
        });
    }
    Ok(doc)
}

fn lookup_external_id(
    conn: &Connection,
    table: &SoupTable,
    path: &str,
    doc: &Value,
) -> Result<Option<EntryId>> {
    index::validate_path(path)?;
    let Some(value) = json_path::project(doc, path).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let bind = match table.index_for(path) {
        Some(idx) => index::to_sql_value(&value, idx.index_type),
        None => index::bind_value(&value),
    };
    let (expr, _) = table.column_expr(path);

    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE {} = ?1",
        table.table_name, expr
    ))?;
    let ids = stmt
        .query_map(params![bind], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    match ids.as_slice() {
        [] => Ok(None),
        [id] => Ok(Some(*id)),
        _ => Err(Error::MultipleMatchesForExternalId {
            soup: table.soup_name.clone(),
            path: path.to_string(),
            value: value
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| value.to_string()),
            count: ids.len(),
        }),
    }
}

fn retrieve_rows(conn: &Connection, table: &SoupTable, ids: &[EntryId]) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {t} WHERE {t}.id = ?1",
        table.document_expr(),
        t = table.table_name
    ))?;
    let mut entries = Vec::with_capacity(ids.len());
    for id in ids {
        let text: Option<Option<String>> = stmt
            .query_row(params![id], |row| row.get(0))
            .optional()?;
        if let Some(text) = text {
            entries.push(parse_document(text)?);
        }
    }
    Ok(entries)
}

// ----------------------------------------------------------------------
// Query execution
// ----------------------------------------------------------------------

/// Validate `spec` against the store and translate it to physical SQL.
fn prepare_query(store: &SoupStore, spec: &QuerySpec) -> Result<(String, Vec<SqlValue>)> {
    spec.validate()?;
    let (smart, binds) = spec.to_smart_sql()?;

    let index_type = match &spec.soup_name {
        Some(soup) if !spec.is_smart() => {
            let table = store.table(soup)?;
            check_index(&table, spec)?
        }
        _ => None,
    };
    let binds = binds
        .iter()
        .map(|value| match index_type {
            Some(index_type) => index::to_sql_value(value, index_type),
            None => index::bind_value(value),
        })
        .collect();

    let sql = smart_sql::translate(&smart, store)?;
    Ok((sql.trim().trim_end_matches(';').to_string(), binds))
}

/// Check the index a query filters on and return its type for bind coercion.
fn check_index(table: &SoupTable, spec: &QuerySpec) -> Result<Option<IndexType>> {
    if let QueryKind::Match {
        index_path: None, ..
    } = &spec.kind
    {
        if !table.has_full_text() {
            return Err(Error::InvalidQuerySpec(format!(
                "soup {} has no full_text index",
                table.soup_name
            )));
        }
        return Ok(None);
    }

    let Some(path) = spec.index_path() else {
        return Ok(None);
    };
    if matches!(path, SOUP_ENTRY_ID | SOUP_LAST_MODIFIED_DATE | SOUP_CREATED_DATE) {
        return match &spec.kind {
            QueryKind::Match { .. } => Err(Error::InvalidQuerySpec(format!(
                "{} is not a full_text index",
                path
            ))),
            QueryKind::Like { .. } => Ok(None),
            _ => Ok(Some(IndexType::Integer)),
        };
    }
    let idx = table.index_for(path).ok_or_else(|| Error::IndexNotFound {
        soup: table.soup_name.clone(),
        path: path.to_string(),
    })?;

    match &spec.kind {
        QueryKind::Match { .. } if idx.index_type != IndexType::FullText => Err(
            Error::InvalidQuerySpec(format!("{} is not a full_text index", path)),
        ),
        QueryKind::Match { .. } | QueryKind::Like { .. } => Ok(None),
        _ => Ok(Some(idx.index_type)),
    }
}

fn query_page(
    conn: &Connection,
    store: &SoupStore,
    spec: &QuerySpec,
    page_index: usize,
) -> Result<QueryPage> {
    let (sql, binds) = prepare_query(store, spec)?;
    let total_count = count_rows(conn, &sql, &binds)?;
    let paged = format!(
        "SELECT * FROM ({}) LIMIT {} OFFSET {}",
        sql,
        spec.page_size,
        page_index.saturating_mul(spec.page_size)
    );
    let entries = read_rows(conn, &paged, &binds, spec.returns_documents())?;
    Ok(QueryPage {
        entries,
        page_index,
        page_size: spec.page_size,
        total_count,
    })
}

fn query_rows(conn: &Connection, store: &SoupStore, spec: &QuerySpec) -> Result<Vec<Value>> {
    let (sql, binds) = prepare_query(store, spec)?;
    read_rows(conn, &sql, &binds, spec.returns_documents())
}

fn count_rows(conn: &Connection, sql: &str, binds: &[SqlValue]) -> Result<usize> {
    let count: i64 = conn.query_row(
        &format!("SELECT count(*) FROM ({})", sql),
        params_from_iter(binds.iter()),
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn read_rows(
    conn: &Connection,
    sql: &str,
    binds: &[SqlValue],
    documents: bool,
) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(sql)?;
    let document_columns: Vec<bool> = stmt
        .column_names()
        .iter()
        .map(|name| is_document_column(name))
        .collect();
    let mut rows = stmt.query(params_from_iter(binds.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if documents {
            out.push(parse_document(row.get(0)?)?);
            continue;
        }
        let mut values = Vec::with_capacity(document_columns.len());
        for (i, document) in document_columns.iter().enumerate() {
            values.push(decode_column(row.get(i)?, *document));
        }
        out.push(Value::Array(values));
    }
    Ok(out)
}

/// Whether a result column is a whole document, i.e. `{soup:_soup}`.
///
/// SQLite names a plain column reference after the column and any other
/// expression after its text, so the external storage lookup is matched
/// by its shape.
fn is_document_column(name: &str) -> bool {
    name == "soup" || (name.starts_with("(SELECT ") && name.contains("_ext.soup FROM "))
}

/// Documents selected through `_soup` come back as JSON text.
fn decode_column(value: SqlValue, document: bool) -> Value {
    match value {
        SqlValue::Text(text) if document => {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        }
        other => index::from_sql_value(other),
    }
}

fn entry_ids(
    conn: &Connection,
    store: &SoupStore,
    soup_name: &str,
    spec: &QuerySpec,
) -> Result<Vec<EntryId>> {
    let id_spec = if spec.is_smart() {
        spec.clone()
    } else {
        QuerySpec {
            soup_name: Some(soup_name.to_string()),
            select_paths: vec![SOUP_ENTRY_ID.to_string()],
            ..spec.clone()
        }
    };
    let rows = query_rows(conn, store, &id_spec)?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get(0).and_then(Value::as_i64))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> SoupStore {
        let store = SoupStore::open_in_memory().unwrap();
        store
            .register_soup(
                "contacts",
                &[
                    IndexSpec::string("Id"),
                    IndexSpec::string("LastName"),
                    IndexSpec::integer("Age"),
                    IndexSpec::full_text("Notes"),
                ],
                false,
            )
            .unwrap();
        store
    }

    #[test]
    fn register_and_describe() {
        let store = test_store();
        assert!(store.soup_exists("contacts"));
        assert_eq!(store.all_soup_names(), vec!["contacts".to_string()]);
        assert_eq!(store.index_specs("contacts").unwrap().len(), 4);
        assert!(store.has_index("contacts", "LastName"));
        assert!(!store.has_index("contacts", "FirstName"));
    }

    #[test]
    fn register_twice_fails() {
        let store = test_store();
        let err = store
            .register_soup("contacts", &[IndexSpec::string("Id")], false)
            .unwrap_err();
        assert!(matches!(err, Error::SoupAlreadyExists(name) if name == "contacts"));
    }

    #[test]
    fn register_with_bad_path_fails() {
        let store = SoupStore::open_in_memory().unwrap();
        let err = store
            .register_soup("bad", &[IndexSpec::string("a..b")], false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidIndexPath { .. }));
        assert!(!store.soup_exists("bad"));
    }

    #[test]
    fn remove_soup_is_idempotent() {
        let store = test_store();
        store.remove_soup("contacts").unwrap();
        store.remove_soup("contacts").unwrap();
        store.remove_soup("never-existed").unwrap();
        assert!(!store.soup_exists("contacts"));
    }

    #[test]
    fn upsert_assigns_reserved_fields() {
        let store = test_store();
        let saved = store
            .upsert_entries(
                "contacts",
                vec![json!({"Id": "1", "LastName": "Alpha"}), json!({"Id": "2"})],
                None,
            )
            .unwrap();
        let first = saved[0][SOUP_ENTRY_ID].as_i64().unwrap();
        let second = saved[1][SOUP_ENTRY_ID].as_i64().unwrap();
        assert!(second > first);
        assert!(saved[0][SOUP_LAST_MODIFIED_DATE].is_i64());
    }

    #[test]
    fn upsert_by_entry_id_updates() {
        let store = test_store();
        let mut saved = store
            .upsert_entry("contacts", json!({"LastName": "Alpha"}), None)
            .unwrap();
        saved["LastName"] = json!("Beta");
        store.upsert_entry("contacts", saved.clone(), None).unwrap();

        let page = store.query(&QuerySpec::all("contacts", 10), 0).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.entries[0]["LastName"], json!("Beta"));
    }

    #[test]
    fn upsert_unknown_entry_id_fails() {
        let store = test_store();
        let err = store
            .upsert_entry("contacts", json!({"_soupEntryId": 99}), None)
            .unwrap_err();
        assert!(matches!(err, Error::EntryNotFound { id: 99, .. }));
    }

    #[test]
    fn upsert_by_external_id() {
        let store = test_store();
        store
            .upsert_entry("contacts", json!({"Id": "003A", "LastName": "Alpha"}), Some("Id"))
            .unwrap();
        store
            .upsert_entry("contacts", json!({"Id": "003A", "LastName": "Gamma"}), Some("Id"))
            .unwrap();

        let page = store.query(&QuerySpec::all("contacts", 10), 0).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.entries[0]["LastName"], json!("Gamma"));
    }

    #[test]
    fn ambiguous_external_id_fails_and_rolls_back() {
        let store = test_store();
        store
            .upsert_entries(
                "contacts",
                vec![json!({"Id": "dup"}), json!({"Id": "dup"})],
                None,
            )
            .unwrap();

        let err = store
            .upsert_entries(
                "contacts",
                vec![json!({"Id": "fresh"}), json!({"Id": "dup"})],
                Some("Id"),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MultipleMatchesForExternalId { count: 2, .. }
        ));
        // The first entry of the failed batch must not be committed.
        let fresh = QuerySpec::exact("contacts", "Id", "fresh", 10);
        assert_eq!(store.count(&fresh).unwrap(), 0);
    }

    #[test]
    fn upsert_into_missing_soup_fails() {
        let store = test_store();
        let err = store
            .upsert_entries("nope", vec![json!({})], None)
            .unwrap_err();
        assert!(matches!(err, Error::SoupNotFound(_)));
    }

    #[test]
    fn non_object_entries_are_rejected() {
        let store = test_store();
        let err = store
            .upsert_entries("contacts", vec![json!([1, 2])], None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEntry(_)));
    }

    #[test]
    fn range_and_like_queries() {
        let store = test_store();
        for (name, age) in [("Adams", 20), ("Baker", 35), ("Bates", 50)] {
            store
                .upsert_entry("contacts", json!({"LastName": name, "Age": age}), None)
                .unwrap();
        }

        let range = QuerySpec::range("contacts", "Age", Some(json!(30)), Some(json!(50)), 10);
        let page = store.query(&range, 0).unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.entries[0]["LastName"], json!("Baker"));

        let like = QuerySpec::like("contacts", "LastName", "Ba%", 10);
        assert_eq!(store.count(&like).unwrap(), 2);
    }

    #[test]
    fn paging() {
        let store = test_store();
        let entries = (0..25).map(|i| json!({"Age": i})).collect();
        store.upsert_entries("contacts", entries, None).unwrap();

        let spec = QuerySpec::range("contacts", "Age", None, None, 10);
        let last = store.query(&spec, 2).unwrap();
        assert_eq!(last.total_count, 25);
        assert_eq!(last.entries.len(), 5);
        assert_eq!(last.entries[0]["Age"], json!(20));
        assert!(!last.has_more());
    }

    #[test]
    fn query_on_missing_index_fails() {
        let store = test_store();
        let err = store
            .query(&QuerySpec::exact("contacts", "FirstName", "x", 10), 0)
            .unwrap_err();
        assert!(matches!(err, Error::IndexNotFound { path, .. } if path == "FirstName"));
    }

    #[test]
    fn full_text_match() {
        let store = test_store();
        store
            .upsert_entries(
                "contacts",
                vec![
                    json!({"LastName": "A", "Notes": "met at the conference"}),
                    json!({"LastName": "B", "Notes": "call back next week"}),
                ],
                None,
            )
            .unwrap();

        let spec = QuerySpec::full_text("contacts", Some("Notes".into()), "conference", 10);
        let page = store.query(&spec, 0).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.entries[0]["LastName"], json!("A"));

        // Rewriting the entry refreshes the search index.
        let mut updated = page.entries[0].clone();
        updated["Notes"] = json!("nothing here");
        store.upsert_entry("contacts", updated, None).unwrap();
        assert_eq!(store.count(&spec).unwrap(), 0);
    }

    #[test]
    fn smart_query_returns_columns() {
        let store = test_store();
        store
            .upsert_entries(
                "contacts",
                vec![json!({"LastName": "Alpha", "Age": 3}), json!({"LastName": "Beta", "Age": 4})],
                None,
            )
            .unwrap();

        let spec = QuerySpec::smart(
            "select {contacts:LastName}, sum({contacts:Age}) from {contacts} \
             group by {contacts:LastName} order by {contacts:LastName}",
            10,
        );
        let page = store.query(&spec, 0).unwrap();
        assert_eq!(page.entries, vec![json!(["Alpha", 3]), json!(["Beta", 4])]);

        let docs = QuerySpec::smart("select {contacts:_soup} from {contacts}", 10);
        let page = store.query(&docs, 0).unwrap();
        assert!(page.entries[0][0].is_object());
    }

    #[test]
    fn brace_strings_in_columns_stay_strings() {
        let store = test_store();
        store
            .upsert_entries(
                "contacts",
                vec![
                    json!({"LastName": "{abc}", "Age": 1}),
                    json!({"LastName": "{\"a\": 1}", "Age": 2}),
                ],
                None,
            )
            .unwrap();

        let spec = QuerySpec::smart(
            "select {contacts:LastName}, {contacts:_soup} from {contacts} order by {contacts:Age}",
            10,
        );
        let page = store.query(&spec, 0).unwrap();
        assert_eq!(page.entries[0][0], json!("{abc}"));
        assert_eq!(page.entries[1][0], json!("{\"a\": 1}"));
        assert_eq!(page.entries[1][1]["Age"], json!(2));
    }

    #[test]
    fn reserved_paths_are_queryable() {
        let store = test_store();
        let saved = store
            .upsert_entries(
                "contacts",
                vec![json!({"LastName": "A"}), json!({"LastName": "B"}), json!({"LastName": "C"})],
                None,
            )
            .unwrap();
        let second = saved[1][SOUP_ENTRY_ID].as_i64().unwrap();

        let exact = QuerySpec::exact("contacts", SOUP_ENTRY_ID, second, 10);
        let page = store.query(&exact, 0).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.entries[0]["LastName"], json!("B"));

        let range = QuerySpec::range("contacts", SOUP_LAST_MODIFIED_DATE, Some(json!(0)), None, 10);
        assert_eq!(store.count(&range).unwrap(), 3);
    }

    #[test]
    fn fractional_key_does_not_match_integer_index() {
        let store = test_store();
        store
            .upsert_entry("contacts", json!({"LastName": "Three", "Age": 3}), None)
            .unwrap();

        assert_eq!(store.count(&QuerySpec::exact("contacts", "Age", 3.7, 10)).unwrap(), 0);
        assert_eq!(store.count(&QuerySpec::exact("contacts", "Age", 3, 10)).unwrap(), 1);
    }

    #[test]
    fn retrieve_and_remove() {
        let store = test_store();
        let saved = store
            .upsert_entries("contacts", vec![json!({"Id": "1"}), json!({"Id": "2"})], None)
            .unwrap();
        let ids: Vec<EntryId> = saved
            .iter()
            .map(|e| e[SOUP_ENTRY_ID].as_i64().unwrap())
            .collect();

        let found = store.retrieve_entries("contacts", &[ids[1], 12345]).unwrap();
        assert_eq!(found, vec![saved[1].clone()]);

        store.remove_entries("contacts", &ids[..1]).unwrap();
        assert_eq!(store.count(&QuerySpec::all("contacts", 10)).unwrap(), 1);
    }

    #[test]
    fn remove_by_query_and_clear() {
        let store = test_store();
        store
            .upsert_entries(
                "contacts",
                vec![
                    json!({"LastName": "Alpha"}),
                    json!({"LastName": "Alpha"}),
                    json!({"LastName": "Beta"}),
                ],
                None,
            )
            .unwrap();

        let removed = store
            .remove_entries_by_query(
                "contacts",
                &QuerySpec::exact("contacts", "LastName", "Alpha", 10),
            )
            .unwrap();
        assert_eq!(removed, 2);

        store.clear_soup("contacts").unwrap();
        assert_eq!(store.count(&QuerySpec::all("contacts", 10)).unwrap(), 0);
        assert!(store.soup_exists("contacts"));
    }

    #[test]
    fn transaction_rolls_back_across_soups() {
        let store = test_store();
        store
            .register_soup("accounts", &[IndexSpec::string("Id")], false)
            .unwrap();

        let result: Result<()> = store.transaction(|txn| {
            txn.upsert_entry("accounts", json!({"Id": "001"}), None)?;
            txn.upsert_entry("missing", json!({"Id": "x"}), None)?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(store.count(&QuerySpec::all("accounts", 10)).unwrap(), 0);
    }

    #[test]
    fn alter_soup_rematerializes() {
        let store = test_store();
        store
            .upsert_entry("contacts", json!({"LastName": "Alpha", "FirstName": "Ann"}), None)
            .unwrap();

        store
            .alter_soup(
                "contacts",
                &[IndexSpec::string("LastName"), IndexSpec::string("FirstName")],
                false,
            )
            .unwrap();

        let spec = QuerySpec::exact("contacts", "FirstName", "Ann", 10);
        let page = store.query(&spec, 0).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.entries[0]["LastName"], json!("Alpha"));
        assert!(!store.has_index("contacts", "Age"));
    }

    #[test]
    fn external_storage_round_trip() {
        let store = SoupStore::open_in_memory().unwrap();
        store
            .register_soup("blobs", &[IndexSpec::string("key")], true)
            .unwrap();
        let doc = json!({"key": "k1", "payload": {"big": [1, 2, 3]}});
        let saved = store.upsert_entry("blobs", doc, None).unwrap();

        let page = store
            .query(&QuerySpec::exact("blobs", "key", "k1", 10), 0)
            .unwrap();
        assert_eq!(page.entries, vec![saved]);
    }

    #[test]
    fn reopen_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.db");
        {
            let store = SoupStore::open(&path).unwrap();
            store
                .register_soup("contacts", &[IndexSpec::string("LastName")], false)
                .unwrap();
            store
                .upsert_entry("contacts", json!({"LastName": "Alpha"}), None)
                .unwrap();
        }

        let store = SoupStore::open(&path).unwrap();
        assert!(store.has_index("contacts", "LastName"));
        let spec = QuerySpec::exact("contacts", "LastName", "Alpha", 10);
        assert_eq!(store.count(&spec).unwrap(), 1);
    }
}
