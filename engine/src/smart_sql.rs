//! SmartQuery translation.
//!
//! Smart SQL is ordinary SQLite SQL in which soups and JSON paths are named
//! through braces instead of physical tables and columns:
//!
//! - `{soup}` is the soup's table
//! - `{soup:path}` is the indexed column for `path`, or a `json_extract`
//!   over the stored document when `path` is not indexed
//! - `{soup:_soup}`, `{soup:_soupEntryId}`, `{soup:_soupLastModifiedDate}`
//!   and `{soup:_soupCreatedDate}` are the document and row bookkeeping
//!
//! Everything outside braces, and anything inside single-quoted literals,
//! is copied through untouched.

use crate::index::{
    validate_path, IndexType, SoupIndex, SOUP, SOUP_CREATED_DATE, SOUP_ENTRY_ID,
    SOUP_LAST_MODIFIED_DATE,
};
use crate::{error::Result, Error, SoupName};

/// Physical layout of one registered soup.
#[derive(Debug, Clone, PartialEq)]
pub struct SoupTable {
    pub soup_name: SoupName,
    /// e.g. `TABLE_3`
    pub table_name: String,
    pub indexes: Vec<SoupIndex>,
    pub external_storage: bool,
}

impl SoupTable {
    /// Find the index declared on `path`.
    pub fn index_for(&self, path: &str) -> Option<&SoupIndex> {
        self.indexes.iter().find(|idx| idx.path == path)
    }

    /// Name of the FTS5 table mirroring full-text indexes.
    pub fn fts_table(&self) -> String {
        format!("{}_fts", self.table_name)
    }

    /// Name of the side table holding documents for external storage.
    pub fn ext_table(&self) -> String {
        format!("{}_ext", self.table_name)
    }

    pub fn has_full_text(&self) -> bool {
        self.indexes
            .iter()
            .any(|idx| idx.index_type == IndexType::FullText)
    }

    /// SQL expression yielding the raw JSON document.
    pub fn document_expr(&self) -> String {
        if self.external_storage {
            let ext = self.ext_table();
            format!(
                "(SELECT {ext}.soup FROM {ext} WHERE {ext}.id = {t}.id)",
                ext = ext,
                t = self.table_name
            )
        } else {
            format!("{}.soup", self.table_name)
        }
    }

    fn json_extract(&self, path: &str) -> String {
        format!("json_extract({}, '$.{}')", self.document_expr(), path)
    }

    /// Physical expression for `path`, and whether it is backed by an index.
    ///
    /// `path` must already be a valid path or a reserved one.
    pub fn column_expr(&self, path: &str) -> (String, bool) {
        match path {
            SOUP => (self.document_expr(), false),
            SOUP_ENTRY_ID => (format!("{}.id", self.table_name), true),
            SOUP_LAST_MODIFIED_DATE => (format!("{}.lastModified", self.table_name), true),
            SOUP_CREATED_DATE => (format!("{}.created", self.table_name), true),
            _ => match self.index_for(path) {
                Some(SoupIndex {
                    column_name: Some(column),
                    ..
                }) => (column.clone(), true),
                Some(_) => (self.json_extract(path), true),
                None => (self.json_extract(path), false),
            },
        }
    }
}

fn is_reserved(path: &str) -> bool {
    matches!(
        path,
        SOUP | SOUP_ENTRY_ID | SOUP_LAST_MODIFIED_DATE | SOUP_CREATED_DATE
    )
}

/// Resolves soup names to their physical layout.
pub trait SoupSchemaLookup {
    fn soup_table(&self, soup_name: &str) -> Option<SoupTable>;
}

#[derive(Debug)]
enum Piece {
    Text(String),
    Table(String),
    Column(ColumnRef),
}

#[derive(Debug)]
struct ColumnRef {
    soup: String,
    path: String,
    sql: String,
    indexed: bool,
}

impl Piece {
    fn sql(&self) -> &str {
        match self {
            Piece::Text(s) | Piece::Table(s) => s,
            Piece::Column(c) => &c.sql,
        }
    }
}

const COMPARISON_OPERATORS: [&str; 8] = ["=", "==", "!=", "<>", "<", "<=", ">", ">="];

/// Translate smart SQL into physical SQL.
pub fn translate(smart_sql: &str, lookup: &impl SoupSchemaLookup) -> Result<String> {
    let pieces = Translator::new(smart_sql, lookup).run()?;
    check_join_predicates(&pieces)?;
    Ok(pieces.iter().map(Piece::sql).collect())
}

struct Translator<'a, L: SoupSchemaLookup> {
    input: Vec<char>,
    position: usize,
    lookup: &'a L,
}

impl<'a, L: SoupSchemaLookup> Translator<'a, L> {
    fn new(input: &str, lookup: &'a L) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            lookup,
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn run(mut self) -> Result<Vec<Piece>> {
        let mut pieces = Vec::new();
        let mut text = String::new();
        let mut in_literal = false;

        while let Some(c) = self.current() {
            if in_literal {
                text.push(c);
                if c == '\'' {
                    in_literal = false;
                }
                self.position += 1;
                continue;
            }
            match c {
                '\'' => {
                    in_literal = true;
                    text.push(c);
                    self.position += 1;
                }
                '{' => {
                    if !text.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut text)));
                    }
                    let reference = self.read_reference()?;
                    pieces.push(self.resolve(&reference)?);
                }
                '}' => {
                    return Err(Error::MalformedSmartSql(format!(
                        "unmatched '}}' at offset {}",
                        self.position
                    )));
                }
                _ => {
                    text.push(c);
                    self.position += 1;
                }
            }
        }

        if in_literal {
            return Err(Error::MalformedSmartSql("unterminated string literal".into()));
        }
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }
        Ok(pieces)
    }

    fn read_reference(&mut self) -> Result<String> {
        let start = self.position;
        self.position += 1;
        let mut reference = String::new();
        while let Some(c) = self.current() {
            self.position += 1;
            match c {
                '}' => return Ok(reference.trim().to_string()),
                '{' | '\'' => break,
                _ => reference.push(c),
            }
        }
        Err(Error::MalformedSmartSql(format!(
            "unterminated reference at offset {}",
            start
        )))
    }

    fn resolve(&self, reference: &str) -> Result<Piece> {
        let (soup, path) = match reference.split_once(':') {
            Some((soup, path)) => (soup.trim(), Some(path.trim())),
            None => (reference, None),
        };
        if soup.is_empty() {
            return Err(Error::MalformedSmartSql(format!(
                "empty soup name in {{{}}}",
                reference
            )));
        }
        let table = self
            .lookup
            .soup_table(soup)
            .ok_or_else(|| Error::UnknownSoup(soup.to_string()))?;

        let Some(path) = path else {
            return Ok(Piece::Table(table.table_name));
        };

        if !is_reserved(path) {
            validate_path(path).map_err(|e| Error::MalformedSmartSql(e.to_string()))?;
        }
        let (sql, indexed) = table.column_expr(path);

        Ok(Piece::Column(ColumnRef {
            soup: soup.to_string(),
            path: path.to_string(),
            sql,
            indexed,
        }))
    }
}

/// Reject `{a:x} <op> {b:y}` across two soups unless both sides are indexed.
fn check_join_predicates(pieces: &[Piece]) -> Result<()> {
    for window in pieces.windows(3) {
        let [Piece::Column(left), Piece::Text(op), Piece::Column(right)] = window else {
            continue;
        };
        if left.soup == right.soup || !COMPARISON_OPERATORS.contains(&op.trim()) {
            continue;
        }
        for side in [left, right] {
            if !side.indexed {
                return Err(Error::UnindexedPathInJoin {
                    soup: side.soup.clone(),
                    path: side.path.clone(),
                });
            }
        }
    }
    Ok(())
}
