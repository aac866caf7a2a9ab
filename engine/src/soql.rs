//! SOQL/SOSL text manipulation and remote timestamp handling.
//!
//! Queries are treated as opaque text. Only clause keywords at the top
//! level (outside parentheses, quotes and SOSL braces) are recognized.

use crate::Timestamp;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Clause keywords that may follow a WHERE condition.
const TRAILING_CLAUSES: [&str; 8] = [
    "GROUP", "ORDER", "LIMIT", "OFFSET", "HAVING", "WITH", "FOR", "UPDATE",
];

/// Format millis since epoch as the remote date-time literal.
pub fn to_iso(millis: Timestamp) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a remote date-time such as `2024-03-01T10:00:00.000+0000`.
pub fn from_iso(value: &str) -> Option<Timestamp> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.timestamp_millis());
    }
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
        .ok()
        .map(|parsed| parsed.timestamp_millis())
}

/// Quote ids for an `IN (...)` list.
pub fn quote_ids<S: AsRef<str>>(ids: &[S]) -> String {
    ids.iter()
        .map(|id| format!("'{}'", id.as_ref().replace('\\', "\\\\").replace('\'', "\\'")))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Keyword {
    position: usize,
    word_end: usize,
}

/// Byte offsets of top-level occurrences of `word` (case-insensitive).
fn find_top_level(text: &str, word: &str) -> Vec<Keyword> {
    let bytes = text.as_bytes();
    let upper = text.to_ascii_uppercase();
    let word = word.to_ascii_uppercase();
    let mut found = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut in_brace = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if in_quote {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == b'\'' {
                in_quote = false;
            }
            i += 1;
            continue;
        }
        if in_brace {
            if c == b'}' {
                in_brace = false;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' => in_quote = true,
            b'{' => in_brace = true,
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0 && upper.as_bytes()[i..].starts_with(word.as_bytes()) => {
                let before_ok = i == 0 || !is_word_byte(bytes[i - 1]);
                let end = i + word.len();
                let after_ok = end >= bytes.len() || !is_word_byte(bytes[end]);
                if before_ok && after_ok {
                    found.push(Keyword {
                        position: i,
                        word_end: end,
                    });
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn first_top_level(text: &str, words: &[&str], from: usize) -> Option<Keyword> {
    words
        .iter()
        .flat_map(|word| find_top_level(text, word))
        .filter(|kw| kw.position >= from)
        .min_by_key(|kw| kw.position)
}

/// Add `predicate` to the WHERE clause found at or after `from`, creating
/// the clause if needed. An existing condition is parenthesized.
fn inject_where(text: &str, from: usize, predicate: &str) -> String {
    if let Some(where_kw) = first_top_level(text, &["WHERE"], from) {
        let end = first_top_level(text, &TRAILING_CLAUSES, where_kw.word_end)
            .map(|kw| kw.position)
            .unwrap_or(text.len());
        let existing = text[where_kw.word_end..end].trim();
        let mut out = format!(
            "{}WHERE {} AND ({})",
            &text[..where_kw.position],
            predicate,
            existing
        );
        if end < text.len() {
            out.push(' ');
            out.push_str(text[end..].trim_start());
        }
        return out;
    }

    let insert_at = first_top_level(text, &TRAILING_CLAUSES, from)
        .map(|kw| kw.position)
        .unwrap_or(text.len());
    let mut out = format!("{} WHERE {}", text[..insert_at].trim_end(), predicate);
    if insert_at < text.len() {
        out.push(' ');
        out.push_str(text[insert_at..].trim_start());
    }
    out
}

fn modified_since(mod_date_field: &str, max_time_stamp: Timestamp) -> String {
    format!("{} > {}", mod_date_field, to_iso(max_time_stamp))
}

/// Restrict a SOQL query to records modified after `max_time_stamp`.
///
/// A non-positive timestamp leaves the query untouched.
pub fn add_modified_since(soql: &str, mod_date_field: &str, max_time_stamp: Timestamp) -> String {
    if max_time_stamp <= 0 {
        return soql.to_string();
    }
    let from = first_top_level(soql, &["FROM"], 0)
        .map(|kw| kw.word_end)
        .unwrap_or(0);
    inject_where(soql, from, &modified_since(mod_date_field, max_time_stamp))
}

/// Make sure the top-level SELECT list contains every field of `fields`.
pub fn ensure_selected(soql: &str, fields: &[&str]) -> String {
    let (Some(select), Some(from)) = (
        first_top_level(soql, &["SELECT"], 0),
        first_top_level(soql, &["FROM"], 0),
    ) else {
        return soql.to_string();
    };
    if from.position <= select.word_end {
        return soql.to_string();
    }

    let list = &soql[select.word_end..from.position];
    let present: Vec<String> = split_top_level(list)
        .iter()
        .map(|f| f.trim().to_ascii_lowercase())
        .collect();
    let missing: Vec<&str> = fields
        .iter()
        .copied()
        .filter(|f| !present.contains(&f.to_ascii_lowercase()))
        .collect();
    if missing.is_empty() {
        return soql.to_string();
    }

    format!(
        "{}{}, {} {}",
        &soql[..select.word_end],
        list.trim_end(),
        missing.join(", "),
        &soql[from.position..]
    )
}

/// Replace the top-level SELECT list with `fields`.
pub fn with_select_list(soql: &str, fields: &[&str]) -> String {
    let (Some(select), Some(from)) = (
        first_top_level(soql, &["SELECT"], 0),
        first_top_level(soql, &["FROM"], 0),
    ) else {
        return soql.to_string();
    };
    if from.position <= select.word_end {
        return soql.to_string();
    }
    format!(
        "{} {} {}",
        &soql[..select.word_end],
        fields.join(", "),
        &soql[from.position..]
    )
}

fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}

/// Whether the query's first ORDER BY key is `field` ascending.
pub fn is_sorted_by(soql: &str, field: &str) -> bool {
    let Some(order) = first_top_level(soql, &["ORDER"], 0) else {
        return false;
    };
    let rest = soql[order.word_end..].trim_start();
    let Some(rest) = rest
        .get(..2)
        .filter(|by| by.eq_ignore_ascii_case("BY"))
        .map(|_| rest[2..].trim_start())
    else {
        return false;
    };
    let first_key = split_top_level(rest)[0];
    let mut words = first_key.split_whitespace();
    words
        .next()
        .is_some_and(|key| key.eq_ignore_ascii_case(field))
        && !words.any(|w| w.eq_ignore_ascii_case("DESC"))
}

/// Restrict every object of a SOSL `RETURNING` clause to records modified
/// after `max_time_stamp`.
pub fn add_modified_since_sosl(
    sosl: &str,
    id_field: &str,
    mod_date_field: &str,
    max_time_stamp: Timestamp,
) -> String {
    if max_time_stamp <= 0 {
        return sosl.to_string();
    }
    let Some(returning) = first_top_level(sosl, &["RETURNING"], 0) else {
        return sosl.to_string();
    };
    let predicate = modified_since(mod_date_field, max_time_stamp);

    let mut out = sosl[..returning.word_end].to_string();
    let rest = &sosl[returning.word_end..];
    let mut i = 0;
    let bytes = rest.as_bytes();

    loop {
        let item_start = i;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let name_start = i;
        while i < bytes.len() && is_word_byte(bytes[i]) {
            i += 1;
        }
        if name_start == i {
            out.push_str(&rest[item_start..]);
            break;
        }
        out.push_str(&rest[item_start..i]);

        let mut j = i;
        while j < bytes.len() && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        if j < bytes.len() && bytes[j] == b'(' {
            let close = matching_paren(rest, j).unwrap_or(rest.len());
            let inner = &rest[j + 1..close.min(rest.len())];
            out.push('(');
            out.push_str(&inject_where(inner, 0, &predicate));
            out.push(')');
            i = (close + 1).min(rest.len());
        } else {
            out.push_str(&format!(
                "({}, {} WHERE {})",
                id_field, mod_date_field, predicate
            ));
        }

        let mut k = i;
        while k < bytes.len() && bytes[k].is_ascii_whitespace() {
            k += 1;
        }
        if k < bytes.len() && bytes[k] == b',' {
            out.push_str(&rest[i..=k]);
            i = k + 1;
        } else {
            out.push_str(&rest[i..]);
            break;
        }
    }
    out
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0;
    let mut in_quote = false;
    for (offset, c) in text[open..].char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}
