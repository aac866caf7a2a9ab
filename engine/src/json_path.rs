//! Dot-delimited path access into JSON documents.
//!
//! Paths like `Account.Name` walk nested objects. When an array is met in
//! the middle of a path the remaining path is projected into each element
//! and the results are collected into an array.

use serde_json::{Map, Value};

/// Project `path` into `doc`.
///
/// Returns `None` if any segment is missing.
pub fn project(doc: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(doc.clone());
    }
    let segments: Vec<&str> = path.split('.').collect();
    project_segments(doc, &segments)
}

fn project_segments(doc: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(doc.clone());
    };

    match doc {
        Value::Object(map) => {
            let child = map.get(*head)?;
            project_segments(child, rest)
        }
        Value::Array(items) => {
            let projected: Vec<Value> = items
                .iter()
                .filter_map(|item| project_segments(item, segments))
                .collect();
            Some(Value::Array(projected))
        }
        _ => None,
    }
}

/// Project `path` and return it as a string if it is a JSON string.
pub fn project_str<'a>(doc: &'a Value, path: &str) -> Option<&'a str> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    current.as_str()
}

/// Set `value` at `path`, creating intermediate objects as needed.
///
/// Non-object intermediates are replaced by objects.
pub fn set(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Read a boolean flag, treating missing values and `0`/`"0"` as false.
pub fn flag(doc: &Value, path: &str) -> bool {
    match project(doc, path) {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn project_nested() {
        let doc = json!({"Account": {"Name": "Acme", "Owner": {"Id": "005"}}});
        assert_eq!(project(&doc, "Account.Name"), Some(json!("Acme")));
        assert_eq!(project(&doc, "Account.Owner.Id"), Some(json!("005")));
        assert_eq!(project(&doc, "Account.Missing"), None);
    }

    #[test]
    fn project_through_arrays() {
        let doc = json!({"Contacts": [{"Name": "a"}, {"Name": "b"}, {"Other": 1}]});
        assert_eq!(project(&doc, "Contacts.Name"), Some(json!(["a", "b"])));
    }

    #[test]
    fn set_creates_intermediates() {
        let mut doc = json!({"Id": "1"});
        set(&mut doc, "attributes.type", json!("Account"));
        assert_eq!(doc, json!({"Id": "1", "attributes": {"type": "Account"}}));

        set(&mut doc, "Id", json!("2"));
        assert_eq!(project_str(&doc, "Id"), Some("2"));
    }

    #[test]
    fn flags() {
        let doc = json!({"a": true, "b": 0, "c": "1", "d": false});
        assert!(flag(&doc, "a"));
        assert!(!flag(&doc, "b"));
        assert!(flag(&doc, "c"));
        assert!(!flag(&doc, "d"));
        assert!(!flag(&doc, "missing"));
    }
}
