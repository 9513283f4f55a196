//! Untyped rows exchanged between backends and queryables

use std::cmp::Ordering;

use serde_json::{Map, Value as JsonValue};

use crate::error::Result;
use crate::expression::Element;

/// One row: field name to value
pub type Record = Map<String, JsonValue>;

/// Decode a record into an element type
pub fn decode<T: Element>(record: Record) -> Result<T> {
    Ok(serde_json::from_value(JsonValue::Object(record))?)
}

/// Decode a scalar result into `R`
pub fn decode_value<R: Element>(value: JsonValue) -> Result<R> {
    Ok(serde_json::from_value(value)?)
}

fn type_rank(value: &JsonValue) -> u8 {
    match value {
        JsonValue::Null => 0,
        JsonValue::Bool(_) | JsonValue::Number(_) => 1,
        JsonValue::String(_) => 2,
        JsonValue::Array(_) | JsonValue::Object(_) => 3,
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Bool(b) => Some(f64::from(u8::from(*b))),
        JsonValue::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Total order used for sorting, matching SQLite's ORDER BY
///
/// NULL sorts first, then numbers (booleans count as 0/1), then text, then
/// anything structured.
pub fn sort_cmp(left: &JsonValue, right: &JsonValue) -> Ordering {
    let rank = type_rank(left).cmp(&type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }
    match (left, right) {
        (JsonValue::String(a), JsonValue::String(b)) => a.cmp(b),
        (JsonValue::Null, JsonValue::Null) => Ordering::Equal,
        (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => as_number(left)
                .unwrap_or_default()
                .total_cmp(&as_number(right).unwrap_or_default()),
        },
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            _ => left.to_string().cmp(&right.to_string()),
        },
    }
}

/// Comparison used by predicates: `None` when either side is NULL
pub fn compare(left: &JsonValue, right: &JsonValue) -> Option<Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    Some(sort_cmp(left, right))
}

/// Whether a predicate result selects its row
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

/// SQL `LIKE`: `%` matches any run, `_` one character, ASCII case-insensitive
pub fn like(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.chars().map(|c| c.to_ascii_lowercase()).collect();
    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();

    // Iterative wildcard match with single backtrack point
    let (mut v, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == value[v]) {
            v += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some((p, v));
            p += 1;
        } else if let Some((star_p, star_v)) = star {
            p = star_p + 1;
            v = star_v + 1;
            star = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sort_cmp_orders_across_types() {
        let mut values = vec![json!("b"), json!(2.5), json!(null), json!(1), json!("a"), json!(true)];
        values.sort_by(sort_cmp);
        assert_eq!(values, vec![json!(null), json!(1), json!(true), json!(2.5), json!("a"), json!("b")]);
    }

    #[test]
    fn test_compare_with_null_is_unknown() {
        assert_eq!(compare(&json!(null), &json!(1)), None);
        assert_eq!(compare(&json!(3), &json!(1.5)), Some(Ordering::Greater));
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like("Widget Pro", "widget%"));
        assert!(like("abc", "a_c"));
        assert!(like("abc", "%"));
        assert!(like("banana", "%an%na"));
        assert!(!like("abc", "a_"));
        assert!(!like("abc", "%d%"));
    }

    #[test]
    fn test_decode_record() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Row {
            id: i64,
            name: String,
        }

        let record = json!({"id": 4, "name": "four"}).as_object().cloned().unwrap();
        let row: Row = decode(record).unwrap();
        assert_eq!(row, Row { id: 4, name: "four".into() });
    }
}
