//! Value helpers shared by the interpreter and its collaborators.
//!
//! Program data is plain JSON ([`serde_json::Value`]); this module adds the
//! loose conversions action programs rely on (truthiness, text rendering,
//! numeric coercion) and dotted-path access into nested maps.

use serde_json::{Map, Value};

/// Truthiness of a value in conditions and flag attributes.
///
/// `null`, `false`, `0`, `""`, `"0"`, `"false"` and empty arrays/objects are
/// false; everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(num) => num.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => text_truthy(text),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Truthiness of an attribute string.
pub fn text_truthy(text: &str) -> bool {
    let text = text.trim();
    !(text.is_empty()
        || text == "0"
        || text.eq_ignore_ascii_case("false")
        || text.eq_ignore_ascii_case("no")
        || text.eq_ignore_ascii_case("off"))
}

/// Render a value as text for template substitution.
///
/// Strings are inserted raw, `null` renders empty, containers render as JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(num) => num.to_string(),
        other => other.to_string(),
    }
}

/// Numeric view of a value (numbers and numeric strings).
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(num) => num.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Convert an `f64` into the narrowest JSON number (integers stay integers).
pub fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Resolve a dotted path (`a.b.0.c`) inside a map.
pub fn lookup<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = root.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable variant of [`lookup`].
pub fn lookup_mut<'a>(root: &'a mut Map<String, Value>, path: &str) -> Option<&'a mut Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = root.get_mut(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Assign a value at a dotted path, creating intermediate objects as needed.
///
/// Non-object intermediates are replaced by objects.
pub fn assign(root: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            root.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = root
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(child) = slot {
                assign(child, rest, value);
            }
        }
    }
}

/// Remove the value at a dotted path.
pub fn remove(root: &mut Map<String, Value>, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => root.remove(path),
        Some((parent, last)) => match lookup_mut(root, parent)? {
            Value::Object(map) => map.remove(last),
            _ => None,
        },
    }
}
