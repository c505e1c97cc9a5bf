//! Dotted-path helpers over `serde_json::Value`.
//!
//! Paths are `.`-separated; numeric segments index into arrays
//! (`messages.2.tool_call_id`). `set_path` creates intermediate objects for
//! missing object segments but never grows arrays.

use serde_json::{Map, Value};

pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn get_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    get_path(value, path).and_then(Value::as_str)
}

pub fn get_trimmed_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    get_str(value, path)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

pub fn get_i64(value: &Value, path: &str) -> Option<i64> {
    get_path(value, path).and_then(Value::as_i64)
}

pub fn set_path(value: &mut Value, path: &str, new_value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(value, &segments, new_value);
}

fn set_segments(value: &mut Value, segments: &[&str], new_value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *value = new_value;
        return;
    };

    if let Ok(index) = head.parse::<usize>()
        && value.is_array()
    {
        if let Some(slot) = value.as_array_mut().and_then(|items| items.get_mut(index)) {
            set_segments(slot, rest, new_value);
        }
        return;
    }

    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let map = value.as_object_mut().expect("object just ensured");
    let slot = map.entry(head.to_string()).or_insert(Value::Null);
    if rest.is_empty() {
        *slot = new_value;
    } else {
        set_segments(slot, rest, new_value);
    }
}

pub fn delete_path(value: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = value;
    for segment in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(next) => next,
                None => return,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(next) => next,
                None => return,
            },
            _ => return,
        };
    }
    match current {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            if let Ok(index) = last.parse::<usize>()
                && index < items.len()
            {
                items.remove(index);
            }
        }
        _ => {}
    }
}

pub fn parse(bytes: &[u8]) -> Option<Value> {
    serde_json::from_slice(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_traverses_objects_and_arrays() {
        let value = json!({"messages": [{"role": "tool"}, {"role": "assistant", "id": 7}]});
        assert_eq!(get_str(&value, "messages.0.role"), Some("tool"));
        assert_eq!(get_i64(&value, "messages.1.id"), Some(7));
        assert!(get_path(&value, "messages.5.role").is_none());
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut value = json!({});
        set_path(&mut value, "reasoning.effort", json!("high"));
        assert_eq!(value, json!({"reasoning": {"effort": "high"}}));
    }

    #[test]
    fn set_indexes_into_arrays() {
        let mut value = json!({"messages": [{"role": "tool"}]});
        set_path(&mut value, "messages.0.tool_call_id", json!("call-1"));
        assert_eq!(get_str(&value, "messages.0.tool_call_id"), Some("call-1"));
    }

    #[test]
    fn delete_removes_leaves() {
        let mut value = json!({"a": {"b": 1, "c": 2}});
        delete_path(&mut value, "a.b");
        assert_eq!(value, json!({"a": {"c": 2}}));
        delete_path(&mut value, "missing.path");
    }

    #[test]
    fn trimmed_str_filters_blank() {
        let value = json!({"user": "  ", "id": " u-1 "});
        assert_eq!(get_trimmed_str(&value, "user"), None);
        assert_eq!(get_trimmed_str(&value, "id"), Some("u-1"));
    }
}
