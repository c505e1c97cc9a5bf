use std::collections::BTreeMap;

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    pub field_type: Option<FieldType>,
    pub required: bool,
    pub enum_values: Vec<String>,
    pub min_int: Option<i64>,
    pub max_int: Option<i64>,
    pub description: String,
}

/// Object schema for tool arguments. Extra properties are rejected unless
/// `additional_allowed` is set.
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    pub fields: BTreeMap<String, FieldSchema>,
    pub additional_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl std::error::Error for ValidationError {}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.issues.first() {
            None => write!(f, "validation failed"),
            Some(issue) if issue.field.is_empty() => write!(f, "{}", issue.message),
            Some(issue) => write!(f, "{}: {}", issue.field, issue.message),
        }
    }
}

impl ValidationError {
    fn add(&mut self, field: &str, code: &str, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            field: field.to_string(),
            code: code.to_string(),
            message: message.into(),
        });
    }
}

/// Parses raw tool arguments as a single JSON object.
pub fn parse_args_object(raw: &str) -> Result<Map<String, Value>, ValidationError> {
    let trimmed = raw.trim();
    let parsed: Value = serde_json::from_str(trimmed).map_err(|err| {
        let mut verr = ValidationError::default();
        verr.add("", "invalid_json", err.to_string());
        verr
    })?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => {
            let mut verr = ValidationError::default();
            verr.add("", "not_object", "tool arguments must be a JSON object");
            Err(verr)
        }
    }
}

impl ObjectSchema {
    pub fn validate_raw(&self, raw: &str) -> Result<Map<String, Value>, ValidationError> {
        let obj = parse_args_object(raw)?;
        self.validate(&obj)?;
        Ok(obj)
    }

    pub fn validate(&self, obj: &Map<String, Value>) -> Result<(), ValidationError> {
        let mut verr = ValidationError::default();

        for (name, field) in &self.fields {
            match obj.get(name) {
                None => {
                    if field.required {
                        verr.add(name, "missing_required", "missing required field");
                    }
                }
                Some(value) => validate_field(&mut verr, name, value, field),
            }
        }

        if !self.additional_allowed {
            for name in obj.keys() {
                if !self.fields.contains_key(name) {
                    verr.add(name, "additional_property", "field is not allowed");
                }
            }
        }

        if verr.issues.is_empty() {
            Ok(())
        } else {
            verr.issues.sort_by(|a, b| {
                a.field.cmp(&b.field).then_with(|| a.code.cmp(&b.code))
            });
            Err(verr)
        }
    }
}

fn validate_field(verr: &mut ValidationError, name: &str, value: &Value, schema: &FieldSchema) {
    if let Some(expected) = schema.field_type
        && !matches_field_type(value, expected)
    {
        verr.add(
            name,
            "invalid_type",
            format!("expected {}, got {}", expected.as_str(), value_type_name(value)),
        );
        return;
    }

    if !schema.enum_values.is_empty() {
        let Some(sv) = value.as_str() else {
            verr.add(name, "invalid_enum_type", "enum validation requires string field");
            return;
        };
        if !schema.enum_values.iter().any(|candidate| candidate == sv) {
            verr.add(
                name,
                "enum",
                format!("must be one of: {}", schema.enum_values.join(", ")),
            );
            return;
        }
    }

    if schema.field_type == Some(FieldType::Integer) {
        let Some(iv) = value.as_i64() else {
            verr.add(name, "invalid_integer", "must be an integer");
            return;
        };
        if let Some(min) = schema.min_int
            && iv < min
        {
            verr.add(name, "min", format!("must be >= {min}"));
        }
        if let Some(max) = schema.max_int
            && iv > max
        {
            verr.add(name, "max", format!("must be <= {max}"));
        }
    }
}

fn matches_field_type(value: &Value, field_type: FieldType) -> bool {
    match field_type {
        FieldType::Object => value.is_object(),
        FieldType::String => value.is_string(),
        // Fractional values are not integers even when JSON writes them bare.
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Array => value.is_array(),
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ObjectSchema {
        let mut fields = BTreeMap::new();
        fields.insert(
            "op".to_string(),
            FieldSchema {
                field_type: Some(FieldType::String),
                required: true,
                enum_values: vec!["add".to_string(), "sub".to_string()],
                ..Default::default()
            },
        );
        fields.insert(
            "count".to_string(),
            FieldSchema {
                field_type: Some(FieldType::Integer),
                min_int: Some(1),
                max_int: Some(10),
                ..Default::default()
            },
        );
        ObjectSchema {
            fields,
            additional_allowed: false,
        }
    }

    #[test]
    fn accepts_valid_object() {
        let obj = schema()
            .validate_raw(r#"{"op":"add","count":3}"#)
            .expect("valid");
        assert_eq!(obj.get("op"), Some(&json!("add")));
    }

    #[test]
    fn rejects_non_object_arguments() {
        let err = parse_args_object("[1,2,3]").expect_err("array is not an object");
        assert_eq!(err.issues[0].code, "not_object");
    }

    #[test]
    fn rejects_missing_required_and_extra_fields() {
        let err = schema()
            .validate_raw(r#"{"count":3,"bogus":true}"#)
            .expect_err("invalid");
        let codes: Vec<&str> = err.issues.iter().map(|issue| issue.code.as_str()).collect();
        assert!(codes.contains(&"missing_required"));
        assert!(codes.contains(&"additional_property"));
    }

    #[test]
    fn rejects_enum_violation() {
        let err = schema()
            .validate_raw(r#"{"op":"mul"}"#)
            .expect_err("invalid enum");
        assert_eq!(err.issues[0].code, "enum");
    }

    #[test]
    fn rejects_integer_bounds_and_fractions() {
        let err = schema()
            .validate_raw(r#"{"op":"add","count":99}"#)
            .expect_err("above max");
        assert_eq!(err.issues[0].code, "max");

        let err = schema()
            .validate_raw(r#"{"op":"add","count":1.5}"#)
            .expect_err("fractional");
        assert_eq!(err.issues[0].code, "invalid_type");
    }

    #[test]
    fn issues_sorted_by_field_then_code() {
        let err = schema()
            .validate_raw(r#"{"zz":1,"aa":2}"#)
            .expect_err("invalid");
        let fields: Vec<&str> = err.issues.iter().map(|issue| issue.field.as_str()).collect();
        assert_eq!(fields, vec!["aa", "op", "zz"]);
    }
}
