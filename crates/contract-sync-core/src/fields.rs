use serde_json::Value;
use std::collections::BTreeSet;

/// Entity payload: a JSON object keyed by column name.
pub type Fields = serde_json::Map<String, Value>;

/// Structural kind of a JSON value, used to validate merged payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldKind {
    /// `null`.
    Null,
    /// `true` / `false`.
    Bool,
    /// Any JSON number.
    Number,
    /// A string.
    String,
    /// An array.
    Array,
    /// A nested object.
    Object,
}

impl FieldKind {
    /// Classify a JSON value.
    #[must_use]
    pub const fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Lowercase name for error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Fields present on both sides whose values differ.
#[must_use]
pub fn overlapping_differences(local: &Fields, server: &Fields) -> BTreeSet<String> {
    local
        .iter()
        .filter_map(|(name, value)| match server.get(name) {
            Some(other) if other != value => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// Overlay `overrides` onto a copy of `base`.
#[must_use]
pub fn overlay(base: &Fields, overrides: &Fields) -> Fields {
    let mut merged = base.clone();
    for (name, value) in overrides {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn differences_ignore_fields_missing_on_either_side() {
        let local = fields(json!({ "name": "A", "notes": "draft" }));
        let server = fields(json!({ "name": "B", "status": "active" }));
        let diff = overlapping_differences(&local, &server);
        assert_eq!(diff.into_iter().collect::<Vec<_>>(), vec!["name".to_owned()]);
    }

    #[test]
    fn equal_overlap_yields_no_differences() {
        let local = fields(json!({ "name": "A" }));
        let server = fields(json!({ "name": "A", "updated_at": "2024-01-01" }));
        assert!(overlapping_differences(&local, &server).is_empty());
    }

    #[test]
    fn overlay_only_replaces_touched_fields() {
        let server = fields(json!({ "name": "B", "status": "active" }));
        let local = fields(json!({ "name": "A" }));
        let merged = overlay(&server, &local);
        assert_eq!(Value::Object(merged), json!({ "name": "A", "status": "active" }));
    }

    #[test]
    fn kinds_cover_every_json_shape() {
        assert_eq!(FieldKind::of(&json!(null)), FieldKind::Null);
        assert_eq!(FieldKind::of(&json!(1.5)), FieldKind::Number);
        assert_eq!(FieldKind::of(&json!([1])).as_str(), "array");
        assert_eq!(FieldKind::of(&json!({})), FieldKind::Object);
    }
}
