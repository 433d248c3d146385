//! Declarative per-tenant validation of file set `meta_info`
//!
//! A tenant may ship `<root>/tenants/<tenant>.schema.json`:
//!
//! ```json
//! {
//!   "allow_unknown": true,
//!   "fields": [
//!     {"field_name": "LotId", "type": "string", "required": true, "max_length": 32},
//!     {"field_name": "InitialTotal", "type": "integer", "min": 1}
//!   ]
//! }
//! ```

use std::path::Path;

use chrono::NaiveDate;
use classif_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaInfoSchema {
    pub fields: Vec<MetaFieldSpec>,
    /// Accept keys not listed in `fields` (logged at warn)
    #[serde(default = "default_allow_unknown")]
    pub allow_unknown: bool,
}

fn default_allow_unknown() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaFieldSpec {
    pub field_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub kind: MetaFieldKind,
}

/// Field type and its constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetaFieldKind {
    String {
        #[serde(default)]
        max_length: Option<usize>,
        #[serde(default)]
        choices: Option<Vec<String>>,
    },
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Float {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Boolean,
    /// `YYYY-MM-DD`
    Date,
}

impl MetaInfoSchema {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
    }

    /// Check `meta_info` against every field spec; the first violation wins
    pub fn validate(&self, meta_info: &Map<String, Value>) -> Result<()> {
        for spec in &self.fields {
            match meta_info.get(&spec.field_name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(Error::Validation(format!(
                            "meta_info.{} is required",
                            spec.field_name
                        )));
                    }
                }
                Some(value) => spec.check(value)?,
            }
        }

        for key in meta_info.keys() {
            if self.fields.iter().any(|f| &f.field_name == key) {
                continue;
            }
            if !self.allow_unknown {
                return Err(Error::Validation(format!("meta_info.{} is not allowed", key)));
            }
            tracing::warn!(field = %key, "meta_info field not declared in tenant schema");
        }

        Ok(())
    }
}

impl MetaFieldSpec {
    fn check(&self, value: &Value) -> Result<()> {
        let name = &self.field_name;
        let invalid = |reason: String| Error::Validation(format!("meta_info.{} {}", name, reason));

        match &self.kind {
            MetaFieldKind::String { max_length, choices } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| invalid("must be a string".to_string()))?;
                if let Some(max) = max_length {
                    if s.chars().count() > *max {
                        return Err(invalid(format!("exceeds {} characters", max)));
                    }
                }
                if let Some(choices) = choices {
                    if !choices.iter().any(|c| c == s) {
                        return Err(invalid(format!("must be one of {:?}", choices)));
                    }
                }
            }
            MetaFieldKind::Integer { min, max } => {
                let n = value
                    .as_i64()
                    .ok_or_else(|| invalid("must be an integer".to_string()))?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(invalid(format!("{} is out of range", n)));
                }
            }
            MetaFieldKind::Float { min, max } => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| invalid("must be a number".to_string()))?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(invalid(format!("{} is out of range", n)));
                }
            }
            MetaFieldKind::Boolean => {
                if !value.is_boolean() {
                    return Err(invalid("must be a boolean".to_string()));
                }
            }
            MetaFieldKind::Date => {
                let s = value
                    .as_str()
                    .ok_or_else(|| invalid("must be a YYYY-MM-DD string".to_string()))?;
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|_| invalid(format!("'{}' is not a YYYY-MM-DD date", s)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> MetaInfoSchema {
        serde_json::from_value(json!({
            "allow_unknown": false,
            "fields": [
                {"field_name": "LotId", "type": "string", "required": true, "max_length": 8},
                {"field_name": "InitialTotal", "type": "integer", "min": 1},
                {"field_name": "Shift", "type": "string", "choices": ["A", "B"]},
                {"field_name": "InspectedOn", "type": "date"}
            ]
        }))
        .unwrap()
    }

    fn meta(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_tagged_field_kinds_deserialize() {
        let schema = schema();
        assert_eq!(
            schema.fields[1].kind,
            MetaFieldKind::Integer {
                min: Some(1),
                max: None
            }
        );
        assert!(!schema.allow_unknown);
    }

    #[test]
    fn test_valid_meta_info_passes() {
        let info = meta(json!({"LotId": "L-1", "InitialTotal": 25, "Shift": "B", "InspectedOn": "2024-02-01"}));
        assert!(schema().validate(&info).is_ok());
    }

    #[test]
    fn test_violations_are_validation_errors() {
        let s = schema();
        for bad in [
            json!({}),
            json!({"LotId": "much-too-long"}),
            json!({"LotId": "L", "InitialTotal": 0}),
            json!({"LotId": "L", "Shift": "C"}),
            json!({"LotId": "L", "InspectedOn": "01/02/2024"}),
            json!({"LotId": "L", "Operator": "x"}),
        ] {
            assert!(
                matches!(s.validate(&meta(bad.clone())), Err(Error::Validation(_))),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn test_unknown_fields_allowed_by_default() {
        let s: MetaInfoSchema = serde_json::from_value(json!({"fields": []})).unwrap();
        assert!(s.validate(&meta(json!({"Anything": 1}))).is_ok());
    }
}
