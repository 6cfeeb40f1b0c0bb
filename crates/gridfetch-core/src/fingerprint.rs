//! Source fingerprinting from host parameters and active configuration.
//!
//! The fingerprint is the first 16 hex characters of the SHA-256 of a
//! canonical JSON rendering of [`SourceParams`]: object keys sorted at every
//! depth, no insignificant whitespace.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::Fingerprint;

/// Sort order requested by the host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

/// Every host-side parameter that changes which rows a source yields.
///
/// Recognized fields are explicit; anything else the host sends lands in
/// `extra` and still participates in the fingerprint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_processing: Option<String>,
    /// Name of the display/config preset currently applied (e.g. a
    /// secondary config swapped in by a UI toggle).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_config: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl SourceParams {
    /// The parameters as a JSON object, field for field what serializing
    /// them yields. Built by hand so fingerprinting has no failure path.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(sort) = &self.sort {
            let mut spec = Map::new();
            spec.insert("column".into(), Value::String(sort.column.clone()));
            spec.insert("descending".into(), Value::Bool(sort.descending));
            map.insert("sort".into(), Value::Object(spec));
        }
        let named = [
            ("search", &self.search),
            ("post_processing", &self.post_processing),
            ("active_config", &self.active_config),
        ];
        for (name, field) in named {
            if let Some(text) = field {
                map.insert(name.into(), Value::String(text.clone()));
            }
        }
        if !self.extra.is_empty() {
            let extra = self.extra.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            map.insert("extra".into(), Value::Object(extra));
        }
        Value::Object(map)
    }

    /// Convenience for hosts that only pass an opaque bag of outside params.
    pub fn from_extra<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            extra: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            ..Self::default()
        }
    }
}

/// Render a JSON value with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are plain strings; serde_json handles the escaping.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Compute the fingerprint for a parameter set.
pub fn compute_fingerprint(params: &SourceParams) -> Fingerprint {
    fingerprint_value(&params.to_value())
}

/// Fingerprint an arbitrary JSON document (used for opaque host bags).
pub fn fingerprint_value(value: &Value) -> Fingerprint {
    let canonical = canonical_json(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Fingerprint(digest[..16].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_deterministic() {
        let params = SourceParams::from_extra([("outside", json!("A"))]);
        assert_eq!(compute_fingerprint(&params), compute_fingerprint(&params.clone()));
        assert_eq!(compute_fingerprint(&params).as_str().len(), 16);
    }

    #[test]
    fn test_hand_built_value_matches_serde() {
        let params = SourceParams {
            sort: Some(SortSpec {
                column: "price".into(),
                descending: true,
            }),
            search: Some("foo".into()),
            post_processing: None,
            active_config: Some("secondary".into()),
            extra: [("outside".to_string(), json!({"b": 1, "a": [2]}))].into(),
        };
        assert_eq!(params.to_value(), serde_json::to_value(&params).unwrap());
        assert_eq!(
            SourceParams::default().to_value(),
            serde_json::to_value(SourceParams::default()).unwrap()
        );
        assert_ne!(
            compute_fingerprint(&params),
            compute_fingerprint(&SourceParams::default())
        );
    }

    #[test]
    fn test_fingerprint_changes_with_params() {
        let a = SourceParams::from_extra([("outside", json!("A"))]);
        let b = SourceParams::from_extra([("outside", json!("B"))]);
        assert_ne!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn test_toggle_back_reproduces_fingerprint() {
        let a1 = SourceParams::from_extra([("outside", json!("A"))]);
        let a2 = SourceParams::from_extra([("outside", json!("A"))]);
        assert_eq!(compute_fingerprint(&a1), compute_fingerprint(&a2));
    }

    #[test]
    fn test_active_config_participates() {
        let base = SourceParams::default();
        let swapped = SourceParams {
            active_config: Some("secondary".into()),
            ..SourceParams::default()
        };
        assert_ne!(compute_fingerprint(&base), compute_fingerprint(&swapped));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": [1, {"y": 2, "x": 1}], "c": null}});
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":null,"z":[1,{"x":1,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let one = json!({"sort": "a", "filter": {"col": "x", "op": "eq"}});
        let two = json!({"filter": {"op": "eq", "col": "x"}, "sort": "a"});
        assert_eq!(fingerprint_value(&one), fingerprint_value(&two));
    }
}
