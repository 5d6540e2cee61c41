//! Request parameters.

use serde::{Deserialize, Serialize};

/// One query parameter. Insertion order is preserved in the request URL;
/// signing sorts independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    /// `None` emits a bare `&key` in the URL.
    pub value: Option<String>,
}

impl Param {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// A parameter sent without a value.
    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Build from an optional value.
    pub fn optional(key: impl Into<String>, value: Option<&str>) -> Self {
        Self {
            key: key.into(),
            value: value.map(|v| v.to_string()),
        }
    }
}

/// Replace the value of `key` (ASCII case-insensitive), or append it.
pub fn set_param(params: &mut Vec<Param>, key: &str, value: &str) {
    match params.iter_mut().find(|p| p.key.eq_ignore_ascii_case(key)) {
        Some(existing) => existing.value = Some(value.to_string()),
        None => params.push(Param::new(key, value)),
    }
}
