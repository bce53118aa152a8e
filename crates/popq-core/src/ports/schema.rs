//! PayloadSchema port
//!
//! Full JSON-schema validation is an external concern; the engine only needs
//! a yes/no answer with messages before it writes anything.

use serde_json::Value;

pub trait PayloadSchema: Send + Sync {
    /// `Err` carries one message per violation.
    fn validate(&self, payload: &Value) -> std::result::Result<(), Vec<String>>;
}

impl<F> PayloadSchema for F
where
    F: Fn(&Value) -> std::result::Result<(), Vec<String>> + Send + Sync,
{
    fn validate(&self, payload: &Value) -> std::result::Result<(), Vec<String>> {
        self(payload)
    }
}

/// Requires the payload to be an object containing every listed key.
#[derive(Debug, Clone, Default)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl PayloadSchema for RequiredFields {
    fn validate(&self, payload: &Value) -> std::result::Result<(), Vec<String>> {
        let Some(object) = payload.as_object() else {
            return Err(vec!["payload must be an object".to_string()]);
        };
        let missing: Vec<String> = self
            .fields
            .iter()
            .filter(|field| !object.contains_key(field.as_str()))
            .map(|field| format!("missing required field `{field}`"))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}
