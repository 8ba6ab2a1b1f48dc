// Payload codec shared by cache values, pub/sub messages, and stream entries.
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::core::error::{Error, ErrorKind};

/// Decides how each object field is written: `Some(name)` keeps it under `name`, `None` omits it.
pub trait FieldPolicy: Send + Sync {
    fn resolve(&self, field: &str) -> Option<String>;
}

impl<F> FieldPolicy for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn resolve(&self, field: &str) -> Option<String> {
        self(field)
    }
}

#[derive(Clone, Debug, Default)]
pub struct OmitFields {
    fields: HashSet<String>,
}

impl OmitFields {
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

impl FieldPolicy for OmitFields {
    fn resolve(&self, field: &str) -> Option<String> {
        if self.fields.contains(field) {
            None
        } else {
            Some(field.to_string())
        }
    }
}

/// Rewrites `snake_case` field names as `camelCase`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CamelCaseFields;

impl FieldPolicy for CamelCaseFields {
    fn resolve(&self, field: &str) -> Option<String> {
        let mut out = String::with_capacity(field.len());
        let mut upper_next = false;
        for ch in field.chars() {
            if ch == '_' {
                upper_next = !out.is_empty();
                continue;
            }
            if upper_next {
                out.extend(ch.to_uppercase());
                upper_next = false;
            } else {
                out.push(ch);
            }
        }
        Some(out)
    }
}

pub trait Codec: Clone + Send + Sync + 'static {
    fn serialize<T>(&self, value: &T, policy: Option<&dyn FieldPolicy>) -> Result<Bytes, Error>
    where
        T: Serialize + ?Sized;

    /// Empty payloads decode to `T::default()`.
    fn deserialize<T>(&self, payload: &[u8]) -> Result<T, Error>
    where
        T: DeserializeOwned + Default;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize<T>(&self, value: &T, policy: Option<&dyn FieldPolicy>) -> Result<Bytes, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = match policy {
            None => serde_json::to_vec(value),
            Some(policy) => {
                let tree = serde_json::to_value(value).map_err(|err| serialize_error::<T>(err))?;
                serde_json::to_vec(&apply_policy(tree, policy))
            }
        };
        encoded
            .map(Bytes::from)
            .map_err(|err| serialize_error::<T>(err))
    }

    fn deserialize<T>(&self, payload: &[u8]) -> Result<T, Error>
    where
        T: DeserializeOwned + Default,
    {
        if payload.is_empty() {
            return Ok(T::default());
        }
        // serde_json messages quote the offending input, so only its position is kept.
        serde_json::from_slice(payload).map_err(|err| {
            Error::new(ErrorKind::Deserialization)
                .with_message(format!(
                    "invalid json payload ({:?} error at line {} column {})",
                    err.classify(),
                    err.line(),
                    err.column()
                ))
                .with_type_name(std::any::type_name::<T>())
                .with_payload_len(payload.len())
        })
    }
}

fn serialize_error<T: ?Sized>(err: serde_json::Error) -> Error {
    Error::new(ErrorKind::Serialization)
        .with_message("failed to encode value")
        .with_type_name(std::any::type_name::<T>())
        .with_source(err)
}

fn apply_policy(value: Value, policy: &dyn FieldPolicy) -> Value {
    match value {
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (name, field) in fields {
                if let Some(renamed) = policy.resolve(&name) {
                    out.insert(renamed, apply_policy(field, policy));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| apply_policy(item, policy))
                .collect(),
        ),
        other => other,
    }
}
