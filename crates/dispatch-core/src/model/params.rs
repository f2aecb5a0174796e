//! `RequestParameters`: mapa clave -> valor escalar/secuencia de una request.
//!
//! Se conserva el orden de inserción (`IndexMap`) para que el snapshot
//! persistido sea literal. El fingerprint no depende de ese orden.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{UNSTORED_KEYS, VOLATILE_KEYS, VOLATILE_KEY_SUFFIX};
use crate::errors::{DispatchError, DispatchResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestParameters(IndexMap<String, Value>);

impl RequestParameters {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Construye desde un objeto JSON. Rechaza valores mapa en el primer
    /// nivel: la request sólo admite escalares y secuencias.
    pub fn from_value(value: Value) -> DispatchResult<Self> {
        let Value::Object(map) = value else {
            return Err(DispatchError::RequestNotUnderstood("parameters must be a key/value mapping".into()));
        };
        let mut out = IndexMap::with_capacity(map.len());
        for (k, v) in map {
            if k.is_empty() {
                return Err(DispatchError::RequestNotUnderstood("empty parameter name".into()));
            }
            if v.is_object() {
                return Err(DispatchError::RequestNotUnderstood(format!("parameter '{k}' must be a scalar or a sequence")));
            }
            out.insert(k, v);
        }
        Ok(Self(out))
    }

    /// Inserción encadenable (tests y adaptadores).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Interpreta flags enviados como bool o como texto de formulario.
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_volatile(key: &str) -> bool {
        VOLATILE_KEYS.contains(&key) || key.ends_with(VOLATILE_KEY_SUFFIX)
    }

    /// Vista sin claves volátiles, entrada del fingerprint.
    pub fn fingerprint_view(&self) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(k, _)| !Self::is_volatile(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Copia apta para persistir (sin credenciales).
    pub fn stored_view(&self) -> Self {
        Self(self.0
                 .iter()
                 .filter(|(k, _)| !UNSTORED_KEYS.contains(&k.as_str()))
                 .map(|(k, v)| (k.clone(), v.clone()))
                 .collect())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
