//! Fingerprint canónico de parámetros.
//!
//! Para valores compuestos se calcula primero el digest de cada elemento y
//! luego se **ordenan** los sub-digests antes de hashear la colección. Los
//! mapas se convierten en una secuencia de pares (clave, valor) y se tratan
//! igual. Consecuencia conocida: el orden dentro de secuencias se descarta,
//! salvo para los campos marcados explícitamente en `FingerprintOptions`.
//!
//! Dentro de cada par la posición sí cuenta, de modo que `{"a": "b"}` y
//! `{"b": "a"}` no colisionan.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use super::canonical_json::to_canonical_json;
use super::hash::{hash_str, hash_value};

/// Opciones del fingerprint. Por defecto ningún campo es sensible al orden,
/// lo que mantiene compatibles los JobIDs ya emitidos.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintOptions {
    /// Campos de primer nivel cuyo valor secuencia conserva el orden.
    pub ordered_fields: BTreeSet<String>,
}

impl FingerprintOptions {
    pub fn with_ordered_field(mut self, field: impl Into<String>) -> Self {
        self.ordered_fields.insert(field.into());
        self
    }
}

/// Fingerprint con opciones por defecto (todo insensible al orden).
pub fn fingerprint(value: &Value) -> String {
    fingerprint_with(value, &FingerprintOptions::default())
}

pub fn fingerprint_with(value: &Value, options: &FingerprintOptions) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<String> = map.iter()
                                            .map(|(k, v)| {
                                                let inner = if options.ordered_fields.contains(k) {
                                                    ordered_digest(v)
                                                } else {
                                                    digest(v)
                                                };
                                                hash_value(&json!(["pair", k, inner]))
                                            })
                                            .collect();
            pairs.sort();
            hash_value(&json!({ "map": pairs }))
        }
        other => digest(other),
    }
}

fn digest(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let mut subs: Vec<String> = items.iter().map(digest).collect();
            subs.sort();
            hash_value(&json!({ "seq": subs }))
        }
        Value::Object(_) => fingerprint_with(value, &FingerprintOptions::default()),
        scalar => hash_str(&to_canonical_json(scalar)),
    }
}

/// Variante que respeta el orden del primer nivel de la secuencia.
fn ordered_digest(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let subs: Vec<String> = items.iter().map(digest).collect();
            hash_value(&json!({ "ordered_seq": subs }))
        }
        other => digest(other),
    }
}
