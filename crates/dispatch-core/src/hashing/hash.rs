//! Hash helpers: blake3 para fingerprints de parámetros, sha256 para contenido
//! de archivos subidos.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use blake3::Hasher;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::canonical_json::to_canonical_json;

/// Hashea un string y devuelve hex (64 chars).
pub fn hash_str(input: &str) -> String {
    let mut h = Hasher::new();
    h.update(input.as_bytes());
    h.finalize().to_hex().to_string()
}

/// Hash del JSON canónico de `value`.
pub fn hash_value(value: &Value) -> String {
    hash_str(&to_canonical_json(value))
}

/// Digest sha256 (hex) del contenido completo de un archivo. Se usa para
/// rastrear la propiedad de artefactos subidos, independiente del JobID.
pub fn fingerprint_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}
