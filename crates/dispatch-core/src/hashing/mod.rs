//! Módulo de hashing: JSON canónico, digests y fingerprint de parámetros.

pub mod canonical_json;
pub mod fingerprint;
pub mod hash;

pub use canonical_json::to_canonical_json;
pub use fingerprint::{fingerprint, fingerprint_with, FingerprintOptions};
pub use hash::{fingerprint_file, hash_str, hash_value};
