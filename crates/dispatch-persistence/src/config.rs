//! Carga de configuración de conexión desde variables de entorno.
//! Usa convención `DATABASE_URL` y parámetros opcionales de pool.

use std::env;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

use crate::error::PersistenceError;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

pub const DEFAULT_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    /// `None` si `DATABASE_URL` no está definido (el llamador elige otro
    /// store).
    pub fn try_from_env() -> Option<Self> {
        Lazy::force(&DOTENV_LOADED);
        let url = env::var("DATABASE_URL").ok().filter(|u| !u.trim().is_empty())?;
        Some(Self { url,
                    min_connections: env_u32("DATABASE_MIN_CONNECTIONS", DEFAULT_MIN_CONNECTIONS),
                    max_connections: env_u32("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS) })
    }

    pub fn from_env() -> Result<Self, PersistenceError> {
        Self::try_from_env().ok_or_else(|| PersistenceError::Config("DATABASE_URL no definido".into()))
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}
