//! Configuración central de la aplicación.
//! Carga variables de entorno (.env) una sola vez y expone `CONFIG`.

use std::env;
use std::path::PathBuf;

use dispatch_persistence::DbConfig;
use once_cell::sync::Lazy;

pub const DEFAULT_STORE_DIR: &str = "./dispatch-store";
pub const DEFAULT_RESUBMIT_TIMEOUT_SECS: i64 = 1800;

/// Configuración global de la aplicación.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Raíz del store de ficheros (si no hay base de datos).
    pub store_dir: PathBuf,
    /// T_resub en segundos.
    pub resubmit_timeout_secs: i64,
    /// Directorio spool que lee el broker del backend.
    pub spool_dir: PathBuf,
    /// Outbox de notificaciones; `None` => sólo log.
    pub outbox_dir: Option<PathBuf>,
    /// `Some` => store Postgres.
    pub database: Option<DbConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dispatch_persistence::init_dotenv();
        let mut cfg = Self::from_lookup(|k| env::var(k).ok());
        cfg.database = DbConfig::try_from_env();
        cfg
    }

    /// Construye la configuración desde una función de búsqueda de claves.
    /// No consulta la base de datos (ver `from_env`).
    pub fn from_lookup<F>(lookup: F) -> Self
        where F: Fn(&str) -> Option<String>
    {
        let non_empty = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());
        let store_dir = non_empty("DISPATCH_STORE_DIR").map(PathBuf::from)
                                                       .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
        let resubmit_timeout_secs = non_empty("DISPATCH_RESUBMIT_TIMEOUT_SECS").and_then(|v| v.parse().ok())
                                                                              .filter(|s: &i64| *s > 0)
                                                                              .unwrap_or(DEFAULT_RESUBMIT_TIMEOUT_SECS);
        let spool_dir = non_empty("DISPATCH_SPOOL_DIR").map(PathBuf::from)
                                                       .unwrap_or_else(|| store_dir.join("spool"));
        Self { outbox_dir: non_empty("DISPATCH_OUTBOX_DIR").map(PathBuf::from),
               store_dir,
               resubmit_timeout_secs,
               spool_dir,
               database: None }
    }

    /// Configuración con todo bajo `root` (demo y tests).
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self { store_dir: root.join("store"),
               resubmit_timeout_secs: DEFAULT_RESUBMIT_TIMEOUT_SECS,
               spool_dir: root.join("spool"),
               outbox_dir: Some(root.join("outbox")),
               database: None }
    }
}

/// Instancia global perezosa de configuración, evaluada una sola vez.
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);
