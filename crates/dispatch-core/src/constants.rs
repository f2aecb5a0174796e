//! Constantes del núcleo de despacho.
//!
//! Cambiar `VOLATILE_KEYS` o `JOB_ID_LEN` altera los JobIDs calculados; los
//! registros existentes dejarían de validar contra sus parámetros.

/// Claves excluidas del fingerprint. La mayoría se sigue guardando en el
/// snapshot de parámetros para la ejecución.
pub const VOLATILE_KEYS: &[&str] = &["token",
                                     "session_id",
                                     "job_id",
                                     "query_status",
                                     "dry_run",
                                     "api",
                                     "oda_api_version",
                                     "async_dispatcher",
                                     "off_line",
                                     // reservada para la identidad; nunca se acepta desde la request
                                     "sub"];

/// Sufijo de marcadores de rutas transitorias de archivos subidos.
pub const VOLATILE_KEY_SUFFIX: &str = "_file_path";

/// Claves que nunca se persisten en el snapshot (credenciales).
pub const UNSTORED_KEYS: &[&str] = &["token"];

/// Clave bajo la que la identidad entra en el fingerprint.
pub const IDENTITY_KEY: &str = "sub";

/// Longitud (hex) del JobID.
pub const JOB_ID_LEN: usize = 16;

/// T_resub por defecto en segundos.
pub const DEFAULT_RESUBMIT_TIMEOUT_SECS: i64 = 1800;
