//! Modelos del núcleo (parámetros, identidad, ids, estado, registros,
//! notificaciones).

pub mod identity;
pub mod ids;
pub mod notification;
pub mod params;
pub mod record;
pub mod status;

pub use identity::UserIdentity;
pub use ids::{JobId, RecordKey, SessionId};
pub use notification::{NotificationEvent, NotificationOutcome};
pub use params::RequestParameters;
pub use record::{OutputSnapshot, ProgressEntry, RecordMeta, StatusDocument};
pub use status::JobStatus;
