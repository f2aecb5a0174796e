//! dispatch-core: identidad de trabajos por contenido, store de registros,
//! aliasing y máquina de estados de despacho.
pub mod alert;
pub mod alias;
pub mod clock;
pub mod constants;
pub mod dispatch;
pub mod errors;
pub mod gc;
pub mod hashing;
pub mod identity;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod store;

pub use alert::{AlertLevel, AlertSink, LogAlertSink, RecordingAlertSink};
pub use alias::{AliasingController, Resolution};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{Backend, BackendAck, BackendCallback, CallbackOutcome, DispatchBuilder, DispatchConfig,
                   DispatchRequest, DispatchResponse, DispatchStateMachine, PassthroughFinalizer, QueryStatus,
                   ResultFinalizer, ScriptedBackend};
pub use errors::{classify_error, DispatchError, DispatchResult, ErrorClass};
pub use gc::{inspect_record, list_records, RecordAgeInfo};
pub use hashing::{fingerprint, fingerprint_file, fingerprint_with, FingerprintOptions};
pub use identity::{ClaimsResolver, CredentialResolver, IdentityService, ParamsSource};
pub use metrics::{Counter, DispatchMetrics, MetricsSnapshot};
pub use model::{JobId, JobStatus, NotificationEvent, NotificationOutcome, OutputSnapshot, ProgressEntry, RecordKey,
                RecordMeta, RequestParameters, SessionId, StatusDocument, UserIdentity};
pub use notify::{NoopGate, NotificationGate, NotificationReport, TransitionContext};
pub use store::{DispatchClaim, FileJobStore, InMemoryJobStore, JobStore};
