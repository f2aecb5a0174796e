//! Dispatch State Machine.
//!
//! new -> submitted -> {progress}* -> (ready | done | failed), con reenvío
//! forzado cuando un estado en vuelo supera T_resub sin actualizaciones.

mod backend;
mod builder;
mod machine;

pub use backend::{Backend, BackendAck, BackendCallback, PassthroughFinalizer, ResultFinalizer, ScriptedBackend};
pub use builder::DispatchBuilder;
pub use machine::{CallbackOutcome, DispatchConfig, DispatchRequest, DispatchResponse, DispatchStateMachine, QueryStatus};
