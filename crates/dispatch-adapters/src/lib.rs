//! dispatch-adapters: colaboradores concretos de la máquina de despacho.
//!
//! - `spool`: entrega de trabajos al backend vía un directorio spool que lee
//!   el broker externo.
//! - `outbox`: canal de notificación que deja cada mensaje en un directorio
//!   (el envío real lo hace otro proceso).
//! - `log_channel`: canal que sólo escribe en el log.

pub mod log_channel;
pub mod outbox;
pub mod spool;

pub use log_channel::LogChannel;
pub use outbox::{OutboxChannel, OutboxMessage};
pub use spool::{route_callback, SpoolBackend, SpoolTicket};
