//! dispatchflow
//!
//! Librería de la aplicación: configuración desde entorno y ensamblado de la
//! máquina de despacho con sus colaboradores concretos. La lógica vive en los
//! crates `dispatch-*`.

pub mod config;
pub mod wiring;

pub use config::{AppConfig, CONFIG};
pub use wiring::{build_engine, build_services, build_services_with_clock, build_store, Services, WiringError};
