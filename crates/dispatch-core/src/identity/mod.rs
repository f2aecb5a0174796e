//! Identity & Validation Service: cálculo y validación de JobIDs, y
//! resolución de credenciales a `UserIdentity`.

mod credentials;
mod service;

pub use credentials::{ClaimsResolver, CredentialResolver};
pub use service::{IdentityService, ParamsSource};
