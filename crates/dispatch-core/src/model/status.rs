use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;

/// Estado de la máquina de despacho de un registro.
///
/// Transiciones válidas:
/// - `New` -> `Submitted`
/// - `Submitted`/`Progress` -> `Progress`
/// - `Submitted`/`Progress` -> `Ready` | `Done` | `Failed`
/// - `Ready` -> `Done` | `Failed`
/// - en vuelo con más de T_resub sin actualización -> `New` (reenvío)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Submitted,
    Progress,
    Ready,
    Done,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [Self::New, Self::Submitted, Self::Progress, Self::Ready, Self::Done, Self::Failed];

    /// `done` o `failed`: no hay más transiciones para esa ejecución.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Estados en los que el aliasing deja de redirigir (incluye `ready`).
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Ready | Self::Done | Self::Failed)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Submitted | Self::Progress)
    }

    /// Orden monotónico; `Progress -> Progress` se permite aparte.
    fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Submitted => 1,
            Self::Progress => 2,
            Self::Ready => 3,
            Self::Done | Self::Failed => 4,
        }
    }

    /// ¿Es `next` un avance legal desde `self` (sin contar reenvíos)?
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == Self::New {
            return next == Self::Submitted;
        }
        if self == Self::Progress && next == Self::Progress {
            return true;
        }
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Submitted => "submitted",
            Self::Progress => "progress",
            Self::Ready => "ready",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL.into_iter()
                      .find(|st| st.as_str() == s)
                      .ok_or_else(|| DispatchError::RequestNotUnderstood(format!("unknown status '{s}'")))
    }
}
