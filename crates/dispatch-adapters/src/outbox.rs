//! Canal de notificación "outbox": cada envío es un fichero JSON en
//! `<dir>/<canal>/`. Un proceso aparte hace la entrega física y borra el
//! fichero; aquí sólo importa si la escritura tuvo éxito.

use std::fs;
use std::path::{Path, PathBuf};

use dispatch_core::{JobStatus, UserIdentity};
use dispatch_policies::{NotificationChannel, NotificationContext, Recipient, RecipientSource};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub channel: String,
    pub recipient: String,
    pub status: JobStatus,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct OutboxChannel {
    name: String,
    dir: PathBuf,
    source: RecipientSource,
}

impl OutboxChannel {
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>, source: RecipientSource) -> Self {
        let name = name.into();
        let dir = root.as_ref().join(&name);
        Self { name, dir, source }
    }

    pub fn email(root: impl AsRef<Path>) -> Self {
        Self::new("email", root, RecipientSource::Email)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Mensajes aún no entregados, en orden de nombre (= orden de escritura).
    pub fn pending(&self) -> std::io::Result<Vec<OutboxMessage>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?.filter_map(|e| e.ok().map(|e| e.path()))
                                                              .filter(|p| p.extension().is_some_and(|e| e == "json"))
                                                              .collect();
        paths.sort();
        let mut out = vec![];
        for p in paths {
            let raw = fs::read(&p)?;
            if let Ok(m) = serde_json::from_slice(&raw) {
                out.push(m);
            }
        }
        Ok(out)
    }
}

impl NotificationChannel for OutboxChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn recipient(&self, identity: &UserIdentity) -> Option<Recipient> {
        self.source.resolve(identity)
    }

    fn send(&self, recipient: &Recipient, status: JobStatus, context: &NotificationContext) -> Result<(), String> {
        let message = OutboxMessage { channel: self.name.clone(),
                                      recipient: recipient.address.clone(),
                                      status,
                                      context: serde_json::to_value(context).map_err(|e| e.to_string())? };
        let body = serde_json::to_vec_pretty(&message).map_err(|e| e.to_string())?;
        fs::create_dir_all(&self.dir).map_err(|e| format!("outbox {}: {e}", self.dir.display()))?;
        let file = format!("{}-{}-{}-{}.json",
                           context.at.format("%Y%m%dT%H%M%S%.6f"),
                           context.key.session_id,
                           context.key.job_id,
                           status);
        fs::write(self.dir.join(file), body).map_err(|e| format!("outbox {}: {e}", self.dir.display()))
    }
}
