use dispatch_core::{JobStatus, UserIdentity};
use dispatch_policies::{NotificationChannel, NotificationContext, Recipient, RecipientSource};
use log::info;

/// Canal que sólo deja constancia en el log (útil en desarrollo).
#[derive(Debug, Clone)]
pub struct LogChannel {
    name: String,
    source: RecipientSource,
}

impl LogChannel {
    pub fn new(name: impl Into<String>, source: RecipientSource) -> Self {
        Self { name: name.into(),
               source }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new("log", RecipientSource::Email)
    }
}

impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn recipient(&self, identity: &UserIdentity) -> Option<Recipient> {
        self.source.resolve(identity)
    }

    fn send(&self, recipient: &Recipient, status: JobStatus, context: &NotificationContext) -> Result<(), String> {
        info!("[{}] to={} record={} {} -> {} elapsed={:?}",
              self.name,
              recipient.address,
              context.key,
              context.previous,
              status,
              context.elapsed_secs);
        Ok(())
    }
}
