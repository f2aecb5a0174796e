//! Colector de alertas operativas (`capture_message`).
//!
//! Reciben alertas los errores de autorización y los fallos de consistencia
//! del store; el resto sólo va a logs.

use std::fmt;
use std::sync::Mutex;

use log::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Error,
}

pub trait AlertSink: Send + Sync + fmt::Debug {
    fn capture_message(&self, level: AlertLevel, message: &str);
}

/// Implementación por defecto: reenvía al log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn capture_message(&self, level: AlertLevel, message: &str) {
        error!("alert[{level:?}]: {message}");
    }
}

/// Guarda las alertas en memoria (tests / inspección).
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    messages: Mutex<Vec<(AlertLevel, String)>>,
}

impl RecordingAlertSink {
    pub fn messages(&self) -> Vec<(AlertLevel, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl AlertSink for RecordingAlertSink {
    fn capture_message(&self, level: AlertLevel, message: &str) {
        if let Ok(mut m) = self.messages.lock() {
            m.push((level, message.to_string()));
        }
    }
}
