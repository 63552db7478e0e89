//! User-facing notifications.
//!
//! Listeners announce how clients should connect, and the daemon reports
//! transport failures and install results, through a [`Notifier`] that is
//! passed in explicitly.  The daemon has no UI, so the default sink writes to
//! the log.

use std::fmt;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

pub trait Notifier: Send + Sync + fmt::Debug {
    fn notify(&self, severity: Severity, title: &str, message: &str);

    fn info(&self, title: &str, message: &str) {
        self.notify(Severity::Info, title, message);
    }

    fn error(&self, title: &str, message: &str) {
        self.notify(Severity::Error, title, message);
    }
}

/// Writes notifications to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, severity: Severity, title: &str, message: &str) {
        match severity {
            Severity::Info => info!(title, "{message}"),
            Severity::Error => warn!(title, "{message}"),
        }
    }
}
