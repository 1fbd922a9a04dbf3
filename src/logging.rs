//! Logging hooks
//!
//! Diagnostics normally flow through `tracing`; sessions embedded in hosts
//! with their own logging (language bindings, supervisory frameworks) can
//! install callbacks instead. Two streams are kept apart the way the
//! C-heritage API did with its out/error user-data pointers: ordinary trace
//! lines and error lines. The core never writes to stdout or stderr itself.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

/// A trace sink; closures capture whatever state the host needs
pub type TraceFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-session logger with optional user callbacks
#[derive(Clone, Default)]
pub struct CallbackLogger {
    out: Option<TraceFn>,
    error: Option<TraceFn>,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("out", &self.out.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

impl CallbackLogger {
    /// Logger routing everything to `tracing`
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an ordinary-trace callback
    pub fn with_out(mut self, out: TraceFn) -> Self {
        self.out = Some(out);
        self
    }

    /// Install an error-trace callback
    pub fn with_error(mut self, error: TraceFn) -> Self {
        self.error = Some(error);
        self
    }

    /// Emit an ordinary trace line
    pub fn trace_out(&self, message: &str) {
        match &self.out {
            Some(callback) => callback(message),
            None => debug!("{}", message),
        }
    }

    /// Emit an error trace line
    pub fn trace_error(&self, message: &str) {
        match &self.error {
            Some(callback) => callback(message),
            None => warn!("{}", message),
        }
    }

    /// Hex-dump an outbound frame
    pub fn dump_sent(&self, adu: &[u8]) {
        self.trace_out(&format!("[{}] ->", dump(adu)));
    }

    /// Hex-dump an inbound frame
    pub fn dump_received(&self, adu: &[u8]) {
        self.trace_out(&format!("[{}] <-", dump(adu)));
    }
}

fn dump(adu: &[u8]) -> String {
    adu.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
