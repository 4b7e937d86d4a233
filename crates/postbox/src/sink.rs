//! Diagnostic sink for protocol milestones.

/// Area tag used for every milestone the controller logs.
pub const IPC_AREA: &str = "ipc";

/// Receives human-readable diagnostics at send/receive milestones.
pub trait DiagnosticSink: Send + Sync {
    fn log(&self, text: &str, area: &str);
}

/// Forwards diagnostics to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn log(&self, text: &str, area: &str) {
        tracing::debug!(area, "{}", text);
    }
}

impl<F> DiagnosticSink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn log(&self, text: &str, area: &str) {
        self(text, area)
    }
}
