use std::sync::Arc;

mod plain;

/// Object-safe display interface used by the CLI: log lines go to stderr,
/// the final streamed answer goes to stdout.
#[async_trait::async_trait]
pub trait AnyDisplay: Send + Sync {
    /// Append a text line to the technical readout (stderr).
    async fn show_log(&self, line: &str);

    /// Append a text piece of the final answer (stdout).
    async fn show_delta(&self, s: &str);

    /// Called once the final answer has finished streaming.
    async fn end_answer(&self);
}

/// Dynamically chosen display backend.
pub type Display = Arc<dyn AnyDisplay>;

/// Construct the CLI's display. There is one implementation today; this
/// stays a factory function so a TTY-aware renderer can be added later
/// without touching call sites.
pub fn make_display() -> Display {
    plain::make_display()
}
