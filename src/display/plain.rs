use super::AnyDisplay;

struct Plain;

#[async_trait::async_trait]
impl AnyDisplay for Plain {
    async fn show_log(&self, line: &str) {
        eprintln!("{line}");
    }

    async fn show_delta(&self, s: &str) {
        use std::io::Write;
        print!("{s}");
        let _ = std::io::stdout().flush();
    }

    async fn end_answer(&self) {
        println!();
    }
}

/// Minimal stdout display: prints the final answer as it streams and logs
/// to stderr.
pub fn make_display() -> std::sync::Arc<dyn AnyDisplay> {
    std::sync::Arc::new(Plain)
}
