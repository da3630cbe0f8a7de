//! Line-oriented progress sinks
//!
//! The bulk reporter pushes fully formatted lines; sinks only write them.

use std::io::Write;
use std::sync::Mutex;

/// Destination for human-readable progress lines
pub trait ProgressSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Writes to standard output
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn write_line(&self, line: &str) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        // a closed stdout (e.g. broken pipe) must not abort a running load
        let _ = writeln!(out, "{}", line);
    }
}

/// Keeps every line in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ProgressSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        sink.write_line("one");
        sink.write_line("two");
        assert_eq!(sink.lines(), vec!["one", "two"]);
    }
}
