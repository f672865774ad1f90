use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::truncate::truncate_middle;
use crate::types::Task;

/// Why a task could not produce a result code.
///
/// A fault is recorded like a failed run; it never escapes the worker.
#[derive(Debug, Error)]
pub enum TaskFault {
    #[error("failed to start task: {0}")]
    Spawn(String),

    #[error("task timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("I/O error while running task: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Executes one task to completion.
///
/// Implementations write whatever the task prints into `sink` and return the
/// task's result code; zero means success.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn execute(&self, task: &Task, sink: &OutputSink) -> Result<i32, TaskFault>;
}

/// Collects the output of one run.
///
/// Writers may append freely; the budget is applied once, when the worker
/// takes the text for persistence.
#[derive(Debug)]
pub struct OutputSink {
    buf: Mutex<String>,
    max_chars: usize,
}

impl OutputSink {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buf: Mutex::new(String::new()),
            max_chars,
        }
    }

    pub fn write(&self, text: &str) {
        // A poisoned buffer still holds valid text; keep appending.
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.push_str(text);
    }

    pub fn writeln(&self, line: &str) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.push_str(line);
        buf.push('\n');
    }

    /// Drain the captured output, truncated to the configured budget.
    pub fn finish(&self) -> String {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        truncate_middle(&std::mem::take(&mut *buf), self.max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_applies_budget_on_finish() {
        let sink = OutputSink::new(10);
        sink.writeln("0123456789");
        sink.write("abcdefghij");

        let out = sink.finish();
        assert!(out.starts_with("01234"));
        assert!(out.ends_with("fghij"));
        assert!(out.contains("omitted"));
        assert_eq!(sink.finish(), "", "finish drains the buffer");
    }
}
