//! cadence-runner: executes scheduled tasks as shell commands.
//!
//! ```rust,no_run
//! use cadence_core::config::RunnerConfig;
//! use cadence_runner::ShellTaskRunner;
//! use cadence_scheduler::{OutputSink, Task, TaskRunner};
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = ShellTaskRunner::new(&RunnerConfig::default());
//!     let sink = OutputSink::new(30_000);
//!     let code = runner.execute(&Task::new("hello", "echo hello"), &sink).await.unwrap();
//!     println!("exit {code}: {}", sink.finish());
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{Result, RunnerError};
pub use shell::ShellTaskRunner;
