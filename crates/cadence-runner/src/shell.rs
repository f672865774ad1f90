use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::RunnerConfig;
use cadence_scheduler::{OutputSink, Task, TaskFault, TaskRunner};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, RunnerError};

/// Exit code reported when the child was terminated by a signal.
const SIGNALLED_EXIT_CODE: i32 = -1;

/// Runs `task.command` through `<shell> -c`.
///
/// stdout and stderr are captured, stripped of ANSI escapes and written to the
/// sink; stderr follows stdout under a separator line. The child is killed if
/// it outlives the configured timeout, and whatever it printed until then is
/// still written to the sink.
#[derive(Debug, Clone)]
pub struct ShellTaskRunner {
    shell: String,
    /// `None` disables the limit.
    timeout: Option<Duration>,
}

impl ShellTaskRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            timeout: (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs)),
        }
    }

    async fn run(&self, task: &Task, sink: &OutputSink) -> Result<i32> {
        debug!(task_id = %task.id, command = %task.sanitized_command, shell = %self.shell, "spawning task");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&task.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {e}", self.shell)))?;

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RunnerError::Spawn("child output was not captured".to_string()));
        };

        // Buffers outlive the collecting future, so a timeout keeps what was read.
        let mut out = Vec::new();
        let mut err = Vec::new();
        let finished = {
            let collect = async {
                let (read_out, read_err, status) = tokio::join!(
                    pump(&mut stdout, &mut out),
                    pump(&mut stderr, &mut err),
                    child.wait(),
                );
                read_out.and(read_err).and(status)
            };
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, collect).await.ok(),
                None => Some(collect.await),
            }
        };

        sink.write(&strip_text(&out));
        let stderr = strip_text(&err);
        if !stderr.is_empty() {
            sink.write("\n--- stderr ---\n");
            sink.write(&stderr);
        }

        let Some(status) = finished else {
            if let Err(e) = child.start_kill() {
                warn!(task_id = %task.id, "failed to kill timed out task: {e}");
            }
            let secs = self.timeout.map_or(0, |limit| limit.as_secs());
            return Err(RunnerError::Timeout { secs });
        };
        let status = status?;

        let code = status.code().unwrap_or_else(|| {
            warn!(task_id = %task.id, %status, "task terminated by signal");
            SIGNALLED_EXIT_CODE
        });
        Ok(code)
    }
}

/// Copy `reader` into `buf` chunk by chunk until EOF. Each chunk lands in
/// `buf` as soon as it is read, so cancelling the future loses nothing.
async fn pump<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[async_trait]
impl TaskRunner for ShellTaskRunner {
    async fn execute(&self, task: &Task, sink: &OutputSink) -> std::result::Result<i32, TaskFault> {
        self.run(task, sink).await.map_err(TaskFault::from)
    }
}

fn strip_text(raw: &[u8]) -> String {
    let clean = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&clean).into_owned()
}
