//! Native command execution through a shell subprocess

use crate::runtime::{CommandOutput, CommandRunner, RunnerError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs commands as `<program> <args...> <command>`, `sh -c` by default.
///
/// Each command gets its own process group. The whole group is killed
/// once the shell exits, times out or is cancelled, so background jobs
/// and grandchildren never outlive their step.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    program: String,
    args: Vec<String>,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another shell, e.g. `bash -eo pipefail -c`
    pub fn with_shell(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        workdir: &Path,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunnerError> {
        debug!(
            "Spawning {} in {} (timeout {:?})",
            self.program,
            workdir.display(),
            limit
        );

        let mut process = Command::new(&self.program);
        process
            .args(&self.args)
            .arg(command)
            .current_dir(workdir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process.spawn().map_err(|e| RunnerError::Spawn {
            program: self.program.clone(),
            message: e.to_string(),
        })?;
        let mut group = ProcessGroup::new(child.id());

        // Drain both pipes while waiting so a chatty command cannot block
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let waited = tokio::select! {
            status = child.wait() => status.map_err(RunnerError::from),
            _ = tokio::time::sleep(limit) => Err(RunnerError::Timeout(limit)),
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
        };

        // Leftover background jobs go with the shell
        group.kill();

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                match &e {
                    RunnerError::Timeout(_) => warn!("Command timed out after {:?}", limit),
                    RunnerError::Cancelled => warn!("Command cancelled"),
                    _ => {}
                }
                let _ = child.start_kill();
                if let Err(wait_err) = child.wait().await {
                    warn!("Failed to reap {}: {}", self.program, wait_err);
                }
                stdout.abort();
                stderr.abort();
                return Err(e);
            }
        };

        let exit_code = status.code();
        debug!("Command exited with {:?}", exit_code);

        Ok(CommandOutput {
            exit_code,
            stdout: collect(stdout).await?,
            stderr: collect(stderr).await?,
        })
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok(buf)
    })
}

async fn collect(handle: JoinHandle<std::io::Result<Vec<u8>>>) -> Result<String, RunnerError> {
    let bytes = handle.await.map_err(std::io::Error::other)??;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Kills the process group led by the spawned shell, at the latest on drop
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self { leader }
    }

    fn kill(&mut self) {
        if let Some(pid) = self.leader.take() {
            kill_group(pid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created by process_group(0)
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        // ESRCH: every member has already exited
        debug!(
            "killpg({}) failed: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}
