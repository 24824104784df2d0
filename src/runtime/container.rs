//! Container runtime backed by the `docker` CLI

use crate::runtime::{
    BuildSpec, BuiltImage, CommandOutput, ContainerRuntime, RunSpec, RunnerError,
    CONTAINER_WORKSPACE,
};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives `docker build` / `docker run` as subprocesses
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a docker-compatible CLI such as `podman`
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_args(&self, spec: &BuildSpec) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            spec.file.display().to_string(),
            "-t".to_string(),
            spec.tag.clone(),
        ];
        for (key, value) in &spec.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.context.display().to_string());
        args
    }

    fn run_args(&self, spec: &RunSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        if let Some(workspace) = &spec.workspace {
            args.push("-v".to_string());
            args.push(format!("{}:{}", workspace.display(), CONTAINER_WORKSPACE));
            args.push("-w".to_string());
            args.push(CONTAINER_WORKSPACE.to_string());
        }
        let mut keys: Vec<&String> = spec.env.keys().collect();
        keys.sort();
        for key in keys {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, spec.env[key]));
        }
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        args
    }

    /// Run the CLI, giving up on timeout or cancellation
    async fn invoke(
        &self,
        args: Vec<String>,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunnerError> {
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        // Dropping the wait future kills the client process
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = tokio::time::sleep(limit) => return Err(RunnerError::Timeout(limit)),
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// `docker rm -f <name>`, awaited; the container may not exist yet
    async fn remove(&self, name: &str) {
        warn!("Force-removing container {}", name);
        let removed = Command::new(&self.program)
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match removed {
            Ok(status) if status.success() => debug!("Removed container {}", name),
            Ok(status) => warn!("Removing container {} exited with {}", name, status),
            Err(e) => warn!("Failed to remove container {}: {}", name, e),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build(
        &self,
        spec: &BuildSpec,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<BuiltImage, RunnerError> {
        info!("Building image {} from {}", spec.tag, spec.file.display());
        let output = self.invoke(self.build_args(spec), limit, cancel).await?;
        if !output.success() {
            warn!("Image build for {} exited with {:?}", spec.tag, output.exit_code);
        }
        Ok(BuiltImage {
            image: spec.tag.clone(),
            output,
        })
    }

    async fn run(
        &self,
        spec: &RunSpec,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunnerError> {
        if spec.image.is_empty() {
            return Err(RunnerError::Container("no image to run".to_string()));
        }
        debug!("Running container {} from {}", spec.name, spec.image);

        let mut guard = RemoveOnDrop::new(&self.program, &spec.name);
        let result = self.invoke(self.run_args(spec), limit, cancel).await;
        match &result {
            // `--rm` already removed a container that exited on its own
            Ok(_) => {}
            // Nothing was started under the name
            Err(RunnerError::Spawn { .. }) => {}
            // Killing the client leaves the container running
            Err(_) => self.remove(&spec.name).await,
        }
        guard.disarm();
        result
    }
}

/// Force-removes a container if the run future is dropped before
/// `DockerCli::run` could remove it itself. Removal is detached here,
/// so callers must not rely on it having finished.
struct RemoveOnDrop {
    program: String,
    name: String,
    armed: bool,
}

impl RemoveOnDrop {
    fn new(program: &str, name: &str) -> Self {
        Self {
            program: program.to_string(),
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Force-removing container {}", self.name);
        let args = ["rm", "-f", self.name.as_str()];
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mut command = Command::new(&self.program);
                command
                    .args(args)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
                handle.spawn(async move {
                    let _ = command.status().await;
                });
            }
            Err(_) => {
                let _ = std::process::Command::new(&self.program)
                    .args(args)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            }
        }
    }
}
