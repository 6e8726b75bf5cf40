//! Centralized Docker CLI client.
//!
//! Wraps all `docker` subprocess invocations with consistent timeout
//! handling and structured [`DockerError`] returns. Construct once and
//! thread through the daemon runtime — the struct is cheap (zero-sized
//! today).

use super::DockerError;
use std::process::Output;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

// Docker operation timeouts
const DOCKER_RUN_TIMEOUT: Duration = Duration::from_secs(60);
const DOCKER_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const DOCKER_INSPECT_TIMEOUT: Duration = Duration::from_secs(10);
const DOCKER_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct DockerClient;

impl DockerClient {
    pub fn new() -> Self {
        DockerClient
    }

    /// Run a docker command with a timeout, returning raw Output.
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("docker").args(args).output(),
        )
        .await;

        let cmd_str = format!("docker {}", args.join(" "));

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DockerError::exec_failed(cmd_str, e)),
            Err(_) => Err(DockerError::timeout(cmd_str, timeout)),
        }
    }

    /// Run a docker command with a timeout, returning Output only if exit 0.
    async fn run_success(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let cmd_str = format!("docker {}", args.join(" "));
            Err(DockerError::failed(&cmd_str, &output))
        }
    }

    // ========================================================================
    // Container lifecycle
    // ========================================================================

    /// Create and start a detached container. `args` is everything after
    /// `docker run -d`. Returns the new container id.
    pub async fn run_detached(&self, args: &[String]) -> Result<String, DockerError> {
        let mut full: Vec<&str> = vec!["run", "-d"];
        full.extend(args.iter().map(String::as_str));
        let output = self.run_success(&full, DOCKER_RUN_TIMEOUT).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(DockerError::bad_output(
                "docker run -d",
                "no container id on stdout",
            ));
        }
        Ok(id)
    }

    /// Stop a container gracefully, then force-remove it. The removal runs
    /// regardless of whether the stop succeeded, so a wedged container does
    /// not leak.
    pub async fn stop_and_remove(&self, container: &str) -> Result<(), DockerError> {
        let stop = self.run(&["stop", container], DOCKER_STOP_TIMEOUT).await?;
        let stop_ok = stop.status.success();
        let _ = self.rm_force(container).await;
        if stop_ok {
            Ok(())
        } else {
            Err(DockerError::failed("docker stop", &stop))
        }
    }

    /// Force-remove a container. Returns `Ok(())` if the container doesn't
    /// exist.
    pub async fn rm_force(&self, container: &str) -> Result<(), DockerError> {
        let output = self.run(&["rm", "-f", container], DOCKER_STOP_TIMEOUT).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(DockerError::failed("docker rm -f", &output))
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Check whether a container is running. Errors (daemon down, container
    /// gone) surface so the caller can distinguish "not running" from
    /// "could not ask".
    pub async fn inspect_running(&self, container: &str) -> Result<bool, DockerError> {
        let output = self
            .run_success(
                &["inspect", "-f", "{{.State.Running}}", container],
                DOCKER_INSPECT_TIMEOUT,
            )
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    /// Read a single inspect template field as a trimmed string.
    pub async fn inspect_field(
        &self,
        container: &str,
        template: &str,
    ) -> Result<String, DockerError> {
        let output = self
            .run_success(&["inspect", "-f", template, container], DOCKER_INSPECT_TIMEOUT)
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// One-shot resource usage sample for a container.
    pub async fn stats(&self, container: &str) -> Result<serde_json::Value, DockerError> {
        let output = self
            .run_success(
                &["stats", "--no-stream", "--format", "{{json .}}", container],
                DOCKER_QUERY_TIMEOUT,
            )
            .await?;
        let line = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(line.trim())
            .map_err(|e| DockerError::bad_output("docker stats", e.to_string()))
    }

    /// List local images as one JSON value per image.
    pub async fn list_images(&self) -> Result<Vec<serde_json::Value>, DockerError> {
        let output = self
            .run_success(&["images", "--format", "{{json .}}"], DOCKER_QUERY_TIMEOUT)
            .await?;
        Ok(parse_json_lines(&output.stdout))
    }

    /// List containers as one JSON value per container, optionally filtered
    /// (`docker ps --filter` syntax, e.g. `name=conductor-`).
    pub async fn list_containers(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, DockerError> {
        let mut args = vec!["ps", "-a", "--format", "{{json .}}"];
        if let Some(filter) = filter {
            args.push("--filter");
            args.push(filter);
        }
        let output = self.run_success(&args, DOCKER_QUERY_TIMEOUT).await?;
        Ok(parse_json_lines(&output.stdout))
    }

    /// Fetch container log lines (stdout and stderr interleaved).
    pub async fn logs(&self, container: &str, tail: usize) -> Result<Vec<String>, DockerError> {
        let tail_str = tail.to_string();
        let output = self
            .run_success(&["logs", "--tail", &tail_str, container], DOCKER_QUERY_TIMEOUT)
            .await?;
        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string),
        );
        Ok(lines)
    }

    // ========================================================================
    // Images
    // ========================================================================

    /// Pull an image, streaming progress lines to the returned channel.
    /// The task resolves once the pull finishes; a non-zero exit becomes an
    /// error there rather than on the line stream.
    pub fn pull(
        &self,
        image: &str,
    ) -> (
        mpsc::UnboundedReceiver<String>,
        tokio::task::JoinHandle<Result<(), DockerError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let image = image.to_string();
        let task = tokio::spawn(async move {
            let cmd_str = format!("docker pull {}", image);
            let mut child = tokio::process::Command::new("docker")
                .args(["pull", &image])
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| DockerError::exec_failed(&cmd_str, e))?;

            // Drain both pipes concurrently so neither can fill up and
            // stall the child.
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let drain_stdout = async {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        // Receiver may have been dropped; keep draining so
                        // the child doesn't block on a full pipe.
                        let _ = tx.send(line);
                    }
                }
            };
            let drain_stderr = async {
                let mut buf = String::new();
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                }
                buf
            };
            let ((), stderr_buf) = tokio::join!(drain_stdout, drain_stderr);

            let status = child
                .wait()
                .await
                .map_err(|e| DockerError::exec_failed(&cmd_str, e))?;
            if status.success() {
                Ok(())
            } else {
                Err(DockerError::cmd_failed(
                    cmd_str,
                    stderr_buf.trim(),
                    status.code(),
                ))
            }
        });
        (rx, task)
    }

    /// Remove a local image.
    pub async fn remove_image(&self, image: &str) -> Result<(), DockerError> {
        self.run_success(&["rmi", image], DOCKER_QUERY_TIMEOUT)
            .await
            .map(|_| ())
    }

    // ========================================================================
    // Daemon health
    // ========================================================================

    /// Check that the daemon answers at all.
    pub async fn ping(&self) -> bool {
        match self
            .run(
                &["info", "--format", "{{.ServerVersion}}"],
                Duration::from_secs(5),
            )
            .await
        {
            Ok(o) => o.status.success(),
            Err(_) => false,
        }
    }
}

/// Parse `{{json .}}`-formatted CLI output: one JSON document per line,
/// skipping anything unparseable (docker mixes warnings into stdout on some
/// platforms).
fn parse_json_lines(stdout: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
