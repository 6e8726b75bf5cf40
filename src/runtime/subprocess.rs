//! Daemonless runtime backend.
//!
//! Workloads run as direct child processes of a container runtime binary
//! (`singularity`-compatible), with no daemon in between. Liveness is an
//! in-memory flag flipped by the child's exit event — there is no durable
//! handle, so a restarted orchestrator cannot recover a previous
//! workload's state.
//!
//! Images are kept as converted files in a configurable directory, one file
//! per `{image}-{digest}`, so pulls can be skipped when the remote digest
//! already exists locally.

use super::{
    ContainerLogs, ContainerSummary, CreatedService, ImageSummary, LaunchOptions, PullStream,
    RuntimeProvider, ServiceHandle,
};
use crate::channel::{ProtocolVersion, ServiceClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Synchronous mutex for fields never held across await points.
type SyncMutex<T> = parking_lot::Mutex<T>;

/// How long a freshly spawned workload gets to prove it didn't crash on
/// boot before we hand out its client.
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// How long a stopped workload gets to exit after SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// One running (or exited) workload child process.
#[derive(Debug)]
pub struct SubprocessInstance {
    service_id: String,
    image: String,
    pid: SyncMutex<Option<u32>>,
    running: AtomicBool,
    stdout: SyncMutex<String>,
    stderr: SyncMutex<String>,
    exit_code: SyncMutex<Option<i32>>,
}

impl SubprocessInstance {
    fn new(service_id: &str, image: &str, pid: Option<u32>) -> Self {
        Self {
            service_id: service_id.to_string(),
            image: image.to_string(),
            pid: SyncMutex::new(pid),
            running: AtomicBool::new(true),
            stdout: SyncMutex::new(String::new()),
            stderr: SyncMutex::new(String::new()),
            exit_code: SyncMutex::new(None),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn mark_exited(&self, code: Option<i32>) {
        *self.exit_code.lock() = code;
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct SubprocessRuntime {
    /// The runtime binary launched for every workload.
    program: String,
    /// Binary used to resolve remote image digests.
    digest_program: String,
    image_dir: parking_lot::RwLock<PathBuf>,
    log_level: Option<String>,
    instances: SyncMutex<HashMap<String, Arc<SubprocessInstance>>>,
}

impl SubprocessRuntime {
    pub fn new(image_dir: PathBuf, log_level: Option<String>) -> Self {
        Self {
            program: "singularity".to_string(),
            digest_program: "skopeo".to_string(),
            image_dir: parking_lot::RwLock::new(image_dir),
            log_level,
            instances: SyncMutex::new(HashMap::new()),
        }
    }

    /// Override the runtime binary (tests use stub scripts).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Point the runtime at a different image directory.
    pub fn set_image_dir(&self, dir: PathBuf) {
        *self.image_dir.write() = dir;
    }

    fn image_dir(&self) -> PathBuf {
        self.image_dir.read().clone()
    }

    /// Resolve the remote content digest for an image.
    async fn remote_digest(&self, logical: &str) -> Result<String> {
        let reference = format!("docker://{logical}");
        let output = Command::new(&self.digest_program)
            .args(["inspect", "--format", "{{.Digest}}", &reference])
            .output()
            .await
            .map_err(|e| Error::ImagePull {
                image: logical.to_string(),
                reason: format!("failed to run {}: {}", self.digest_program, e),
            })?;
        if !output.status.success() {
            return Err(Error::ImagePull {
                image: logical.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let digest = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if digest.is_empty() {
            return Err(Error::ImagePull {
                image: logical.to_string(),
                reason: "digest lookup produced no output".to_string(),
            });
        }
        Ok(digest)
    }
}

#[async_trait]
impl RuntimeProvider for SubprocessRuntime {
    #[tracing::instrument(skip(self, options), fields(image = %options.image))]
    async fn create_service(
        &self,
        service_id: &str,
        port: u16,
        options: &LaunchOptions,
    ) -> Result<CreatedService> {
        let version = ProtocolVersion::from_number(options.version)?;
        let dir = self.image_dir();
        let flattened = flatten_image_name(&options.image);
        let image_path = find_local_image(&dir, &flattened)?.ok_or_else(|| Error::ImageNotFound {
            image: flattened.clone(),
            dir: dir.display().to_string(),
        })?;

        tracing::debug!(service_id, port, "starting workload process");
        let boot = json!({
            "level": self.log_level,
            "server": "ws",
            "port": port,
        })
        .to_string();

        let mut cmd = Command::new(&self.program);
        cmd.args(["run", "--containall"]);
        if !options.mounts.is_empty() {
            cmd.arg("-B").arg(options.mounts.join(","));
        }
        cmd.args(&options.extra_args);
        cmd.arg(&image_path).arg(&boot);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| Error::ServiceStartFailed {
            service: service_id.to_string(),
            reason: format!("failed to spawn {}: {}", self.program, e),
        })?;

        let instance = Arc::new(SubprocessInstance::new(
            service_id,
            &options.image,
            child.id(),
        ));

        // Drain both pipes while waiting, then flip the liveness flag on
        // exit. The runtime prints its own errors on stdout and chatters on
        // stderr, so stdout is captured for failure reporting and stderr is
        // only logged.
        let monitor = Arc::clone(&instance);
        let monitor_id = service_id.to_string();
        tokio::spawn(async move {
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let out_task = {
                let monitor = Arc::clone(&monitor);
                async move {
                    if let Some(stdout) = stdout {
                        let mut lines = BufReader::new(stdout).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            let mut buf = monitor.stdout.lock();
                            buf.push_str(&line);
                            buf.push('\n');
                        }
                    }
                }
            };
            let err_task = {
                let monitor = Arc::clone(&monitor);
                let monitor_id = monitor_id.clone();
                async move {
                    if let Some(stderr) = stderr {
                        let mut lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            tracing::debug!(service_id = %monitor_id, "{line}");
                            let mut buf = monitor.stderr.lock();
                            buf.push_str(&line);
                            buf.push('\n');
                        }
                    }
                }
            };
            tokio::join!(out_task, err_task);
            let code = child.wait().await.ok().and_then(|status| status.code());
            tracing::debug!(service_id = %monitor_id, ?code, "workload process exited");
            monitor.mark_exited(code);
        });

        // Give the child a moment to crash before handing out a client.
        tokio::time::sleep(STARTUP_GRACE).await;

        if !instance.is_running() {
            let code = *instance.exit_code.lock();
            let stdout = instance.stdout.lock().trim().to_string();
            let stderr = instance.stderr.lock().trim().to_string();
            let reason = match code {
                Some(0) | None if !stdout.is_empty() => stdout,
                Some(0) | None => "workload exited during startup".to_string(),
                Some(code) => format!("exit code {code}: {stderr}"),
            };
            return Err(Error::ServiceStartFailed {
                service: service_id.to_string(),
                reason,
            });
        }

        // A live process that has already written to stdout is the runtime
        // announcing a failure it didn't exit for; take it down.
        let early_stdout = instance.stdout.lock().trim().to_string();
        if !early_stdout.is_empty() {
            let _ = shutdown_instance(&instance, STOP_GRACE).await;
            return Err(Error::ServiceStartFailed {
                service: service_id.to_string(),
                reason: early_stdout,
            });
        }

        self.instances
            .lock()
            .insert(service_id.to_string(), Arc::clone(&instance));

        Ok(CreatedService {
            client: ServiceClient::new("127.0.0.1", port, version),
            handle: ServiceHandle::Subprocess { instance },
        })
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<()> {
        let ServiceHandle::Subprocess { instance } = handle else {
            return Err(Error::Config(
                "subprocess runtime cannot stop a daemon handle".to_string(),
            ));
        };
        shutdown_instance(instance, STOP_GRACE).await
    }

    async fn inspect(&self, handle: &ServiceHandle) -> Result<bool> {
        match handle {
            ServiceHandle::Subprocess { instance } => Ok(instance.is_running()),
            ServiceHandle::Daemon { .. } => Ok(false),
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let dir = self.image_dir();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut images = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let size = entry.metadata().await.ok().map(|m| m.len().to_string());
            images.push(ImageSummary {
                id: name.clone(),
                name,
                tag: None,
                size,
            });
        }
        Ok(images)
    }

    async fn pull(&self, image_ref: &str) -> Result<PullStream> {
        let logical = image_ref.trim_end_matches(":latest").to_string();
        let flattened = flatten_image_name(&logical);
        let digest = self.remote_digest(&logical).await?;
        let digest_id = digest.rsplit(':').next().unwrap_or(&digest).to_string();
        let dir = self.image_dir();
        let target_name = format!("{flattened}-{digest_id}");

        if find_local_image(&dir, &target_name)?.is_some() {
            tracing::debug!(image = %logical, "local image already at remote digest");
            return Ok(PullStream::ready(["Image already downloaded"]));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let program = self.program.clone();
        let target_path = dir.join(&target_name);
        let task = tokio::spawn(async move {
            let source = format!("docker://{logical}");
            let mut child = Command::new(&program)
                .arg("build")
                .arg(&target_path)
                .arg(&source)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| Error::ImagePull {
                    image: logical.clone(),
                    reason: format!("failed to run {program}: {e}"),
                })?;

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let drain_stdout = async {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
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
            let status = child.wait().await.map_err(|e| Error::ImagePull {
                image: logical.clone(),
                reason: e.to_string(),
            })?;
            if !status.success() {
                return Err(Error::ImagePull {
                    image: logical,
                    reason: stderr_buf.trim().to_string(),
                });
            }

            remove_superseded(&dir, &flattened, &target_name)?;
            Ok(())
        });

        Ok(PullStream::new(rx, task))
    }

    async fn stats(&self, _handle: &ServiceHandle) -> Result<Option<serde_json::Value>> {
        // No daemon, no stats endpoint.
        Ok(None)
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        let dir = self.image_dir();
        let flattened = flatten_image_name(image_id.trim_end_matches(":latest"));
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&format!("{flattened}-")) || name == flattened {
                std::fs::remove_file(entry.path())?;
                tracing::debug!(file = %name, "removed local image file");
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        let result = Command::new(&self.program).arg("--version").output().await;
        Ok(matches!(result, Ok(output) if output.status.success()))
    }

    async fn list_containers(&self, filter: Option<&str>) -> Result<Vec<ContainerSummary>> {
        let instances = self.instances.lock();
        Ok(instances
            .values()
            .filter(|i| filter.map_or(true, |f| i.service_id.contains(f)))
            .map(|i| ContainerSummary {
                id: i.service_id.clone(),
                image: i.image.clone(),
                names: vec![i.service_id.clone()],
                state: if i.is_running() { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }

    async fn container_logs(&self, container_id: &str) -> Result<ContainerLogs> {
        let instance = self
            .instances
            .lock()
            .get(container_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no such workload: {container_id}")))?;
        let logs = instance
            .stderr
            .lock()
            .lines()
            .map(str::to_string)
            .collect();
        Ok(ContainerLogs {
            image_name: instance.image.clone(),
            container_id: container_id.to_string(),
            logs,
        })
    }
}

/// Stop a workload child: SIGTERM, wait out the grace period, then SIGKILL.
async fn shutdown_instance(instance: &SubprocessInstance, grace: Duration) -> Result<()> {
    if !instance.is_running() {
        return Ok(());
    }
    let Some(pid) = *instance.pid.lock() else {
        instance.running.store(false, Ordering::SeqCst);
        return Ok(());
    };
    #[cfg(not(unix))]
    let _ = pid;

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let nix_pid = Pid::from_raw(pid as i32);
        match signal::kill(nix_pid, Signal::SIGTERM) {
            Ok(()) => {}
            // Already gone between the flag check and the signal.
            Err(nix::errno::Errno::ESRCH) => {
                instance.running.store(false, Ordering::SeqCst);
                return Ok(());
            }
            Err(e) => {
                return Err(Error::StopFailed {
                    service: instance.service_id.clone(),
                    reason: format!("SIGTERM failed for pid {pid}: {e}"),
                });
            }
        }

        let poll = Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if signal::kill(nix_pid, None).is_err() {
                instance.running.store(false, Ordering::SeqCst);
                return Ok(());
            }
            tokio::time::sleep(poll).await;
        }

        tracing::warn!(
            service_id = %instance.service_id,
            pid,
            "workload ignored SIGTERM, sending SIGKILL"
        );
        let _ = signal::kill(nix_pid, Signal::SIGKILL);
    }

    instance.running.store(false, Ordering::SeqCst);
    Ok(())
}

/// Flatten a registry image path into a single filename component.
pub(crate) fn flatten_image_name(image: &str) -> String {
    image.trim_end_matches(":latest").replace('/', "_")
}

/// Find a file in `dir` whose name contains `needle`.
pub(crate) fn find_local_image(dir: &Path, needle: &str) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().contains(needle) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Delete older digests of the same logical image, keeping `keep`.
pub(crate) fn remove_superseded(dir: &Path, flattened: &str, keep: &str) -> Result<()> {
    let prefix = format!("{flattened}-");
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name != keep {
            std::fs::remove_file(entry.path())?;
            tracing::debug!(file = %name, "removed superseded image file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_strips_latest_and_slashes() {
        assert_eq!(flatten_image_name("org/comp:latest"), "org_comp");
        assert_eq!(flatten_image_name("org/group/comp"), "org_group_comp");
        assert_eq!(flatten_image_name("plain"), "plain");
    }

    #[test]
    fn find_local_image_matches_substring() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("org_comp-abc123"), b"img").unwrap();

        let found = find_local_image(dir.path(), "org_comp").unwrap();
        assert!(found.is_some());
        assert!(find_local_image(dir.path(), "other_comp").unwrap().is_none());
    }

    #[test]
    fn find_local_image_missing_dir_is_none() {
        let found = find_local_image(Path::new("/definitely/not/here"), "x").unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn remove_superseded_keeps_current_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("org_comp-old1"), b"a").unwrap();
        std::fs::write(dir.path().join("org_comp-old2"), b"b").unwrap();
        std::fs::write(dir.path().join("org_comp-new"), b"c").unwrap();
        std::fs::write(dir.path().join("other_comp-x"), b"d").unwrap();

        remove_superseded(dir.path(), "org_comp", "org_comp-new").unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"org_comp-new".to_string()));
        assert!(names.contains(&"other_comp-x".to_string()));
        assert!(!names.contains(&"org_comp-old1".to_string()));
        assert!(!names.contains(&"org_comp-old2".to_string()));
    }

    #[cfg(unix)]
    mod launch {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable stub that stands in for the runtime binary.
        fn stub_runtime(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-runtime");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn runtime_with_stub(dir: &Path, body: &str) -> SubprocessRuntime {
            let stub = stub_runtime(dir, body);
            std::fs::write(dir.join("org_comp-digest0"), b"img").unwrap();
            SubprocessRuntime::new(dir.to_path_buf(), None)
                .with_program(stub.to_string_lossy().to_string())
        }

        #[tokio::test]
        async fn healthy_launch_returns_running_handle() {
            let dir = tempfile::tempdir().unwrap();
            let rt = runtime_with_stub(dir.path(), "exec sleep 30");

            let created = rt
                .create_service("svc-1", 28101, &LaunchOptions::new("org/comp"))
                .await
                .unwrap();

            assert!(rt.inspect(&created.handle).await.unwrap());
            rt.stop(&created.handle).await.unwrap();
            assert!(!rt.inspect(&created.handle).await.unwrap());
        }

        #[tokio::test]
        async fn nonzero_exit_fails_with_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let rt = runtime_with_stub(dir.path(), "echo 'no loop device' >&2; exit 3");

            let err = rt
                .create_service("svc-2", 28102, &LaunchOptions::new("org/comp"))
                .await
                .unwrap_err();
            match err {
                Error::ServiceStartFailed { reason, .. } => {
                    assert!(reason.contains("exit code 3"));
                    assert!(reason.contains("no loop device"));
                }
                other => panic!("wrong error: {other}"),
            }
        }

        #[tokio::test]
        async fn stdout_output_with_clean_exit_is_still_a_failure() {
            let dir = tempfile::tempdir().unwrap();
            let rt = runtime_with_stub(dir.path(), "echo 'FATAL: cannot mount overlay'; exit 0");

            let err = rt
                .create_service("svc-3", 28103, &LaunchOptions::new("org/comp"))
                .await
                .unwrap_err();
            match err {
                Error::ServiceStartFailed { reason, .. } => {
                    assert!(reason.contains("cannot mount overlay"));
                }
                other => panic!("wrong error: {other}"),
            }
        }

        #[tokio::test]
        async fn stderr_chatter_alone_is_not_a_failure() {
            let dir = tempfile::tempdir().unwrap();
            let rt = runtime_with_stub(dir.path(), "echo 'INFO: booting' >&2; exec sleep 30");

            let created = rt
                .create_service("svc-4", 28104, &LaunchOptions::new("org/comp"))
                .await
                .unwrap();
            assert!(rt.inspect(&created.handle).await.unwrap());
            rt.stop(&created.handle).await.unwrap();
        }

        #[tokio::test]
        async fn missing_image_is_reported_before_spawn() {
            let dir = tempfile::tempdir().unwrap();
            let rt = SubprocessRuntime::new(dir.path().to_path_buf(), None)
                .with_program("/bin/true");

            let err = rt
                .create_service("svc-5", 28105, &LaunchOptions::new("absent/comp"))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::ImageNotFound { .. }));
        }

        #[tokio::test]
        async fn logs_come_from_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let rt = runtime_with_stub(dir.path(), "echo 'INFO: ready' >&2; exec sleep 30");

            let created = rt
                .create_service("svc-6", 28106, &LaunchOptions::new("org/comp"))
                .await
                .unwrap();
            let logs = rt.container_logs("svc-6").await.unwrap();
            assert_eq!(logs.logs, vec!["INFO: ready"]);
            assert_eq!(logs.image_name, "org/comp");
            rt.stop(&created.handle).await.unwrap();
        }
    }
}
