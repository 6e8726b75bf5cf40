//! Runtime backends for launching and controlling workloads.
//!
//! Two interchangeable providers implement [`RuntimeProvider`]:
//! [`DaemonRuntime`](daemon::DaemonRuntime) drives a long-lived Docker
//! daemon, [`SubprocessRuntime`](subprocess::SubprocessRuntime) launches a
//! container runtime binary directly as child processes. The orchestrator
//! owns all registry state; providers are stateless with respect to service
//! records and only return data for the orchestrator to record.

pub mod daemon;
pub mod subprocess;

pub use daemon::DaemonRuntime;
pub use subprocess::SubprocessRuntime;

use crate::channel::ServiceClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which runtime backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Docker,
    Subprocess,
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "docker" => Ok(ProviderKind::Docker),
            "subprocess" => Ok(ProviderKind::Subprocess),
            other => Err(Error::InvalidProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Docker => write!(f, "docker"),
            ProviderKind::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// Everything a provider needs to launch one workload.
///
/// An opaque bundle from the orchestrator's point of view — how the image
/// was chosen or built belongs to the pipeline layer.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Image reference (repository path, registry syntax).
    pub image: String,
    /// Bind mounts, `source:target[:opts]` syntax.
    pub mounts: Vec<String>,
    /// Computation spec version; selects the wire protocol.
    pub version: u32,
    /// Extra arguments appended to the runtime's create call, verbatim.
    pub extra_args: Vec<String>,
}

impl LaunchOptions {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            mounts: Vec::new(),
            version: 1,
            extra_args: Vec::new(),
        }
    }

    pub fn with_mounts<I, S>(mut self, mounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mounts = mounts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// Opaque handle on one launched workload, used for later introspection and
/// teardown.
#[derive(Debug, Clone)]
pub enum ServiceHandle {
    /// A container managed by the daemon; survives orchestrator restarts.
    Daemon { container_id: String },
    /// A child process of this orchestrator; liveness is an in-memory flag
    /// and cannot be recovered after a restart.
    Subprocess {
        instance: Arc<subprocess::SubprocessInstance>,
    },
}

impl ServiceHandle {
    /// Container id, for daemon-backed handles.
    pub fn container_id(&self) -> Option<&str> {
        match self {
            ServiceHandle::Daemon { container_id } => Some(container_id),
            ServiceHandle::Subprocess { .. } => None,
        }
    }
}

/// A successful launch: the job-channel client plus the backend handle.
#[derive(Debug)]
pub struct CreatedService {
    pub client: ServiceClient,
    pub handle: ServiceHandle,
}

/// One locally available image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub name: String,
    pub tag: Option<String>,
    pub size: Option<String>,
}

/// One container/instance known to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub names: Vec<String>,
    pub state: String,
}

/// Log lines for one container, paired with enough identity to attribute
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLogs {
    pub image_name: String,
    pub container_id: String,
    pub logs: Vec<String>,
}

/// Progress lines from an in-flight image pull, plus its completion.
///
/// Lines stream while the pull runs; [`collect`](Self::collect) drains the
/// remainder and surfaces the pull's final result.
pub struct PullStream {
    rx: mpsc::UnboundedReceiver<String>,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl PullStream {
    pub fn new(
        rx: mpsc::UnboundedReceiver<String>,
        task: tokio::task::JoinHandle<Result<()>>,
    ) -> Self {
        Self { rx, task }
    }

    /// An already-finished stream carrying only the given status lines
    /// (e.g. "image already up to date").
    pub fn ready<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        for line in lines {
            let _ = tx.send(line.into());
        }
        Self {
            rx,
            task: tokio::spawn(async { Ok(()) }),
        }
    }

    /// Next progress line, `None` once the producer is done.
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain all remaining lines and return them along with the pull's
    /// outcome.
    pub async fn collect(mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.rx.recv().await {
            lines.push(line);
        }
        match self.task.await {
            Ok(Ok(())) => Ok(lines),
            Ok(Err(e)) => Err(e),
            Err(join) => Err(Error::Io(std::io::Error::other(join))),
        }
    }
}

/// The uniform contract both backends implement.
///
/// Providers never touch the orchestrator's registry or the port
/// blacklist; they launch, stop, and introspect workloads and report back.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Launch one workload bound to `port` and wait for it to reach a
    /// running state. Returns the job-channel client and the backend
    /// handle.
    async fn create_service(
        &self,
        service_id: &str,
        port: u16,
        options: &LaunchOptions,
    ) -> Result<CreatedService>;

    /// Tear the workload down.
    async fn stop(&self, handle: &ServiceHandle) -> Result<()>;

    /// Whether the workload behind `handle` is still running.
    async fn inspect(&self, handle: &ServiceHandle) -> Result<bool>;

    /// List locally available images.
    async fn list_images(&self) -> Result<Vec<ImageSummary>>;

    /// Start pulling an image; progress streams through the result.
    async fn pull(&self, image_ref: &str) -> Result<PullStream>;

    /// Pull a batch of images, one outcome per reference so failures stay
    /// attributable to the image that caused them.
    async fn pull_images_from_list(
        &self,
        image_refs: &[String],
    ) -> Vec<(String, Result<PullStream>)> {
        let mut outcomes = Vec::with_capacity(image_refs.len());
        for image_ref in image_refs {
            outcomes.push((image_ref.clone(), self.pull(image_ref).await));
        }
        outcomes
    }

    /// Resource usage for a running workload; `None` when the backend has
    /// no stats support.
    async fn stats(&self, handle: &ServiceHandle) -> Result<Option<serde_json::Value>>;

    /// Remove a local image.
    async fn remove_image(&self, image_id: &str) -> Result<()>;

    /// Whether the backend is reachable at all.
    async fn ping(&self) -> Result<bool>;

    /// List containers/instances, optionally filtered.
    async fn list_containers(&self, filter: Option<&str>) -> Result<Vec<ContainerSummary>>;

    /// Fetch logs for one container, attributed to its image.
    async fn container_logs(&self, container_id: &str) -> Result<ContainerLogs>;
}
