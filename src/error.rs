use crate::docker::DockerError;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Docker error: {0}")]
    #[diagnostic(
        code(conductor::docker::error),
        help("Check that the Docker daemon is running with `docker ps`")
    )]
    Docker(#[from] DockerError),

    #[error("Port allocation failed: {0}")]
    #[diagnostic(
        code(conductor::port::allocation_failed),
        help("Free some ports in the scan range or lower the configured start port")
    )]
    PortAllocation(String),

    #[error("Port {port} is already bound")]
    #[diagnostic(code(conductor::port::in_use))]
    PortInUse { port: u16 },

    #[error("Service '{service}' failed to start: {reason}")]
    #[diagnostic(
        code(conductor::service::start_failed),
        help("Check the workload image and the runtime's logs for '{service}'")
    )]
    ServiceStartFailed { service: String, reason: String },

    #[error("Failed to stop workload '{service}': {reason}")]
    #[diagnostic(code(conductor::service::stop_failed))]
    StopFailed { service: String, reason: String },

    #[error("Failed to pull image '{image}': {reason}")]
    #[diagnostic(code(conductor::image::pull_failed))]
    ImagePull { image: String, reason: String },

    #[error("Invalid service provider: {0}")]
    #[diagnostic(
        code(conductor::provider::invalid),
        help("Valid providers are 'docker' and 'subprocess'")
    )]
    InvalidProvider(String),

    #[error("Invalid computation spec version: {0}")]
    #[diagnostic(code(conductor::channel::invalid_version))]
    InvalidVersion(u32),

    #[error("No local image matching '{image}' found in {dir}")]
    #[diagnostic(
        code(conductor::image::not_found),
        help("Pull the image first so a converted copy lands in the image directory")
    )]
    ImageNotFound { image: String, dir: String },

    #[error("Workload socket timeout exceeded for {host}:{port} after {attempts} attempts")]
    #[diagnostic(
        code(conductor::channel::connect_timeout),
        help("The workload never opened its listening port. Check that it booted and that the port mapping is correct")
    )]
    ConnectTimeout {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error("Abnormal workload socket close: {code}")]
    #[diagnostic(code(conductor::channel::abnormal_close))]
    AbnormalClose { code: u16 },

    #[error("Workload reported an error: {0}")]
    #[diagnostic(code(conductor::channel::workload_error))]
    Workload(serde_json::Value),

    #[error("Computation failed with exit code {code} and stderr {stderr}")]
    #[diagnostic(
        code(conductor::job::failed),
        help("The workload's stderr above usually names the failing step")
    )]
    JobFailed { code: i32, stderr: String },

    #[error(
        "Computation output could not be parsed: {source}\n  exit code: {code}\n  stderr: {stderr}"
    )]
    #[diagnostic(
        code(conductor::job::output_parse),
        help("The workload must print a single JSON document on stdout")
    )]
    OutputParse {
        code: i32,
        stderr: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error means the chosen host port was taken out from
    /// under us between reservation and the runtime's bind. The launch path
    /// re-reserves and retries on these.
    pub fn is_bind_conflict(&self) -> bool {
        match self {
            Error::PortInUse { .. } => true,
            Error::Docker(DockerError::CommandFailed { stderr, .. }) => {
                stderr.contains("port is already allocated")
                    || stderr.contains("address already in use")
                    || stderr.contains("Bind for")
            }
            _ => false,
        }
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::Docker(_) => Some("Check that the Docker daemon is running: docker ps".to_string()),
            Error::InvalidProvider(name) => Some(format!(
                "'{}' is not a known provider. Use 'docker' or 'subprocess'.",
                name
            )),
            Error::ConnectTimeout { host, port, .. } => Some(format!(
                "Nothing answered on {}:{}. Inspect the workload's logs to see whether its server started.",
                host, port
            )),
            Error::ImageNotFound { image, dir } => Some(format!(
                "Pull '{}' so a converted copy is placed in {}.",
                image, dir
            )),
            Error::PortAllocation(_) => Some(
                "Every port in the scan range is bound or blacklisted. Stop stale workloads or raise the range.".to_string(),
            ),
            _ => None,
        }
    }
}
