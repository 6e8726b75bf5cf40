//! # Conductor
//!
//! Coordinates execution of untrusted, versioned computation workloads inside
//! isolated container runtimes, and exchanges structured job requests and
//! results with each running workload over a private per-workload channel.
//!
//! ## Features
//!
//! - **Service Orchestration**: Start, stop, and share containerized workloads
//!   between multiple callers with reference counting
//! - **Two Runtime Backends**: A Docker-daemon backend and a daemonless
//!   subprocess backend, selectable per orchestrator and per call
//! - **Port Allocation**: Serialized allocation of host ports with a
//!   blacklist that survives until a workload is confirmed stopped
//! - **Job Channel**: A framed JSON protocol (two wire versions) for sending
//!   a job into a workload and assembling its result
//! - **Crash Recovery**: Dead workloads are transparently relaunched on the
//!   next start request for the same service
//!
//! ## Quick Start
//!
//! ```no_run
//! use conductor::{JobRequest, LaunchOptions, Orchestrator, OrchestratorConfig};
//!
//! # async fn example() -> Result<(), conductor::Error> {
//! let orchestrator = Orchestrator::builder()
//!     .config(OrchestratorConfig::from_env())
//!     .build();
//!
//! let options = LaunchOptions::new("example/computation");
//! let client = orchestrator
//!     .start_service("run-1", "user-a", None, options)
//!     .await?;
//!
//! let result = client
//!     .run_job(JobRequest::command(["run"], serde_json::json!({"echo": "hi"})))
//!     .await?;
//! println!("{result}");
//!
//! orchestrator.stop_service("run-1", "user-a", false).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! All orchestrator operations take `&self` and are safe to call
//! concurrently. Start and stop are serialized per service id; concurrent
//! starts for one id converge on a single launch. Distinct service ids
//! proceed fully independently.

pub mod channel;
pub mod config;
pub mod docker;
pub mod error;
pub mod orchestrator;
pub mod port;
pub mod runtime;

// Re-export commonly used types
pub use channel::{JobRequest, ProtocolVersion, ServiceClient};
pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, ServiceState};
pub use port::PortAllocator;
pub use runtime::{LaunchOptions, ProviderKind, RuntimeProvider, ServiceHandle};
