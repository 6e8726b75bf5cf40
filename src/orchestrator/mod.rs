mod builder;
mod core;
mod registry;

pub use builder::OrchestratorBuilder;
pub use core::{ImagePull, ImageRemoval, ImageSpec, Orchestrator};
pub use registry::{ServiceRecord, ServiceSnapshot, ServiceState, UserCounters};
