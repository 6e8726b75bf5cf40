//! Docker CLI plumbing for the daemon runtime.
//!
//! All `docker` subprocess invocations go through [`DockerClient`], which
//! provides consistent timeout handling and structured [`DockerError`]
//! returns. The daemon runtime composes these calls; nothing else in the
//! crate talks to Docker directly.

pub mod client;
pub mod error;

pub use client::DockerClient;
pub use error::DockerError;
