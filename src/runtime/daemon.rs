//! Docker-daemon runtime backend.
//!
//! Workloads run as containers created through the daemon. The container
//! publishes its internal channel port onto the host port the orchestrator
//! allocated; after start, the container is inspected to confirm it is
//! running and to learn which address the channel should dial.

use super::{
    ContainerLogs, ContainerSummary, CreatedService, ImageSummary, LaunchOptions, PullStream,
    RuntimeProvider, ServiceHandle,
};
use crate::channel::{ProtocolVersion, ServiceClient};
use crate::config::OrchestratorConfig;
use crate::docker::DockerClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::json;

/// Fixed port the workload's server listens on inside the container.
/// Coupled with the base server image; clustered runs bypass it and bind
/// the allocated port directly.
const INTERNAL_CHANNEL_PORT: u16 = 8881;

/// Port the workload's debugger listens on when debug ports are enabled.
const INTERNAL_DEBUG_PORT: u16 = 4444;

pub struct DaemonRuntime {
    client: DockerClient,
    config: OrchestratorConfig,
}

impl DaemonRuntime {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            client: DockerClient::new(),
            config,
        }
    }

    /// The container-side channel port for a given host port.
    fn internal_port(&self, port: u16) -> u16 {
        if self.config.clustered {
            port
        } else {
            INTERNAL_CHANNEL_PORT
        }
    }

    /// Assemble the `docker run -d` argument list for one workload.
    fn build_run_args(&self, port: u16, options: &LaunchOptions) -> Vec<String> {
        let internal = self.internal_port(port);
        let mut args: Vec<String> = vec![
            "-t".into(),
            "--security-opt".into(),
            "seccomp=unconfined".into(),
        ];

        if self.config.clustered {
            // The caller's mounts live on the host running this process,
            // not on the daemon's host; substitute the shared volume.
            if let Some(bind) = self.config.cluster_bind() {
                args.push("-v".into());
                args.push(bind);
            }
            if let Some(network) = &self.config.cluster_network {
                args.push("--network".into());
                args.push(network.clone());
            }
            args.push("-p".into());
            args.push(format!("{port}:{internal}"));
        } else {
            for mount in &options.mounts {
                args.push("-v".into());
                args.push(mount.clone());
            }
            args.push("-p".into());
            args.push(format!("127.0.0.1:{port}:{internal}"));
        }

        if self.config.debug_ports {
            // Derive a stable host debug port from the channel port so
            // concurrent workloads rarely collide.
            let suffix = port % 100;
            args.push("-p".into());
            args.push(format!("127.0.0.1:44{suffix:02}:{INTERNAL_DEBUG_PORT}"));
        }

        args.extend(options.extra_args.iter().cloned());
        args.push(options.image.clone());

        // Version-1 workloads take their boot parameters as a JSON argument
        // to the base server entrypoint. Version 2 boots from the image's
        // own entrypoint.
        if options.version == 1 {
            if let Some(level) = &self.config.log_level {
                args.push("node".into());
                args.push("/server/index.js".into());
                args.push(
                    json!({
                        "level": level,
                        "server": "ws",
                        "port": internal,
                    })
                    .to_string(),
                );
            }
        }

        args
    }
}

#[async_trait]
impl RuntimeProvider for DaemonRuntime {
    #[tracing::instrument(skip(self, options), fields(image = %options.image))]
    async fn create_service(
        &self,
        service_id: &str,
        port: u16,
        options: &LaunchOptions,
    ) -> Result<CreatedService> {
        let version = ProtocolVersion::from_number(options.version)?;
        tracing::debug!(service_id, port, "starting workload container");

        let args = self.build_run_args(port, options);
        let container_id = self.client.run_detached(&args).await?;

        let running = self.client.inspect_running(&container_id).await?;
        if !running {
            let _ = self.client.rm_force(&container_id).await;
            return Err(Error::ServiceStartFailed {
                service: service_id.to_string(),
                reason: format!("container {container_id} exited during startup"),
            });
        }

        // Loopback in the common case; inside a shared cluster network the
        // channel must dial the container's own hostname instead.
        let host = if self.config.clustered {
            self.client
                .inspect_field(&container_id, "{{.Config.Hostname}}")
                .await?
        } else {
            "127.0.0.1".to_string()
        };

        tracing::debug!(service_id, container_id, "workload container started");
        Ok(CreatedService {
            client: ServiceClient::new(host, port, version),
            handle: ServiceHandle::Daemon { container_id },
        })
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<()> {
        let ServiceHandle::Daemon { container_id } = handle else {
            return Err(Error::Config(
                "daemon runtime cannot stop a subprocess handle".to_string(),
            ));
        };
        self.client.stop_and_remove(container_id).await?;
        Ok(())
    }

    async fn inspect(&self, handle: &ServiceHandle) -> Result<bool> {
        let ServiceHandle::Daemon { container_id } = handle else {
            return Ok(false);
        };
        Ok(self.client.inspect_running(container_id).await?)
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let rows = self.client.list_images().await?;
        Ok(rows
            .into_iter()
            .map(|row| ImageSummary {
                id: json_str(&row, "ID"),
                name: json_str(&row, "Repository"),
                tag: opt_json_str(&row, "Tag"),
                size: opt_json_str(&row, "Size"),
            })
            .collect())
    }

    async fn pull(&self, image_ref: &str) -> Result<PullStream> {
        let (rx, inner) = self.client.pull(image_ref);
        // Lift the DockerError task into this crate's error type.
        let task = tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Docker(e)),
                Err(join) => Err(Error::Io(std::io::Error::other(join))),
            }
        });
        Ok(PullStream::new(rx, task))
    }

    async fn stats(&self, handle: &ServiceHandle) -> Result<Option<serde_json::Value>> {
        let ServiceHandle::Daemon { container_id } = handle else {
            return Ok(None);
        };
        Ok(Some(self.client.stats(container_id).await?))
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        self.client.remove_image(image_id).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        Ok(self.client.ping().await)
    }

    async fn list_containers(&self, filter: Option<&str>) -> Result<Vec<ContainerSummary>> {
        let rows = self.client.list_containers(filter).await?;
        Ok(rows
            .into_iter()
            .map(|row| ContainerSummary {
                id: json_str(&row, "ID"),
                image: json_str(&row, "Image"),
                names: json_str(&row, "Names")
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                state: json_str(&row, "State"),
            })
            .collect())
    }

    async fn container_logs(&self, container_id: &str) -> Result<ContainerLogs> {
        let image_name = self
            .client
            .inspect_field(container_id, "{{.Config.Image}}")
            .await?;
        let logs = self.client.logs(container_id, 200).await?;
        Ok(ContainerLogs {
            image_name,
            container_id: container_id.to_string(),
            logs,
        })
    }
}

fn json_str(row: &serde_json::Value, key: &str) -> String {
    row.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn opt_json_str(row: &serde_json::Value, key: &str) -> Option<String> {
    row.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(config: OrchestratorConfig) -> DaemonRuntime {
        DaemonRuntime::new(config)
    }

    #[test]
    fn run_args_publish_loopback_port_against_internal() {
        let rt = runtime(OrchestratorConfig::default());
        let options = LaunchOptions::new("example/comp").with_mounts(["/data/in:/input"]);
        let args = rt.build_run_args(8103, &options);

        assert!(args.contains(&"--security-opt".to_string()));
        assert!(args.contains(&"seccomp=unconfined".to_string()));
        assert!(args.contains(&"/data/in:/input".to_string()));
        assert!(args.contains(&"127.0.0.1:8103:8881".to_string()));
        assert_eq!(args.last().unwrap(), "example/comp");
    }

    #[test]
    fn run_args_clustered_bind_own_port_and_network() {
        let mut config = OrchestratorConfig::default();
        config.clustered = true;
        config.cluster_bind_source = Some("shared".to_string());
        config.cluster_bind_target = Some("/input".to_string());
        config.cluster_network = Some("ci-net".to_string());
        let rt = runtime(config);

        let options = LaunchOptions::new("example/comp").with_mounts(["/ignored:/input"]);
        let args = rt.build_run_args(8103, &options);

        assert!(args.contains(&"shared:/input".to_string()));
        assert!(!args.contains(&"/ignored:/input".to_string()));
        assert!(args.contains(&"ci-net".to_string()));
        assert!(args.contains(&"8103:8103".to_string()));
    }

    #[test]
    fn run_args_debug_port_derived_from_channel_port() {
        let mut config = OrchestratorConfig::default();
        config.debug_ports = true;
        let rt = runtime(config);

        let args = rt.build_run_args(8107, &LaunchOptions::new("img"));
        assert!(args.contains(&"127.0.0.1:4407:4444".to_string()));
    }

    #[test]
    fn run_args_v1_boot_command_carries_port_and_level() {
        let mut config = OrchestratorConfig::default();
        config.log_level = Some("debug".to_string());
        let rt = runtime(config);

        let args = rt.build_run_args(8103, &LaunchOptions::new("img"));
        let boot = args.last().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(boot).unwrap();
        assert_eq!(parsed["server"], "ws");
        assert_eq!(parsed["port"], 8881);
        assert_eq!(parsed["level"], "debug");
    }

    #[test]
    fn run_args_v2_has_no_boot_command() {
        let mut config = OrchestratorConfig::default();
        config.log_level = Some("debug".to_string());
        let rt = runtime(config);

        let options = LaunchOptions::new("img").with_version(2);
        let args = rt.build_run_args(8103, &options);
        assert_eq!(args.last().unwrap(), "img");
    }
}
