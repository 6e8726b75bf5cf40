//! The central coordinator for workload services.
//!
//! The orchestrator owns the service registry and the port allocator, and
//! composes them with the runtime providers and the job channel. Everything
//! else in the application goes through the operations on [`Orchestrator`].

use crate::channel::ServiceClient;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::orchestrator::registry::{ServiceRecord, ServiceSnapshot, ServiceState};
use crate::port::PortAllocator;
use crate::runtime::{
    ContainerLogs, ContainerSummary, ImageSummary, LaunchOptions, ProviderKind, PullStream,
    RuntimeProvider, SubprocessRuntime,
};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Bound on re-reservation attempts when the runtime reports a bind
/// conflict on the chosen port.
const BIND_RETRY_LIMIT: u32 = 20;

/// Shared slot for one service record; the inner mutex serializes start
/// and stop per service id.
type ServiceSlot = Arc<Mutex<ServiceRecord>>;
type ServiceRegistry = HashMap<String, ServiceSlot>;

/// One item of a batch pull, attributable to the image that produced it.
pub struct ImagePull {
    pub id: String,
    pub name: Option<String>,
    pub result: Result<PullStream>,
}

/// One item of a batch image removal.
pub struct ImageRemoval {
    pub id: String,
    pub result: Result<()>,
}

/// A computation image to pull, as the pipeline layer describes it.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    /// Identifier the caller uses to attribute the result.
    pub id: String,
    /// Human-readable name, carried through untouched.
    pub name: Option<String>,
    /// Image reference to pull.
    pub image: String,
}

/// Coordinates workload services across runtime backends.
///
/// # Concurrency Model
///
/// Every operation takes `&self`. Start/stop for one service id are
/// serialized through that record's mutex, so concurrent starts converge on
/// a single launch; distinct ids proceed independently. The registry map
/// and the port blacklist are the only shared mutable state, and both are
/// owned here — providers and the channel only return data for the
/// orchestrator to record.
pub struct Orchestrator {
    config: OrchestratorConfig,
    providers: HashMap<ProviderKind, Arc<dyn RuntimeProvider>>,
    active: parking_lot::RwLock<ProviderKind>,
    services: Arc<RwLock<ServiceRegistry>>,
    ports: Arc<PortAllocator>,
    /// Concrete subprocess backend, kept for image-directory switching.
    subprocess: Option<Arc<SubprocessRuntime>>,
}

impl Orchestrator {
    /// Create a builder for constructing an `Orchestrator`.
    pub fn builder() -> super::OrchestratorBuilder {
        super::OrchestratorBuilder::new()
    }

    pub(super) fn from_parts(
        config: OrchestratorConfig,
        providers: HashMap<ProviderKind, Arc<dyn RuntimeProvider>>,
        active: ProviderKind,
        subprocess: Option<Arc<SubprocessRuntime>>,
    ) -> Self {
        Self {
            config,
            providers,
            active: parking_lot::RwLock::new(active),
            services: Arc::new(RwLock::new(HashMap::new())),
            ports: Arc::new(PortAllocator::new()),
            subprocess,
        }
    }

    /// The currently active provider kind.
    pub fn active_provider(&self) -> ProviderKind {
        *self.active.read()
    }

    /// Select the provider used by subsequent operations. Rejects unknown
    /// provider names.
    pub fn set_provider(&self, name: &str) -> Result<()> {
        let kind: ProviderKind = name.parse()?;
        if !self.providers.contains_key(&kind) {
            return Err(Error::InvalidProvider(name.to_string()));
        }
        *self.active.write() = kind;
        Ok(())
    }

    /// Point the subprocess backend at a different image directory.
    pub fn set_image_dir(&self, dir: std::path::PathBuf) -> Result<()> {
        match &self.subprocess {
            Some(subprocess) => {
                subprocess.set_image_dir(dir);
                Ok(())
            }
            None => Err(Error::Config(
                "no subprocess backend to set an image directory on".to_string(),
            )),
        }
    }

    fn provider(&self, kind: Option<ProviderKind>) -> Result<Arc<dyn RuntimeProvider>> {
        let kind = kind.unwrap_or_else(|| self.active_provider());
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::InvalidProvider(kind.to_string()))
    }

    // ========================================================================
    // Service lifecycle
    // ========================================================================

    /// Start a service, or join one that is already starting or running.
    ///
    /// The returned [`ServiceClient`] performs job round-trips against the
    /// workload. Multiple callers share one workload per service id; each
    /// caller is tracked in the record's user set until it stops the
    /// service.
    #[tracing::instrument(skip(self, options))]
    pub async fn start_service(
        &self,
        service_id: &str,
        user_id: &str,
        provider: Option<ProviderKind>,
        options: LaunchOptions,
    ) -> Result<ServiceClient> {
        let runtime = self.provider(provider)?;

        let slot = self.slot_for_start(service_id).await;
        let mut record = slot.lock().await;
        record.add_user(user_id);

        if record.state == ServiceState::ShuttingDown {
            // We joined a record whose teardown finished while we waited
            // for the lock. Its port is released (or about to be); start
            // over and make sure the slot is back in the registry.
            record.port = 0;
            record.handle = None;
            record.client = None;
            let mut map = self.services.write().await;
            map.insert(service_id.to_string(), Arc::clone(&slot));
        }

        if record.state == ServiceState::Running {
            let alive = match &record.handle {
                Some(handle) => {
                    let runtime = record.runtime.clone().unwrap_or_else(|| runtime.clone());
                    runtime.inspect(handle).await.unwrap_or(false)
                }
                None => false,
            };
            if alive {
                if let Some(client) = record.client.clone() {
                    tracing::trace!(service_id, "returning already started service");
                    return Ok(client);
                }
            }
            // The workload was shut down or crashed underneath us.
            tracing::debug!(service_id, "service was down, starting new instance");
        }

        match self
            .launch(&mut record, service_id, runtime, &options)
            .await
        {
            Ok(client) => Ok(client),
            Err(e) => {
                record.state = ServiceState::Zombie;
                record.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Fetch the slot for a start request, creating a fresh record when
    /// none exists or when the existing one is terminal.
    async fn slot_for_start(&self, service_id: &str) -> ServiceSlot {
        let mut services = self.services.write().await;
        if let Some(existing) = services.get(service_id) {
            // A locked record has a start or stop in flight; join it rather
            // than superseding mid-operation.
            let supersede = match existing.try_lock() {
                Ok(record) => matches!(
                    record.state,
                    ServiceState::ShuttingDown | ServiceState::Zombie
                ),
                Err(_) => false,
            };
            if !supersede {
                return Arc::clone(existing);
            }
            tracing::debug!(service_id, "superseding terminal service record");
        }
        let fresh: ServiceSlot = Arc::new(Mutex::new(ServiceRecord::empty()));
        services.insert(service_id.to_string(), Arc::clone(&fresh));
        fresh
    }

    /// Reserve a port (unless the record already owns one) and drive the
    /// provider's launch, retrying past bind conflicts.
    async fn launch(
        &self,
        record: &mut ServiceRecord,
        service_id: &str,
        runtime: Arc<dyn RuntimeProvider>,
        options: &LaunchOptions,
    ) -> Result<ServiceClient> {
        record.state = ServiceState::Starting;
        record.error = None;

        // Relaunches reuse the record's port — it is still blacklisted and
        // the dead workload no longer holds it.
        let mut port = if record.port != 0 {
            record.port
        } else {
            self.ports.reserve(service_id, self.config.port_start).await?
        };

        let mut depth = 0;
        let created = loop {
            tracing::debug!(service_id, port, "starting service");
            match runtime.create_service(service_id, port, options).await {
                Ok(created) => break created,
                Err(e) if e.is_bind_conflict() && depth < BIND_RETRY_LIMIT => {
                    depth += 1;
                    tracing::debug!(
                        service_id,
                        port,
                        depth,
                        "port bound out from under us, reserving another"
                    );
                    // The conflicted port stays blacklisted; something else
                    // owns it at the OS level.
                    port = self
                        .ports
                        .reserve(service_id, port.saturating_add(1))
                        .await?;
                }
                Err(e) => return Err(e),
            }
        };

        record.port = port;
        record.handle = Some(created.handle);
        record.client = Some(created.client.clone());
        record.runtime = Some(runtime);
        record.state = ServiceState::Running;
        record.started_at = Some(chrono::Utc::now());
        tracing::debug!(service_id, port, "service running");
        Ok(created.client)
    }

    /// Release one caller's interest in a service; tear the workload down
    /// once no callers remain.
    ///
    /// Always resolves with the service id. Backend teardown failures are
    /// recorded on the service record (state `Zombie`) and never surface
    /// here — releasing the caller's interest must not depend on the
    /// backend cooperating. With `wait_for_backend` the call resolves only
    /// after the backend stop finished; otherwise teardown continues in the
    /// background.
    #[tracing::instrument(skip(self))]
    pub async fn stop_service(
        &self,
        service_id: &str,
        user_id: &str,
        wait_for_backend: bool,
    ) -> Result<String> {
        let slot = { self.services.read().await.get(service_id).cloned() };
        let Some(slot) = slot else {
            return Ok(service_id.to_string());
        };

        let mut record = slot.lock().await;
        if !record.remove_user(user_id) {
            // Other users still depend on the workload.
            return Ok(service_id.to_string());
        }

        if record.state != ServiceState::Running {
            // Nothing launched (or already terminal): drop the record
            // without touching the backend. Zombies stay for diagnostics.
            if record.state != ServiceState::Zombie {
                drop(record);
                self.remove_slot(service_id, &slot).await;
            }
            return Ok(service_id.to_string());
        }

        record.state = ServiceState::ShuttingDown;
        let Some((handle, runtime)) = record.handle.clone().zip(record.runtime.clone()) else {
            drop(record);
            self.remove_slot(service_id, &slot).await;
            return Ok(service_id.to_string());
        };
        let port = record.port;
        drop(record);

        let services = Arc::clone(&self.services);
        let ports = Arc::clone(&self.ports);
        let id = service_id.to_string();
        let slot_for_task = Arc::clone(&slot);
        let teardown = async move {
            match runtime.stop(&handle).await {
                Ok(()) => {
                    // A new start may have taken the record over while the
                    // backend was stopping; only clean up if the shutdown
                    // is still the record's current story. The record lock
                    // is held across the cleanup so a joining start can't
                    // slip between the check and the removal.
                    let record = slot_for_task.lock().await;
                    if record.state != ServiceState::ShuttingDown {
                        return;
                    }
                    ports.release(port).await;
                    let mut map = services.write().await;
                    if let Some(current) = map.get(&id) {
                        if Arc::ptr_eq(current, &slot_for_task) {
                            map.remove(&id);
                        }
                    }
                    drop(map);
                    drop(record);
                    tracing::debug!(service_id = %id, "service stopped");
                }
                Err(e) => {
                    // Workloads don't always shut down cleanly; keep the
                    // record around as a zombie instead of failing the
                    // caller.
                    tracing::warn!(service_id = %id, error = %e, "backend stop failed");
                    let mut record = slot_for_task.lock().await;
                    if record.state == ServiceState::ShuttingDown {
                        record.state = ServiceState::Zombie;
                        record.error = Some(e.to_string());
                    }
                }
            }
        };

        if wait_for_backend {
            teardown.await;
        } else {
            tokio::spawn(teardown);
        }
        Ok(service_id.to_string())
    }

    /// Stop every running workload and clear the registry.
    pub async fn stop_all_services(&self) -> Result<()> {
        let slots: Vec<(String, ServiceSlot)> =
            { self.services.write().await.drain().collect() };

        let stops = slots.into_iter().map(|(id, slot)| async move {
            let record = slot.lock().await;
            if let Some((handle, runtime)) = record.handle.clone().zip(record.runtime.clone()) {
                if let Err(e) = runtime.stop(&handle).await {
                    tracing::warn!(service_id = %id, error = %e, "backend stop failed");
                }
            }
        });
        join_all(stops).await;

        self.ports.release_all().await;
        Ok(())
    }

    /// Remove a slot from the registry, unless it was already superseded.
    async fn remove_slot(&self, service_id: &str, slot: &ServiceSlot) {
        let mut services = self.services.write().await;
        if let Some(current) = services.get(service_id) {
            if Arc::ptr_eq(current, slot) {
                services.remove(service_id);
            }
        }
    }

    /// Resource usage for a service, or `None` when the service is unknown,
    /// the caller isn't registered on it, or the backend has no stats.
    pub async fn get_stats(
        &self,
        service_id: &str,
        user_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let slot = { self.services.read().await.get(service_id).cloned() };
        let Some(slot) = slot else {
            return Ok(None);
        };
        let record = slot.lock().await;
        if !record.users.contains_key(user_id) {
            return Ok(None);
        }
        match record.handle.clone().zip(record.runtime.clone()) {
            Some((handle, runtime)) => runtime.stats(&handle).await,
            None => Ok(None),
        }
    }

    /// Snapshot of every record in the registry.
    pub async fn services(&self) -> HashMap<String, ServiceSnapshot> {
        let slots: Vec<(String, ServiceSlot)> = {
            let services = self.services.read().await;
            services
                .iter()
                .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
                .collect()
        };
        let mut snapshots = HashMap::new();
        for (id, slot) in slots {
            let record = slot.lock().await;
            snapshots.insert(id, ServiceSnapshot::from(&*record));
        }
        snapshots
    }

    // ========================================================================
    // Image and container pass-throughs
    // ========================================================================

    /// List locally available images on the active backend.
    pub async fn get_images(&self) -> Result<Vec<ImageSummary>> {
        self.provider(None)?.list_images().await
    }

    /// Pull one image on the active backend.
    pub async fn pull_image(&self, image_ref: &str) -> Result<PullStream> {
        self.provider(None)?.pull(image_ref).await
    }

    /// Pull a batch of computation images; each outcome stays paired with
    /// the [`ImageSpec`] that requested it, so failures are attributable.
    pub async fn pull_images(&self, specs: Vec<ImageSpec>) -> Vec<ImagePull> {
        let pulls = specs.into_iter().map(|spec| async move {
            let image = format!("{}:latest", spec.image);
            let result = match self.provider(None) {
                Ok(provider) => provider.pull(&image).await,
                Err(e) => Err(e),
            };
            ImagePull {
                id: spec.id,
                name: spec.name,
                result,
            }
        });
        join_all(pulls).await
    }

    /// Pull a batch of images by id (`{id}:latest` each).
    pub async fn pull_images_from_list(&self, ids: Vec<String>) -> Vec<ImagePull> {
        let provider = match self.provider(None) {
            Ok(provider) => provider,
            Err(_) => {
                // Without a provider every item fails identically.
                return ids
                    .into_iter()
                    .map(|id| ImagePull {
                        id,
                        name: None,
                        result: Err(Error::InvalidProvider(
                            self.active_provider().to_string(),
                        )),
                    })
                    .collect();
            }
        };
        let refs: Vec<String> = ids.iter().map(|id| format!("{id}:latest")).collect();
        let outcomes = provider.pull_images_from_list(&refs).await;
        ids.into_iter()
            .zip(outcomes)
            .map(|(id, (_image_ref, result))| ImagePull {
                id,
                name: None,
                result,
            })
            .collect()
    }

    /// Remove one local image on the active backend.
    pub async fn remove_image(&self, image_id: &str) -> Result<()> {
        self.provider(None)?.remove_image(image_id).await
    }

    /// Remove a batch of images by id (`{id}:latest` each), one outcome per
    /// id.
    pub async fn remove_images_from_list(&self, ids: Vec<String>) -> Vec<ImageRemoval> {
        let removals = ids.into_iter().map(|id| async move {
            let image = format!("{id}:latest");
            let result = match self.provider(None) {
                Ok(provider) => provider.remove_image(&image).await,
                Err(e) => Err(e),
            };
            ImageRemoval { id, result }
        });
        join_all(removals).await
    }

    /// List containers on the active backend.
    pub async fn list_containers(&self, filter: Option<&str>) -> Result<Vec<ContainerSummary>> {
        self.provider(None)?.list_containers(filter).await
    }

    /// Logs for one container, attributed to its image.
    pub async fn get_container_logs(&self, container_id: &str) -> Result<ContainerLogs> {
        self.provider(None)?.container_logs(container_id).await
    }

    /// Whether the active backend is reachable.
    pub async fn ping(&self) -> Result<bool> {
        self.provider(None)?.ping().await
    }
}
