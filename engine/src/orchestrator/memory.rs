//! In-process orchestrator
//!
//! Mirrors the swarm semantics the engine relies on: name-keyed services,
//! version-checked updates, conflict on duplicate create, image and network
//! registries. Used for local development runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::orchestrator::{
    Orchestrator, OrchestratorError, RegistryAuth, ServiceSpec, ServiceState,
};

#[derive(Debug, Clone)]
struct StoredService {
    spec: ServiceSpec,
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    services: HashMap<String, StoredService>,
    local_images: HashSet<String>,
    missing_images: HashSet<String>,
    offline_registries: HashSet<String>,
    networks: HashSet<String>,
    pending_version_races: HashSet<String>,
    unreachable: bool,
    pull_gate: Option<Arc<Gate>>,
    write_gate: Option<Arc<Gate>>,
}

/// Parks calls until released, so tests can act while an operation is in flight
#[derive(Debug)]
pub struct Gate {
    entered: watch::Sender<u64>,
    released: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        Self {
            entered: watch::channel(0).0,
            released: watch::channel(false).0,
        }
    }

    /// Resolves once at least one call is parked on the gate
    pub async fn entered(&self) {
        let mut entered = self.entered.subscribe();
        let _ = entered.wait_for(|count| *count > 0).await;
    }

    /// Let every parked and future call through
    pub fn release(&self) {
        self.released.send_replace(true);
    }

    async fn pass(&self) {
        let mut released = self.released.subscribe();
        self.entered.send_modify(|count| *count += 1);
        let _ = released.wait_for(|open| *open).await;
    }
}

/// Call counters, useful to assert which path a reconcile took
#[derive(Debug, Default)]
pub struct CallCounts {
    pub creates: AtomicU64,
    pub updates: AtomicU64,
    pub pulls: AtomicU64,
    pub network_creates: AtomicU64,
}

/// Orchestrator that keeps its registry in memory
#[derive(Debug, Default)]
pub struct MemoryOrchestrator {
    inner: Mutex<Inner>,
    version_clock: AtomicU64,
    pub calls: CallCounts,
}

impl MemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make pulls of `image` fail as if the registry did not know it
    pub fn mark_image_missing(&self, image: &str) {
        self.lock().missing_images.insert(image.to_string());
    }

    /// Make pulls of `image` fail as if its registry could not be reached
    pub fn mark_registry_unreachable(&self, image: &str) {
        self.lock().offline_registries.insert(image.to_string());
    }

    /// Park image pulls until the returned gate is released
    pub fn hold_pulls(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.lock().pull_gate = Some(gate.clone());
        gate
    }

    /// Park service creates and updates until the returned gate is released
    pub fn hold_writes(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.lock().write_gate = Some(gate.clone());
        gate
    }

    /// Make every call fail as if the API could not be reached
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Bump the version of `name` right before its next update, so that
    /// update loses an optimistic-concurrency race exactly once
    pub fn inject_version_race(&self, name: &str) {
        self.lock().pending_version_races.insert(name.to_string());
    }

    /// Spec currently stored for `name`
    pub fn spec(&self, name: &str) -> Option<ServiceSpec> {
        self.lock().services.get(name).map(|s| s.spec.clone())
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock().local_images.contains(image)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pass_gate(&self, pick: fn(&Inner) -> Option<Arc<Gate>>) {
        let gate = pick(&self.lock());
        if let Some(gate) = gate {
            gate.pass().await;
        }
    }

    fn next_version(&self) -> u64 {
        self.version_clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn reachable(inner: &Inner) -> Result<(), OrchestratorError> {
        if inner.unreachable {
            return Err(OrchestratorError::Unreachable(
                "in-memory orchestrator marked unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

fn state_of(stored: &StoredService) -> ServiceState {
    ServiceState {
        name: stored.spec.name.clone(),
        version_index: stored.version,
        image: stored.spec.image.clone(),
        desired_replicas: stored.spec.replicas,
        current_replicas: stored.spec.replicas,
        last_task_status: Some(if stored.spec.replicas > 0 { "running" } else { "shutdown" }.to_string()),
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn get_service(&self, name: &str) -> Result<Option<ServiceState>, OrchestratorError> {
        let inner = self.lock();
        Self::reachable(&inner)?;
        Ok(inner.services.get(name).map(state_of))
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), OrchestratorError> {
        self.pass_gate(|inner| inner.write_gate.clone()).await;
        let version = self.next_version();
        let mut inner = self.lock();
        Self::reachable(&inner)?;
        if inner.services.contains_key(&spec.name) {
            return Err(OrchestratorError::Conflict(format!(
                "service {} already exists",
                spec.name
            )));
        }
        inner.services.insert(
            spec.name.clone(),
            StoredService {
                spec: spec.clone(),
                version,
            },
        );
        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), OrchestratorError> {
        self.pass_gate(|inner| inner.write_gate.clone()).await;
        let raced_version = self.next_version();
        let new_version = self.next_version();
        let mut inner = self.lock();
        Self::reachable(&inner)?;

        let raced = inner.pending_version_races.remove(name);
        let stored = inner
            .services
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("service {}", name)))?;
        if raced {
            stored.version = raced_version;
        }
        if stored.version != version {
            return Err(OrchestratorError::VersionConflict(format!(
                "service {}: update out of sequence (have {}, got {})",
                name, stored.version, version
            )));
        }

        stored.spec = spec.clone();
        stored.version = new_version;
        self.calls.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, OrchestratorError> {
        let inner = self.lock();
        Self::reachable(&inner)?;
        Ok(inner.local_images.contains(image))
    }

    async fn pull_image(
        &self,
        image: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), OrchestratorError> {
        self.pass_gate(|inner| inner.pull_gate.clone()).await;
        let mut inner = self.lock();
        Self::reachable(&inner)?;
        self.calls.pulls.fetch_add(1, Ordering::SeqCst);
        if inner.missing_images.contains(image) {
            return Err(OrchestratorError::ImageNotFound(image.to_string()));
        }
        if inner.offline_registries.contains(image) {
            return Err(OrchestratorError::RegistryUnreachable(format!(
                "{}: dial tcp: i/o timeout",
                image
            )));
        }
        inner.local_images.insert(image.to_string());
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, OrchestratorError> {
        let inner = self.lock();
        Self::reachable(&inner)?;
        Ok(inner.networks.contains(name))
    }

    async fn create_network(&self, name: &str) -> Result<(), OrchestratorError> {
        let mut inner = self.lock();
        Self::reachable(&inner)?;
        if !inner.networks.insert(name.to_string()) {
            return Err(OrchestratorError::Conflict(format!("network {}", name)));
        }
        self.calls.network_creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_conflict() {
        let orchestrator = MemoryOrchestrator::new();
        let spec = ServiceSpec::new("web", "nginx:1.27");

        orchestrator.create_service(&spec).await.unwrap();
        let err = orchestrator.create_service(&spec).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_requires_current_version() {
        let orchestrator = MemoryOrchestrator::new();
        let spec = ServiceSpec::new("web", "nginx:1.27");
        orchestrator.create_service(&spec).await.unwrap();

        let state = orchestrator.get_service("web").await.unwrap().unwrap();
        orchestrator
            .update_service("web", state.version_index, &spec)
            .await
            .unwrap();

        let stale = orchestrator
            .update_service("web", state.version_index, &spec)
            .await
            .unwrap_err();
        assert!(matches!(stale, OrchestratorError::VersionConflict(_)));

        let updated = orchestrator.get_service("web").await.unwrap().unwrap();
        assert!(updated.version_index > state.version_index);
    }

    #[tokio::test]
    async fn test_missing_image_pull() {
        let orchestrator = MemoryOrchestrator::new();
        orchestrator.mark_image_missing("ghost:1");

        assert!(orchestrator.pull_image("nginx:1.27", None).await.is_ok());
        assert!(orchestrator.image_exists("nginx:1.27").await.unwrap());
        assert!(matches!(
            orchestrator.pull_image("ghost:1", None).await,
            Err(OrchestratorError::ImageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_held_pull_waits_for_release() {
        let orchestrator = Arc::new(MemoryOrchestrator::new());
        let gate = orchestrator.hold_pulls();

        let pulling = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.pull_image("nginx:1.27", None).await })
        };
        gate.entered().await;
        assert!(!orchestrator.has_image("nginx:1.27"));

        gate.release();
        pulling.await.unwrap().unwrap();
        assert!(orchestrator.has_image("nginx:1.27"));
    }
}
