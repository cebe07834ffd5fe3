//! Shared test harness: a recording fake engine and scriptable services.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use miniboss::{
    ContainerEngine, ContainerState, Error, ExistingContainer, Network, Orchestrator, Result,
    Service, ServiceSpec, SharedContext,
};
use serde_json::Value;

/// One recorded engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateNetwork(String),
    RemoveNetwork(String),
    ExistingOnNetwork(String),
    CheckImage(String),
    BuildImage(String),
    RunService {
        prefix: String,
        service: String,
        image: String,
    },
    RunContainer(String),
    StopContainer(String),
    RemoveContainer(String),
}

#[derive(Default)]
struct FakeEngineState {
    containers: Vec<ExistingContainer>,
    calls: Vec<EngineCall>,
    counter: usize,
    fail_run_service: HashSet<String>,
}

/// In-memory engine double that records every call and keeps a container
/// store the reconciliation logic can run against.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeEngineState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed an existing container into the store
    pub fn add_container(
        &self,
        name: &str,
        state: ContainerState,
        image_tags: &[&str],
        env: &[(&str, &str)],
    ) {
        let mut guard = self.state.lock().unwrap();
        guard.containers.push(ExistingContainer {
            id: format!("id-{name}"),
            name: name.to_string(),
            state,
            image_tags: image_tags.iter().map(ToString::to_string).collect(),
            env: env
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        });
    }

    /// Make `run_service_on_network` fail for a service
    pub fn fail_run_service(&self, service: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_run_service
            .insert(service.to_string());
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Services that had a fresh container created, in call order
    pub fn created_services(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::RunService { service, .. } => Some(service),
                _ => None,
            })
            .collect()
    }

    /// Container ids passed to `stop_container`, in call order
    pub fn stopped_containers(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::StopContainer(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Container ids passed to `remove_container`, in call order
    pub fn removed_containers(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::RemoveContainer(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Image tags passed to `build_image`, in call order
    pub fn built_tags(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::BuildImage(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    /// Container ids passed to `run_container` (restarts), in call order
    pub fn restarted_containers(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::RunContainer(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn network_creations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::CreateNetwork(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn network_removals(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::RemoveNetwork(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Snapshot of a stored container by name
    pub fn container(&self, name: &str) -> Option<ExistingContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|container| container.name == name)
            .cloned()
    }

    /// Names of containers currently in the store
    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|container| container.name.clone())
            .collect()
    }
}

fn env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_network(&self, name: &str) -> Result<Network> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::CreateNetwork(name.to_string()));
        Ok(Network {
            name: name.to_string(),
            id: format!("net-{name}"),
        })
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::RemoveNetwork(name.to_string()));
        Ok(())
    }

    async fn existing_on_network(
        &self,
        prefix: &str,
        _network: &Network,
    ) -> Result<Vec<ExistingContainer>> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(EngineCall::ExistingOnNetwork(prefix.to_string()));
        Ok(state
            .containers
            .iter()
            .filter(|container| container.name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn check_image(&self, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::CheckImage(tag.to_string()));
        Ok(())
    }

    async fn build_image(&self, _build_dir: &Path, _dockerfile: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::BuildImage(tag.to_string()));
        Ok(())
    }

    async fn run_service_on_network(
        &self,
        prefix: &str,
        spec: &ServiceSpec,
        _network: &Network,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::RunService {
            prefix: prefix.to_string(),
            service: spec.name.clone(),
            image: spec.image.clone(),
        });
        if state.fail_run_service.contains(&spec.name) {
            return Err(Error::container_start(
                format!("{prefix}-0000"),
                "scripted start failure",
            ));
        }
        state.counter += 1;
        let name = format!("{prefix}-{:04}", state.counter);
        let env = spec
            .env
            .iter()
            .map(|(key, value)| (key.clone(), env_string(value)))
            .collect();
        state.containers.push(ExistingContainer {
            id: format!("id-{name}"),
            name: name.clone(),
            state: ContainerState::Running,
            image_tags: vec![spec.image.clone()],
            env,
        });
        Ok(name)
    }

    async fn run_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::RunContainer(id.to_string()));
        if let Some(container) = state
            .containers
            .iter_mut()
            .find(|container| container.id == id || container.name == id)
        {
            container.state = ContainerState::Running;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::StopContainer(id.to_string()));
        if let Some(container) = state
            .containers
            .iter_mut()
            .find(|container| container.id == id || container.name == id)
        {
            container.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::RemoveContainer(id.to_string()));
        state
            .containers
            .retain(|container| container.id != id && container.name != id);
        Ok(())
    }
}

/// How a scripted service answers readiness pings
#[derive(Clone)]
pub enum PingBehavior {
    /// Ready on the first ping
    Ready,
    /// Never ready; the deadline will elapse
    Never,
    /// Every ping errors
    Fail,
    /// Ready once all barrier participants are pinging concurrently
    Rendezvous(Arc<tokio::sync::Barrier>),
}

/// Invocation counters shared with the test body
#[derive(Default)]
pub struct ServiceCounters {
    pings: AtomicUsize,
    pre_starts: AtomicUsize,
    post_starts: AtomicUsize,
}

impl ServiceCounters {
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn pre_starts(&self) -> usize {
        self.pre_starts.load(Ordering::SeqCst)
    }

    pub fn post_starts(&self) -> usize {
        self.post_starts.load(Ordering::SeqCst)
    }
}

/// A service with scripted ping behavior and counted hook invocations
pub struct ScriptedService {
    spec: ServiceSpec,
    ping: PingBehavior,
    pub counters: Arc<ServiceCounters>,
}

impl ScriptedService {
    pub fn new(spec: ServiceSpec) -> Self {
        Self::with_ping(spec, PingBehavior::Ready)
    }

    pub fn with_ping(spec: ServiceSpec, ping: PingBehavior) -> Self {
        Self {
            spec,
            ping,
            counters: Arc::new(ServiceCounters::default()),
        }
    }
}

#[async_trait]
impl Service for ScriptedService {
    fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    async fn ping(&self) -> Result<bool> {
        self.counters.pings.fetch_add(1, Ordering::SeqCst);
        match &self.ping {
            PingBehavior::Ready => Ok(true),
            PingBehavior::Never => Ok(false),
            PingBehavior::Fail => Err(Error::engine("scripted ping failure")),
            PingBehavior::Rendezvous(barrier) => {
                barrier.wait().await;
                Ok(true)
            }
        }
    }

    async fn pre_start(&self, _context: &SharedContext) -> Result<()> {
        self.counters.pre_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn post_start(&self, _context: &SharedContext) -> Result<()> {
        self.counters.post_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Group name used by all integration tests
pub const GROUP: &str = "testgroup";

/// Route orchestration logs to the test writer, honoring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Assemble an orchestrator over the fake engine
pub fn orchestrator(
    engine: &Arc<FakeEngine>,
    run_dir: &Path,
    services: Vec<Arc<ScriptedService>>,
) -> Orchestrator {
    let mut builder = Orchestrator::builder()
        .group_name(GROUP)
        .run_dir(run_dir)
        .engine(Arc::clone(engine) as Arc<dyn ContainerEngine>);
    for service in services {
        builder = builder.service_arc(service as Arc<dyn Service>);
    }
    builder.build().expect("orchestrator builds")
}

/// Short timeout suitable for tests that never wait on readiness
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);
