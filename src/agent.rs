//! Per-service agents.
//!
//! A [`ServiceAgent`] is the bookkeeping record the running context keeps
//! for every service in a run: the still-open dependency and dependant
//! edges, the agent status, and the assigned action. The execution side is
//! [`AgentRun`], a one-shot worker the orchestrator spawns per ready agent;
//! it performs the START or STOP semantics against the engine and reports
//! the outcome back to the running context.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::context::SharedContext;
use crate::engine::{ContainerEngine, ContainerState};
use crate::errors::{Error, Result};
use crate::registry::RegisteredService;
use crate::running_context::RunningContext;
use crate::service::{env_value_string, Service};
use crate::types::{AgentAction, AgentStatus, GroupName, Options, RunAction, RunCondition};

/// Interval between readiness pings
pub(crate) const PING_INTERVAL: Duration = Duration::from_millis(100);

/// Bookkeeping record for one service within a run.
pub struct ServiceAgent {
    service: Arc<dyn Service>,
    open_dependencies: HashSet<String>,
    open_dependants: HashSet<String>,
    status: AgentStatus,
    action: Option<AgentAction>,
}

impl ServiceAgent {
    /// Create the agent record for a registered service
    pub fn new(registered: &RegisteredService) -> Self {
        Self {
            service: Arc::clone(&registered.service),
            open_dependencies: registered.dependencies().iter().cloned().collect(),
            open_dependants: registered.dependants.iter().cloned().collect(),
            status: AgentStatus::Null,
            action: None,
        }
    }

    /// The service name
    pub fn name(&self) -> &str {
        &self.service.spec().name
    }

    /// The service this agent drives
    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// Current agent status
    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// The assigned action, if any
    pub fn action(&self) -> Option<AgentAction> {
        self.action
    }

    /// Dependencies not yet processed
    pub fn open_dependencies(&self) -> &HashSet<String> {
        &self.open_dependencies
    }

    /// Ready for START: no open dependencies and not yet claimed
    pub fn can_start(&self) -> bool {
        self.open_dependencies.is_empty() && self.status == AgentStatus::Null
    }

    /// Ready for STOP: no open dependants and not yet claimed
    pub fn can_stop(&self) -> bool {
        self.open_dependants.is_empty() && self.status == AgentStatus::Null
    }

    /// Claim the agent for `action`, moving it to in-progress
    pub(crate) fn claim(&mut self, action: AgentAction) {
        self.action = Some(action);
        self.status = AgentStatus::InProgress;
    }

    /// Record a terminal status
    pub(crate) fn mark(&mut self, status: AgentStatus) {
        self.status = status;
    }

    /// Drop `name` from the open dependency set
    pub fn process_service_started(&mut self, name: &str) {
        self.open_dependencies.remove(name);
    }

    /// Drop `name` from the open dependant set
    pub fn process_service_stopped(&mut self, name: &str) {
        self.open_dependants.remove(name);
    }
}

/// One-shot executor for a claimed agent.
///
/// Owns everything the action needs: the service, the shared run options,
/// the engine and context handles, and the running context to report back
/// to.
pub struct AgentRun {
    service: Arc<dyn Service>,
    action: Option<AgentAction>,
    options: Arc<Options>,
    group: GroupName,
    engine: Arc<dyn ContainerEngine>,
    context: SharedContext,
    running: Arc<RunningContext>,
}

impl AgentRun {
    /// Assemble an executor for `service` with `action`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: Arc<dyn Service>,
        action: Option<AgentAction>,
        options: Arc<Options>,
        group: GroupName,
        engine: Arc<dyn ContainerEngine>,
        context: SharedContext,
        running: Arc<RunningContext>,
    ) -> Self {
        Self {
            service,
            action,
            options,
            group,
            engine,
            context,
            running,
        }
    }

    /// The name prefix shared by all containers of this service in this
    /// group
    pub fn container_name_prefix(&self) -> String {
        format!("{}-{}", self.service.spec().name, self.group)
    }

    /// Execute the assigned action and report the outcome to the running
    /// context.
    ///
    /// Running without an assigned action is a programmer error: the
    /// service is marked failed and the contract violation is returned.
    pub async fn run(self) -> Result<()> {
        let name = self.service.spec().name.clone();
        match self.action {
            Some(AgentAction::Start) => {
                self.start_service().await;
                Ok(())
            }
            Some(AgentAction::Stop) => {
                self.stop_service().await;
                Ok(())
            }
            None => {
                self.running.service_failed(&name);
                Err(Error::agent_contract(format!(
                    "agent for service {name} cannot be run without an action set"
                )))
            }
        }
    }

    async fn start_service(&self) {
        let name = self.service.spec().name.clone();
        let mut condition = RunCondition::new();
        let mut started_container: Option<String> = None;
        match self
            .execute_start(&mut condition, &mut started_container)
            .await
        {
            Ok(()) => {
                info!(service = %name, "service started successfully");
                self.running.service_started(&name);
            }
            Err(err) => {
                condition.fail();
                error!(service = %name, error = %err, "error starting service");
                if condition.contains(RunAction::Start) {
                    if let Some(container) = started_container {
                        self.discard_container(&container).await;
                    }
                }
                self.running.service_failed(&name);
            }
        }
    }

    async fn execute_start(
        &self,
        condition: &mut RunCondition,
        started_container: &mut Option<String>,
    ) -> Result<()> {
        let spec = self.service.spec();
        let prefix = self.container_name_prefix();

        let mut image = spec.image.clone();
        let needs_build = self.options.build.contains(&spec.name)
            || (spec.build_from.is_some() && image.ends_with(":latest"));
        if needs_build {
            image = self.build_image().await?;
            condition.image_built();
        }

        let env = {
            let context = self.context.lock().expect("context lock poisoned");
            context.extrapolate_values(&spec.env)?
        };

        let mut existing = self
            .engine
            .existing_on_network(&prefix, &self.options.network)
            .await?;
        // first deterministically ordered match is canonical
        existing.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(candidate) = existing.first() {
            match candidate.state {
                ContainerState::Running => {
                    info!(
                        service = %spec.name,
                        container = %candidate.name,
                        "found running container, not starting a new one"
                    );
                    condition.already_running();
                    return Ok(());
                }
                ContainerState::Exited => {
                    let differing: Vec<&str> = env
                        .iter()
                        .filter(|&(key, value)| {
                            candidate.env.get(key).map(String::as_str)
                                != Some(env_value_string(value).as_str())
                        })
                        .map(|(key, _)| key.as_str())
                        .collect();
                    if !differing.is_empty() {
                        info!(
                            service = %spec.name,
                            keys = %differing.join(","),
                            "differing env keys in existing container"
                        );
                    }
                    let start_new = spec.always_start_new
                        || !candidate.image_tags.contains(&image)
                        || !differing.is_empty();
                    if !start_new {
                        info!(
                            service = %spec.name,
                            container = %candidate.name,
                            "restarting existing container"
                        );
                        self.engine.run_container(&candidate.id).await?;
                        *started_container = Some(candidate.id.clone());
                        condition.started();
                        self.wait_ready().await?;
                        condition.pinged();
                        return Ok(());
                    }
                }
                _ => {}
            }
        }

        info!(service = %spec.name, "creating new container");
        self.service.pre_start(&self.context).await?;
        condition.pre_started();

        let mut effective = spec.clone();
        effective.image = image;
        effective.env = env;
        let container_name = self
            .engine
            .run_service_on_network(&prefix, &effective, &self.options.network)
            .await?;
        *started_container = Some(container_name);
        condition.started();

        self.wait_ready().await?;
        condition.pinged();

        self.service.post_start(&self.context).await?;
        condition.post_started();
        Ok(())
    }

    async fn build_image(&self) -> Result<String> {
        let spec = self.service.spec();
        let build_from = spec.build_from.as_deref().ok_or_else(|| {
            Error::definition(format!(
                "service {} cannot be built: no build directory specified",
                spec.name
            ))
        })?;
        let time_tag = chrono::Local::now().format("%Y-%m-%d-%H%M");
        let image_tag = format!("{}-{}-{}", spec.name, self.group, time_tag);
        let build_dir = self.options.run_dir.join(build_from);
        info!(
            service = %spec.name,
            tag = %image_tag,
            directory = %build_dir.display(),
            "building image"
        );
        self.engine
            .build_image(&build_dir, &spec.dockerfile, &image_tag)
            .await?;
        Ok(image_tag)
    }

    /// Poll the service's ping every 100 ms against a monotonic deadline.
    async fn wait_ready(&self) -> Result<()> {
        let spec = self.service.spec();
        let started = tokio::time::Instant::now();
        while started.elapsed() < self.options.timeout {
            if self.service.ping().await? {
                info!(service = %spec.name, "service pinged successfully");
                return Ok(());
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }
        error!(
            service = %spec.name,
            timeout_seconds = self.options.timeout.as_secs(),
            "could not ping service within timeout"
        );
        Err(Error::readiness_timeout(
            &spec.name,
            self.options.timeout.as_secs(),
        ))
    }

    async fn discard_container(&self, container: &str) {
        debug!(container = %container, "discarding partially initialized container");
        if let Err(err) = self
            .engine
            .stop_container(container, self.options.timeout)
            .await
        {
            warn!(container = %container, error = %err, "could not stop container");
        }
        if let Err(err) = self.engine.remove_container(container).await {
            warn!(container = %container, error = %err, "could not remove container");
        }
    }

    async fn stop_service(&self) {
        let name = self.service.spec().name.clone();
        if let Err(err) = self.execute_stop().await {
            warn!(service = %name, error = %err, "error stopping service");
        }
        self.running.service_stopped(&name);
    }

    async fn execute_stop(&self) -> Result<()> {
        let spec = self.service.spec();
        let prefix = self.container_name_prefix();
        let existing = self
            .engine
            .existing_on_network(&prefix, &self.options.network)
            .await?;
        if existing.is_empty() {
            info!(service = %spec.name, "no containers to stop");
        }
        for container in existing {
            if container.state == ContainerState::Running {
                self.engine
                    .stop_container(&container.id, self.options.timeout)
                    .await?;
                info!(container = %container.name, "stopped container");
            }
            if self.options.remove {
                self.engine.remove_container(&container.id).await?;
                info!(container = %container.name, "removed container");
            }
        }
        Ok(())
    }
}
