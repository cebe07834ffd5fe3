//! The orchestrator: loads definitions, drives start/stop/reload runs.
//!
//! Built once per user program via [`OrchestratorBuilder`], which validates
//! every registered definition up front. Each operation builds a fresh
//! registry from the definitions, reduces it by exclusions or the reload
//! scope, resolves the user network through the engine, and then drives a
//! [`RunningContext`]: every agent that becomes ready is spawned as a task,
//! with a 10 ms poll between rounds, until all agents are terminal.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::agent::AgentRun;
use crate::context::{Context, SharedContext};
use crate::docker::DockerCli;
use crate::engine::ContainerEngine;
use crate::errors::{Error, Result};
use crate::registry::ServiceRegistry;
use crate::running_context::RunningContext;
use crate::service::Service;
use crate::types::{AgentAction, GroupName, Network, Options};

/// Interval between driver polls of the ready sets
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type ServicesHook = Box<dyn Fn(&[String]) + Send + Sync>;
type ServiceHook = Box<dyn Fn(&str) + Send + Sync>;

/// Callbacks fired after top-level operations complete.
///
/// A panicking hook is logged and swallowed; it never breaks the
/// operation.
#[derive(Default)]
struct LifecycleHooks {
    on_start_services: Option<ServicesHook>,
    on_stop_services: Option<ServicesHook>,
    on_reload_service: Option<ServiceHook>,
}

impl LifecycleHooks {
    fn fire_started(&self, names: &[String]) {
        if let Some(hook) = &self.on_start_services {
            if catch_unwind(AssertUnwindSafe(|| hook(names))).is_err() {
                error!("on_start_services hook panicked");
            }
        }
    }

    fn fire_stopped(&self, names: &[String]) {
        if let Some(hook) = &self.on_stop_services {
            if catch_unwind(AssertUnwindSafe(|| hook(names))).is_err() {
                error!("on_stop_services hook panicked");
            }
        }
    }

    fn fire_reloaded(&self, name: &str) {
        if let Some(hook) = &self.on_reload_service {
            if catch_unwind(AssertUnwindSafe(|| hook(name))).is_err() {
                error!("on_reload_service hook panicked");
            }
        }
    }
}

/// Builder for [`Orchestrator`]; collects definitions, the group identity
/// and the collaborating handles.
#[derive(Default)]
pub struct OrchestratorBuilder {
    group_name: Option<String>,
    run_dir: Option<PathBuf>,
    definitions: Vec<Arc<dyn Service>>,
    engine: Option<Arc<dyn ContainerEngine>>,
    context: Option<SharedContext>,
    hooks: LifecycleHooks,
}

impl OrchestratorBuilder {
    /// Set the group name explicitly instead of deriving it from the run
    /// directory
    #[must_use]
    pub fn group_name(mut self, name: impl Into<String>) -> Self {
        self.group_name = Some(name.into());
        self
    }

    /// Set the run directory: the base for relative build contexts and the
    /// home of the persisted context file
    #[must_use]
    pub fn run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = Some(dir.into());
        self
    }

    /// Register a service definition
    #[must_use]
    pub fn service(mut self, service: impl Service + 'static) -> Self {
        self.definitions.push(Arc::new(service));
        self
    }

    /// Register an already shared service definition
    #[must_use]
    pub fn service_arc(mut self, service: Arc<dyn Service>) -> Self {
        self.definitions.push(service);
        self
    }

    /// Use a specific engine instead of the Docker CLI adapter
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Use an existing shared context instead of a fresh one
    #[must_use]
    pub fn context(mut self, context: SharedContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Invoke `hook` with the started names after `start` completes
    #[must_use]
    pub fn on_start_services(mut self, hook: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.hooks.on_start_services = Some(Box::new(hook));
        self
    }

    /// Invoke `hook` with the stopped names after `stop` completes
    #[must_use]
    pub fn on_stop_services(mut self, hook: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.hooks.on_stop_services = Some(Box::new(hook));
        self
    }

    /// Invoke `hook` with the service name after `reload` completes
    #[must_use]
    pub fn on_reload_service(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hooks.on_reload_service = Some(Box::new(hook));
        self
    }

    /// Validate the definitions and assemble the orchestrator.
    ///
    /// Fails on a missing run directory, an underivable group name, any
    /// malformed definition, or a broken dependency graph.
    pub fn build(self) -> Result<Orchestrator> {
        let run_dir = self
            .run_dir
            .ok_or_else(|| Error::service_load("run directory is not set"))?;
        let group = match self.group_name {
            Some(name) => GroupName::new(name)?,
            None => GroupName::from_run_dir(&run_dir)?,
        };
        // surface definition and graph errors before any engine call
        ServiceRegistry::from_definitions(&self.definitions)?;
        let engine = match self.engine {
            Some(engine) => engine,
            None => Arc::new(DockerCli::new()?),
        };
        Ok(Orchestrator {
            group,
            run_dir,
            definitions: self.definitions,
            engine,
            context: self.context.unwrap_or_else(Context::shared),
            hooks: self.hooks,
        })
    }
}

/// Drives the lifecycle of a registered service stack.
pub struct Orchestrator {
    group: GroupName,
    run_dir: PathBuf,
    definitions: Vec<Arc<dyn Service>>,
    engine: Arc<dyn ContainerEngine>,
    context: SharedContext,
    hooks: LifecycleHooks,
}

impl Orchestrator {
    /// Start building an orchestrator
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// The group name namespacing this stack
    pub fn group_name(&self) -> &GroupName {
        &self.group
    }

    /// The run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// The shared context handle
    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// The network name used when none is given on the command line
    pub fn default_network_name(&self) -> String {
        format!("miniboss-{}", self.group)
    }

    /// Build a fresh registry from the registered definitions
    pub fn registry(&self) -> Result<ServiceRegistry> {
        ServiceRegistry::from_definitions(&self.definitions)
    }

    /// Start every service in `registry`, honoring dependency order.
    ///
    /// Ensures the user network exists first; returns the names that
    /// started successfully, in completion order. Failures are cascaded
    /// onto dependants and logged.
    pub async fn start_all(
        &self,
        registry: ServiceRegistry,
        mut options: Options,
    ) -> Result<Vec<String>> {
        options.network = self.engine.create_network(&options.network.name).await?;
        let options = Arc::new(options);
        let running = Arc::new(RunningContext::new(&registry));
        self.drive(&running, AgentAction::Start, &options).await;
        let failed = running.failed();
        if !failed.is_empty() {
            error!(
                services = %failed.join(","),
                "failed to start following services"
            );
        }
        Ok(running.processed())
    }

    /// Stop every service in `registry`, dependants first.
    ///
    /// Removes the user network afterwards when `options.remove` is set
    /// and no service was excluded. Returns the stopped names in
    /// completion order.
    pub async fn stop_all(
        &self,
        registry: ServiceRegistry,
        options: Options,
    ) -> Result<Vec<String>> {
        let had_exclusions = !registry.excluded().is_empty();
        let options = Arc::new(options);
        let running = Arc::new(RunningContext::new(&registry));
        self.drive(&running, AgentAction::Stop, &options).await;
        if options.remove && !had_exclusions {
            self.engine.remove_network(&options.network.name).await?;
        }
        Ok(running.processed())
    }

    /// Stop `name` and everything that transitively depends on it, then
    /// start the stack again with `name` scheduled for an image rebuild.
    ///
    /// Services outside the reload scope keep their running containers and
    /// are reused on the way back up.
    pub async fn reload_service(&self, name: &str, options: Options) -> Result<Vec<String>> {
        let mut stop_registry = self.registry()?;
        stop_registry.check_can_be_built(name)?;
        stop_registry.restrict_to_dependants_of(name)?;
        self.stop_all(stop_registry, options.clone()).await?;

        // the context is only needed for the restart
        {
            let mut context = self.context.lock().expect("context lock poisoned");
            context.load_from(&options.run_dir)?;
        }

        let registry = self.registry()?;
        let mut options = options;
        options.build = vec![name.to_string()];
        self.start_all(registry, options).await
    }

    async fn drive(
        &self,
        running: &Arc<RunningContext>,
        action: AgentAction,
        options: &Arc<Options>,
    ) {
        while !running.done() {
            let ready = match action {
                AgentAction::Start => running.take_ready_to_start(),
                AgentAction::Stop => running.take_ready_to_stop(),
            };
            for agent in ready {
                let run = AgentRun::new(
                    agent.service,
                    Some(agent.action),
                    Arc::clone(options),
                    self.group.clone(),
                    Arc::clone(&self.engine),
                    Arc::clone(&self.context),
                    Arc::clone(running),
                );
                tokio::spawn(async move {
                    if let Err(err) = run.run().await {
                        error!(error = %err, "agent run rejected");
                    }
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn make_options(
        &self,
        network_name: Option<&str>,
        timeout: Duration,
        remove: bool,
        build: Vec<String>,
    ) -> Options {
        let network_name = network_name
            .map(ToString::to_string)
            .unwrap_or_else(|| self.default_network_name());
        Options {
            network: Network::new(network_name),
            timeout,
            remove,
            run_dir: self.run_dir.clone(),
            build,
        }
    }

    /// Top-level start command: load the persisted context, start
    /// everything but `exclude`, save the context, fire the start hook.
    pub async fn start(
        &self,
        exclude: &[String],
        network_name: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        {
            let mut context = self.context.lock().expect("context lock poisoned");
            context.load_from(&self.run_dir)?;
        }
        let mut registry = self.registry()?;
        registry.exclude_for_start(exclude)?;
        let options = self.make_options(network_name, timeout, false, Vec::new());
        let started = self.start_all(registry, options).await?;
        info!(services = %started.join(", "), "started services");
        {
            let context = self.context.lock().expect("context lock poisoned");
            context.save_to(&self.run_dir)?;
        }
        self.hooks.fire_started(&started);
        Ok(started)
    }

    /// Top-level stop command: stop everything but `exclude`, drop the
    /// persisted context when removing, fire the stop hook.
    pub async fn stop(
        &self,
        exclude: &[String],
        network_name: Option<&str>,
        remove: bool,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let excluded = if exclude.is_empty() {
            "none".to_string()
        } else {
            exclude.join(",")
        };
        info!(excluded = %excluded, "stopping services");
        let mut registry = self.registry()?;
        registry.exclude_for_stop(exclude)?;
        let options = self.make_options(network_name, timeout, remove, Vec::new());
        let stopped = self.stop_all(registry, options).await?;
        if remove {
            Context::remove_file(&self.run_dir)?;
        }
        self.hooks.fire_stopped(&stopped);
        Ok(stopped)
    }

    /// Top-level reload command: reload `service` and its dependants, save
    /// the context, fire the reload hook.
    pub async fn reload(
        &self,
        service: &str,
        network_name: Option<&str>,
        remove: bool,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let options = self.make_options(network_name, timeout, remove, Vec::new());
        let started = self.reload_service(service, options).await?;
        {
            let context = self.context.lock().expect("context lock poisoned");
            context.save_to(&self.run_dir)?;
        }
        self.hooks.fire_reloaded(service);
        Ok(started)
    }

    /// Parse command-line arguments and run the selected subcommand.
    ///
    /// Returns the process exit code: success on a clean run, failure on
    /// any load or runtime error.
    pub async fn cli(&self) -> std::process::ExitCode {
        crate::cli::run(self).await
    }
}
