//! Shared progress ledger for one orchestrator run.
//!
//! The running context owns the pending agent set plus the processed and
//! failed name lists, all behind a single mutex. Agents mutate only their
//! own local state; every cross-agent edit (dropping a finished service
//! from other agents' open sets, cascading a failure onto dependants)
//! happens here, under the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::agent::ServiceAgent;
use crate::registry::ServiceRegistry;
use crate::service::Service;
use crate::types::{AgentAction, AgentStatus};

/// An agent claimed from the ready set, carrying what its executor needs
pub struct ReadyAgent {
    /// The service name
    pub name: String,
    /// The service definition and hooks
    pub service: Arc<dyn Service>,
    /// The action the agent was claimed for
    pub action: AgentAction,
}

struct RunningState {
    pending: HashMap<String, ServiceAgent>,
    processed: Vec<String>,
    failed: Vec<String>,
}

/// Thread-safe progress state shared by the driver loop and all agents.
pub struct RunningContext {
    state: Mutex<RunningState>,
}

impl RunningContext {
    /// Create the ledger for a run over `registry`
    pub fn new(registry: &ServiceRegistry) -> Self {
        let pending = registry
            .iter()
            .map(|registered| (registered.name().to_string(), ServiceAgent::new(registered)))
            .collect();
        Self {
            state: Mutex::new(RunningState {
                pending,
                processed: Vec::new(),
                failed: Vec::new(),
            }),
        }
    }

    /// Whether every agent has reached a terminal state
    pub fn done(&self) -> bool {
        self.state.lock().expect("running context lock").pending.is_empty()
    }

    /// Whether any service failed
    pub fn has_failures(&self) -> bool {
        !self.state.lock().expect("running context lock").failed.is_empty()
    }

    /// Names processed so far, in completion order
    pub fn processed(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("running context lock")
            .processed
            .clone()
    }

    /// Names failed so far
    pub fn failed(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("running context lock")
            .failed
            .clone()
    }

    /// Claim every agent whose dependencies are all processed.
    ///
    /// Claimed agents are atomically marked in-progress with the START
    /// action, so a later poll cannot claim them again.
    pub fn take_ready_to_start(&self) -> Vec<ReadyAgent> {
        self.take_ready(AgentAction::Start)
    }

    /// Claim every agent whose dependants are all processed
    pub fn take_ready_to_stop(&self) -> Vec<ReadyAgent> {
        self.take_ready(AgentAction::Stop)
    }

    fn take_ready(&self, action: AgentAction) -> Vec<ReadyAgent> {
        let mut state = self.state.lock().expect("running context lock");
        let ready_names: Vec<String> = state
            .pending
            .values()
            .filter(|agent| match action {
                AgentAction::Start => agent.can_start(),
                AgentAction::Stop => agent.can_stop(),
            })
            .map(|agent| agent.name().to_string())
            .collect();
        ready_names
            .into_iter()
            .map(|name| {
                let agent = state.pending.get_mut(&name).expect("ready agent pending");
                agent.claim(action);
                ReadyAgent {
                    name,
                    service: Arc::clone(agent.service()),
                    action,
                }
            })
            .collect()
    }

    /// Record a successful start and unblock dependants
    pub fn service_started(&self, name: &str) {
        let mut state = self.state.lock().expect("running context lock");
        match state.pending.remove(name) {
            Some(mut agent) => agent.mark(AgentStatus::Started),
            None => {
                warn!(service = %name, "started service was not pending");
                return;
            }
        }
        state.processed.push(name.to_string());
        for agent in state.pending.values_mut() {
            agent.process_service_started(name);
        }
        debug!(service = %name, "service recorded as started");
    }

    /// Record a completed stop and unblock dependencies
    pub fn service_stopped(&self, name: &str) {
        let mut state = self.state.lock().expect("running context lock");
        match state.pending.remove(name) {
            Some(mut agent) => agent.mark(AgentStatus::Stopped),
            None => {
                warn!(service = %name, "stopped service was not pending");
                return;
            }
        }
        state.processed.push(name.to_string());
        for agent in state.pending.values_mut() {
            agent.process_service_stopped(name);
        }
        debug!(service = %name, "service recorded as stopped");
    }

    /// Record a failure and cascade it onto every pending dependant.
    ///
    /// The transitive closure is computed as a worklist with the lock held
    /// once; no agent is spawned for a cascaded service.
    pub fn service_failed(&self, name: &str) {
        let mut state = self.state.lock().expect("running context lock");
        let mut queue = vec![name.to_string()];
        while let Some(current) = queue.pop() {
            match state.pending.remove(&current) {
                Some(mut agent) => agent.mark(AgentStatus::Failed),
                None => continue,
            }
            state.failed.push(current.clone());
            debug!(service = %current, "service recorded as failed");
            queue.extend(
                state
                    .pending
                    .values()
                    .filter(|agent| agent.open_dependencies().contains(&current))
                    .map(|agent| agent.name().to_string()),
            );
        }
    }
}
