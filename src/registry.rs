//! Service registry: validated definitions with resolved graph edges.
//!
//! The registry owns one entry per registered service, indexed by name.
//! Graph edges are kept as name sets rather than references, so the
//! dependency/dependant relation stays acyclic-friendly and cheap to copy
//! into per-run agent state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::errors::{Error, Result};
use crate::service::Service;

/// A service admitted to the registry, with its reverse edges resolved
#[derive(Clone)]
pub struct RegisteredService {
    /// The service definition and hooks
    pub service: Arc<dyn Service>,
    /// Names of services depending on this one
    pub dependants: Vec<String>,
}

impl std::fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredService")
            .field("service", &self.service.spec().name)
            .field("dependants", &self.dependants)
            .finish()
    }
}

impl RegisteredService {
    /// The service name
    pub fn name(&self) -> &str {
        &self.service.spec().name
    }

    /// Names of services this one depends on
    pub fn dependencies(&self) -> &[String] {
        &self.service.spec().dependencies
    }
}

/// Name-indexed collection of validated, connected service definitions.
#[derive(Debug)]
pub struct ServiceRegistry {
    services: HashMap<String, RegisteredService>,
    excluded: Vec<String>,
}

impl ServiceRegistry {
    /// Build a registry from service definitions.
    ///
    /// Validates every definition, rejects duplicate names and unknown
    /// dependency names, computes reverse edges, and rejects cycles.
    pub fn from_definitions(definitions: &[Arc<dyn Service>]) -> Result<Self> {
        if definitions.is_empty() {
            return Err(Error::service_load("no services defined"));
        }
        for definition in definitions {
            definition.spec().validate()?;
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut repeated: Vec<&str> = Vec::new();
        for definition in definitions {
            let name = definition.spec().name.as_str();
            if !seen.insert(name) && !repeated.contains(&name) {
                repeated.push(name);
            }
        }
        if !repeated.is_empty() {
            return Err(Error::service_load(format!(
                "repeated service names: {}",
                repeated.join(",")
            )));
        }

        for definition in definitions {
            let spec = definition.spec();
            for dependency in &spec.dependencies {
                if !seen.contains(dependency.as_str()) {
                    return Err(Error::service_load(format!(
                        "dependency {dependency} of service {} not among services",
                        spec.name
                    )));
                }
            }
        }

        let mut services: HashMap<String, RegisteredService> = definitions
            .iter()
            .map(|definition| {
                (
                    definition.spec().name.clone(),
                    RegisteredService {
                        service: Arc::clone(definition),
                        dependants: Vec::new(),
                    },
                )
            })
            .collect();
        for definition in definitions {
            let spec = definition.spec();
            for dependency in &spec.dependencies {
                services
                    .get_mut(dependency)
                    .expect("dependency resolved above")
                    .dependants
                    .push(spec.name.clone());
            }
        }

        let registry = Self {
            services,
            excluded: Vec::new(),
        };
        registry.check_circular_dependencies()?;
        Ok(registry)
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Whether a service with `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Look up a registered service
    pub fn get(&self, name: &str) -> Option<&RegisteredService> {
        self.services.get(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Iterate over registered services
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredService> {
        self.services.values()
    }

    /// Names excluded from this registry, if any
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    /// Cycle detection: bounded DFS from every node with outgoing edges.
    ///
    /// A path returning to its start node, or a walk visiting more nodes
    /// than the registry holds, is a cycle.
    fn check_circular_dependencies(&self) -> Result<()> {
        let budget = self.services.len();
        for (start, registered) in &self.services {
            if registered.dependencies().is_empty() {
                continue;
            }
            let mut visited: HashSet<&str> = HashSet::new();
            let mut stack: Vec<&str> =
                registered.dependencies().iter().map(String::as_str).collect();
            let mut traversed = 0usize;
            while let Some(name) = stack.pop() {
                if name == start {
                    return Err(Error::service_load(format!(
                        "circular dependency detected involving service {start}"
                    )));
                }
                if !visited.insert(name) {
                    continue;
                }
                traversed += 1;
                if traversed > budget {
                    return Err(Error::service_load(format!(
                        "circular dependency detected involving service {start}"
                    )));
                }
                if let Some(dependency) = self.services.get(name) {
                    stack.extend(dependency.dependencies().iter().map(String::as_str));
                }
            }
        }
        Ok(())
    }

    fn check_excluded_known(&self, exclude: &[String]) -> Result<()> {
        let missing: Vec<&str> = exclude
            .iter()
            .filter(|name| !self.services.contains_key(*name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::service_load(format!(
                "service{} to be excluded, but not defined: {}",
                if missing.len() > 1 { "s" } else { "" },
                missing.join(",")
            )));
        }
        Ok(())
    }

    /// Remove `exclude` from the registry ahead of a start run.
    ///
    /// A remaining service may not depend on an excluded one; the check is
    /// skipped for services that are themselves excluded.
    pub fn exclude_for_start(&mut self, exclude: &[String]) -> Result<()> {
        self.check_excluded_known(exclude)?;
        for registered in self.services.values() {
            let name = registered.name();
            if exclude.iter().any(|excluded| excluded.as_str() == name) {
                continue;
            }
            if let Some(dependency) = registered
                .dependencies()
                .iter()
                .find(|&dependency| exclude.contains(dependency))
            {
                return Err(Error::service_load(format!(
                    "{dependency} is to be excluded, but {name} depends on it"
                )));
            }
        }
        self.remove_excluded(exclude);
        Ok(())
    }

    /// Remove `exclude` from the registry ahead of a stop run.
    ///
    /// A dependency cannot be stopped while its dependant is kept alive, so
    /// every excluded service must have its dependencies excluded too.
    pub fn exclude_for_stop(&mut self, exclude: &[String]) -> Result<()> {
        self.check_excluded_known(exclude)?;
        for name in exclude {
            let registered = &self.services[name];
            if let Some(dependency) = registered
                .dependencies()
                .iter()
                .find(|&dependency| !exclude.contains(dependency))
            {
                return Err(Error::service_load(format!(
                    "{dependency} is to be stopped, but {name} depends on it"
                )));
            }
        }
        self.remove_excluded(exclude);
        Ok(())
    }

    fn remove_excluded(&mut self, exclude: &[String]) {
        for name in exclude {
            self.services.remove(name);
            debug!(service = %name, "excluded from registry");
        }
        self.excluded.extend(exclude.iter().cloned());
    }

    /// Verify `name` exists and declares a build directory
    pub fn check_can_be_built(&self, name: &str) -> Result<()> {
        let registered = self
            .services
            .get(name)
            .ok_or_else(|| Error::definition(format!("no such service: {name}")))?;
        if registered.service.spec().build_from.is_none() {
            return Err(Error::definition(format!(
                "service {name} cannot be built: no build directory specified"
            )));
        }
        Ok(())
    }

    /// Reduce the registry to `name` and every service that transitively
    /// depends on it (breadth-first over reverse edges).
    pub fn restrict_to_dependants_of(&mut self, name: &str) -> Result<()> {
        if !self.services.contains_key(name) {
            return Err(Error::service_load(format!("no such service: {name}")));
        }
        let mut required: Vec<String> = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(name.to_string());
        while let Some(current) = queue.pop_front() {
            if required.contains(&current) {
                continue;
            }
            for dependant in &self.services[&current].dependants {
                if !required.contains(dependant) && !queue.contains(dependant) {
                    queue.push_back(dependant.clone());
                }
            }
            required.push(current);
        }
        self.services.retain(|key, _| required.contains(key));
        Ok(())
    }
}
