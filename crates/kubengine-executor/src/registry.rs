use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kubengine_core_domain::{Role, RoleFilter, StepSpec};

use crate::actions::{action_keys, builtin_action, ShellAction, StepAction};
use crate::ExecutionError;

#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub roles: Vec<RoleFilter>,
    pub depends_on: Vec<String>,
    pub action: Arc<dyn StepAction>,
    /// Overrides the run-wide step retry count.
    pub retries: Option<u32>,
    /// A failure on the last remaining master halts the whole run.
    pub critical: bool,
    pub timeout: Option<Duration>,
}

impl Step {
    pub fn new(name: &str, roles: &[RoleFilter], depends_on: &[&str], action: Arc<dyn StepAction>) -> Self {
        Self {
            name: name.to_string(),
            roles: roles.to_vec(),
            depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
            action,
            retries: None,
            critical: false,
            timeout: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn applies_to(&self, role: Role) -> bool {
        self.roles.iter().any(|filter| filter.matches(role))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .field("depends_on", &self.depends_on)
            .field("action", &self.action.key())
            .field("retries", &self.retries)
            .field("critical", &self.critical)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Steps in declaration order. Declaration order breaks ties inside a group.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    steps: Vec<Step>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock Kubernetes bootstrap plan.
    pub fn builtin() -> Self {
        use RoleFilter::{Any, Master, Worker};

        let plan: [(&str, RoleFilter, &[&str], bool); 10] = [
            ("disable-firewall", Any, &[], false),
            ("set-hostname", Any, &["disable-firewall"], false),
            ("install-cni", Any, &["set-hostname"], false),
            ("install-containerd", Any, &["install-cni"], false),
            ("install-kubernetes", Any, &["install-containerd"], false),
            ("init-control-plane", Master, &["install-kubernetes"], true),
            ("join-worker", Worker, &["install-kubernetes", "init-control-plane"], false),
            ("install-calico", Master, &["init-control-plane"], true),
            ("install-helm", Master, &["install-kubernetes"], false),
            ("install-lb", Master, &["install-calico", "install-helm", "join-worker"], false),
        ];

        let mut steps = Vec::with_capacity(plan.len());
        for (name, role, depends_on, critical) in plan {
            if let Some(action) = builtin_action(name) {
                let mut step = Step::new(name, &[role], depends_on, action);
                step.critical = critical;
                steps.push(step);
            }
        }
        Self { steps }
    }

    /// Builds a registry from declared steps, resolving action keys against
    /// the static catalog.
    pub fn from_specs(specs: &[StepSpec]) -> Result<Self, ExecutionError> {
        let mut registry = Self::new();
        for spec in specs {
            let action = resolve_action(spec)?;
            let roles = if spec.roles.is_empty() {
                vec![RoleFilter::Any]
            } else {
                spec.roles.clone()
            };
            registry.register(Step {
                name: spec.name.trim().to_string(),
                roles,
                depends_on: spec.depends_on.clone(),
                action,
                retries: spec.retries,
                critical: spec.critical,
                timeout: spec.timeout_secs.map(Duration::from_secs),
            })?;
        }
        Ok(registry)
    }

    /// Declared steps when the cluster file lists any, the built-in plan otherwise.
    pub fn for_cluster(specs: &[StepSpec]) -> Result<Self, ExecutionError> {
        if specs.is_empty() {
            Ok(Self::builtin())
        } else {
            Self::from_specs(specs)
        }
    }

    pub fn register(&mut self, step: Step) -> Result<(), ExecutionError> {
        if step.name.is_empty() {
            return Err(ExecutionError::Config {
                message: "step name must not be empty".to_string(),
            });
        }
        if self.get(&step.name).is_some() {
            return Err(ExecutionError::Config {
                message: format!("duplicate step {}", step.name),
            });
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Topological layering: each group holds the steps whose dependencies
    /// all sit in earlier groups.
    pub fn resolve(&self) -> Result<Vec<Vec<&Step>>, ExecutionError> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(position, step)| (step.name.as_str(), position))
            .collect();

        let mut indegree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (position, step) in self.steps.iter().enumerate() {
            let unique: BTreeSet<&str> = step.depends_on.iter().map(String::as_str).collect();
            for dependency in unique {
                let dep = *index.get(dependency).ok_or_else(|| ExecutionError::Config {
                    message: format!(
                        "step {} depends on unknown step {}",
                        step.name, dependency
                    ),
                })?;
                indegree[position] += 1;
                dependents[dep].push(position);
            }
        }

        let mut ready: Vec<usize> = (0..self.steps.len())
            .filter(|position| indegree[*position] == 0)
            .collect();
        let mut groups = Vec::new();
        let mut placed = 0;
        while !ready.is_empty() {
            ready.sort_unstable();
            let mut next = Vec::new();
            for &position in &ready {
                for &dependent in &dependents[position] {
                    indegree[dependent] -= 1;
                    if indegree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            placed += ready.len();
            groups.push(ready.iter().map(|position| &self.steps[*position]).collect());
            ready = next;
        }

        if placed != self.steps.len() {
            let stuck: Vec<&str> = self
                .steps
                .iter()
                .zip(&indegree)
                .filter(|(_, degree)| **degree > 0)
                .map(|(step, _)| step.name.as_str())
                .collect();
            return Err(ExecutionError::Config {
                message: format!("cyclic step dependency among {}", stuck.join(", ")),
            });
        }

        Ok(groups)
    }
}

fn resolve_action(spec: &StepSpec) -> Result<Arc<dyn StepAction>, ExecutionError> {
    let key = spec.action.trim();
    if key == "shell" {
        if spec.commands.is_empty() {
            return Err(ExecutionError::Config {
                message: format!("step {} uses the shell action but lists no commands", spec.name),
            });
        }
        return Ok(Arc::new(ShellAction::new(spec.commands.clone())));
    }
    if !spec.commands.is_empty() {
        return Err(ExecutionError::Config {
            message: format!(
                "step {}: commands are only accepted by the shell action",
                spec.name
            ),
        });
    }
    builtin_action(key).ok_or_else(|| ExecutionError::Config {
        message: format!(
            "step {} uses unknown action {:?} (known: {})",
            spec.name,
            key,
            action_keys().join(", ")
        ),
    })
}
