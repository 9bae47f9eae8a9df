//! Turns a requested module and constraint into an ordered install plan.
//!
//! Resolution is breadth-first over module names. Every name collects the
//! constraints placed on it by the versions currently selected, and its
//! selected version is the newest one satisfying all of them. When a module is
//! re-selected, the constraints its previous version placed are withdrawn and
//! the names they touched are revisited. A name whose constraints cannot be met
//! is only reported once the walk settles and the name is still reachable from
//! the root, since a later re-selection may withdraw the offending constraint.
//!
//! The plan holds prerequisites before dependents, with ties broken by name,
//! so the same registry state always yields the same plan.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use kmod_schema::{ModuleName, Version, VersionReq};
use thiserror::Error;

use crate::registry::{Registry, RegistryEntry, RegistryError};

mod graph;

use graph::ModuleGraph;

/// Upper bound on selections in one resolution.
const MAX_SELECTIONS: usize = 10_000;

/// Who asked for a version range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// `None` for the top-level request.
    pub required_by: Option<(ModuleName, Version)>,
    pub constraint: VersionReq,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.required_by {
            Some((name, version)) => {
                write!(f, "{} (required by {name}@{version})", self.constraint)
            }
            None => write!(f, "{} (requested)", self.constraint),
        }
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    /// `requirements` is a disjoint pair when one exists, otherwise every
    /// requirement on the name.
    #[error("Conflicting requirements on {name}: {}", format_requirements(.requirements))]
    VersionConflict {
        name: ModuleName,
        requirements: Vec<Requirement>,
    },

    #[error("Dependency cycle: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<ModuleName> },

    #[error("No published version of {name} satisfies {requirement}")]
    NoMatchingVersion {
        name: ModuleName,
        requirement: Requirement,
    },

    #[error("Resolution did not settle after {steps} selections (last at {name})")]
    Unsettled { name: ModuleName, steps: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Registry(e) if e.is_retryable())
    }
}

fn format_cycle(cycle: &[ModuleName]) -> String {
    cycle
        .iter()
        .map(ModuleName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_requirements(requirements: &[Requirement]) -> String {
    requirements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" vs ")
}

/// Ordered install steps. The requested module is last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    steps: Vec<RegistryEntry>,
}

impl InstallPlan {
    pub fn steps(&self) -> &[RegistryEntry] {
        &self.steps
    }

    /// The requested module.
    pub fn root(&self) -> &RegistryEntry {
        // Resolution always selects the root before returning a plan.
        &self.steps[self.steps.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.steps.iter()
    }

    /// `(name, version)` pairs in install order.
    pub fn ids(&self) -> Vec<(ModuleName, Version)> {
        self.steps
            .iter()
            .map(|e| (e.name.clone(), e.version.clone()))
            .collect()
    }
}

/// Mutable state of one resolution.
#[derive(Default)]
struct Walk {
    requirements: BTreeMap<ModuleName, Vec<Requirement>>,
    selected: BTreeMap<ModuleName, RegistryEntry>,
    /// Names whose current requirements cannot be met.
    unmet: BTreeMap<ModuleName, ResolveError>,
    queue: VecDeque<ModuleName>,
    queued: HashSet<ModuleName>,
}

impl Walk {
    fn enqueue(&mut self, name: &ModuleName) {
        if self.queued.insert(name.clone()) {
            self.queue.push_back(name.clone());
        }
    }

    fn require(&mut self, name: &ModuleName, requirement: Requirement) {
        self.requirements
            .entry(name.clone())
            .or_default()
            .push(requirement);
        self.enqueue(name);
    }

    /// Drop the selection of `name` and withdraw the requirements it placed.
    fn deselect(&mut self, name: &ModuleName) {
        let Some(previous) = self.selected.remove(name) else {
            return;
        };
        let owner = Some((previous.name.clone(), previous.version.clone()));
        for prereq in &previous.prerequisites {
            if let Some(requirements) = self.requirements.get_mut(&prereq.name) {
                requirements.retain(|r| r.required_by != owner);
            }
            self.enqueue(&prereq.name);
        }
    }

    /// Names reachable from `root` through selected versions, selected or not.
    fn reachable(&self, root: &ModuleName) -> HashSet<ModuleName> {
        let mut seen = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(name) = queue.pop_front() {
            let Some(entry) = self.selected.get(&name) else {
                continue;
            };
            for prereq in &entry.prerequisites {
                if seen.insert(prereq.name.clone()) {
                    queue.push_back(prereq.name.clone());
                }
            }
        }
        seen
    }

    /// Deselect everything no longer reachable from `root`.
    fn collect(&mut self, root: &ModuleName) {
        loop {
            let live = self.reachable(root);
            let dead: Vec<ModuleName> = self
                .selected
                .keys()
                .filter(|name| !live.contains(*name))
                .cloned()
                .collect();
            if dead.is_empty() {
                return;
            }
            for name in &dead {
                tracing::debug!(module = %name, "Dropping unreachable selection");
                self.deselect(name);
            }
        }
    }
}

pub struct Resolver<'a> {
    registry: &'a dyn Registry,
    timeout: Duration,
    candidates: HashMap<(ModuleName, String), Vec<RegistryEntry>>,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a dyn Registry) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(10),
            candidates: HashMap::new(),
        }
    }

    /// Bound on each registry query.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn resolve(
        &mut self,
        name: &ModuleName,
        constraint: &VersionReq,
    ) -> Result<InstallPlan, ResolveError> {
        let mut walk = Walk::default();
        walk.require(
            name,
            Requirement {
                required_by: None,
                constraint: constraint.clone(),
            },
        );

        let mut steps = 0;
        while let Some(current) = walk.queue.pop_front() {
            walk.queued.remove(&current);
            steps += 1;
            if steps > MAX_SELECTIONS {
                return Err(ResolveError::Unsettled {
                    name: current,
                    steps: MAX_SELECTIONS,
                });
            }

            let requirements = walk.requirements.get(&current).cloned().unwrap_or_default();
            if requirements.is_empty() {
                // Nothing selected needs it any more.
                walk.unmet.remove(&current);
                walk.deselect(&current);
                walk.collect(name);
                continue;
            }

            let chosen = match self.select(&current, &requirements).await {
                Ok(chosen) => chosen,
                Err(
                    e @ (ResolveError::NoMatchingVersion { .. }
                    | ResolveError::VersionConflict { .. }),
                ) => {
                    tracing::debug!(module = %current, error = %e, "Requirements unmet");
                    walk.deselect(&current);
                    walk.collect(name);
                    walk.unmet.insert(current, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            walk.unmet.remove(&current);

            if walk
                .selected
                .get(&current)
                .is_some_and(|prev| prev.version == chosen.version)
            {
                continue;
            }
            tracing::debug!(module = %current, version = %chosen.version, "Selected");

            walk.deselect(&current);
            for prereq in &chosen.prerequisites {
                walk.require(
                    &prereq.name,
                    Requirement {
                        required_by: Some((chosen.name.clone(), chosen.version.clone())),
                        constraint: prereq.constraint.clone(),
                    },
                );
            }
            walk.selected.insert(current, chosen);
            walk.collect(name);
        }

        let live = walk.reachable(name);
        if let Some(err) = walk
            .unmet
            .into_iter()
            .find_map(|(unmet, err)| live.contains(&unmet).then_some(err))
        {
            return Err(err);
        }

        plan(name, &walk.selected)
    }

    /// Newest version satisfying every requirement on `name`.
    ///
    /// `requirements` must not be empty.
    async fn select(
        &mut self,
        name: &ModuleName,
        requirements: &[Requirement],
    ) -> Result<RegistryEntry, ResolveError> {
        let mut sets = Vec::with_capacity(requirements.len());
        for requirement in requirements {
            let candidates = self.candidates(name, &requirement.constraint).await?;
            if candidates.is_empty() {
                return Err(ResolveError::NoMatchingVersion {
                    name: name.clone(),
                    requirement: requirement.clone(),
                });
            }
            sets.push(candidates);
        }

        let mut pool: Vec<RegistryEntry> = sets.first().cloned().unwrap_or_default();
        for set in sets.iter().skip(1) {
            pool.retain(|e| set.iter().any(|c| c.version == e.version));
        }

        if let Some(best) = pool.into_iter().max_by(|a, b| a.version.cmp(&b.version)) {
            return Ok(best);
        }

        let requirements = match first_disjoint(&sets) {
            Some((i, j)) => vec![requirements[i].clone(), requirements[j].clone()],
            None => requirements.to_vec(),
        };
        Err(ResolveError::VersionConflict {
            name: name.clone(),
            requirements,
        })
    }

    async fn candidates(
        &mut self,
        name: &ModuleName,
        constraint: &VersionReq,
    ) -> Result<Vec<RegistryEntry>, ResolveError> {
        let key = (name.clone(), constraint.to_string());
        if let Some(hit) = self.candidates.get(&key) {
            return Ok(hit.clone());
        }

        let mut found = tokio::time::timeout(
            self.timeout,
            self.registry.resolve_versions(name, constraint),
        )
        .await
        .map_err(|_| RegistryError::Timeout {
            after: self.timeout,
        })??;
        found.retain(|e| &e.name == name && constraint.matches(&e.version));
        found.sort_by(|a, b| b.version.cmp(&a.version));

        self.candidates.insert(key, found.clone());
        Ok(found)
    }
}

fn first_disjoint(sets: &[Vec<RegistryEntry>]) -> Option<(usize, usize)> {
    for i in 0..sets.len() {
        for j in i + 1..sets.len() {
            let overlap = sets[i]
                .iter()
                .any(|a| sets[j].iter().any(|b| a.version == b.version));
            if !overlap {
                return Some((i, j));
            }
        }
    }
    None
}

/// Order the selections reachable from `root`.
fn plan(
    root: &ModuleName,
    selected: &BTreeMap<ModuleName, RegistryEntry>,
) -> Result<InstallPlan, ResolveError> {
    let mut graph = ModuleGraph::default();
    graph.add_node(root);

    let mut queue = VecDeque::from([root.clone()]);
    let mut seen = HashSet::from([root.clone()]);
    while let Some(name) = queue.pop_front() {
        let Some(entry) = selected.get(&name) else {
            continue;
        };
        for prereq in &entry.prerequisites {
            graph.add_edge(&name, &prereq.name);
            if seen.insert(prereq.name.clone()) {
                queue.push_back(prereq.name.clone());
            }
        }
    }

    let order = graph.topo_order().map_err(|ids| ResolveError::CyclicDependency {
        cycle: ids.into_iter().map(|id| graph.name(id).clone()).collect(),
    })?;

    let steps = order
        .into_iter()
        .filter_map(|id| selected.get(graph.name(id)).cloned())
        .collect();
    Ok(InstallPlan { steps })
}
