//! Profile and step definitions plus their structural validation.
//!
//! A [`Profile`] is a small DAG of [`Step`]s. Before a run the engine checks:
//!
//! - ids are unique, legal placeholder names and not reserved
//! - every dependency names an existing step and the graph is acyclic
//! - every `{name}` a template references is either `input` or the id of a
//!   direct dependency that passes its output on
//!
//! [`validate`] gathers every problem at once for editors and CLIs.

use crate::config::ModelConfig;
use crate::error::{DefinitionError, PipelineError, Result};
use crate::interpolate::{self, is_valid_name};
use crate::output::OutputContract;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Variable always available to every step.
pub const INPUT_VAR: &str = "input";

/// Key of the metadata block in aggregated output.
pub const METADATA_KEY: &str = "_metadata";

/// Largest retry bound a step may declare.
pub const MAX_RETRIES: u32 = 10;

const RESERVED_IDS: [&str; 2] = [INPUT_VAR, METADATA_KEY];

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// One LLM call within a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(alias = "step_id")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(alias = "prompt")]
    pub prompt_template: String,

    #[serde(default, alias = "llm_config")]
    pub config: ModelConfig,

    #[serde(default, alias = "output_schema")]
    pub output: OutputContract,

    /// A failing required step aborts the run.
    #[serde(default = "default_true")]
    pub required: bool,

    /// Whether dependants may reference this step's output.
    #[serde(default = "default_true")]
    pub pass_to_next: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_true")]
    pub retry_on_failure: bool,

    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            prompt_template: prompt_template.into(),
            config: ModelConfig::default(),
            output: OutputContract::default(),
            required: true,
            pass_to_next: true,
            max_retries: default_max_retries(),
            retry_on_failure: true,
            depends_on: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_output(mut self, output: OutputContract) -> Self {
        self.output = output;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Mark the step optional: its failure does not abort the run.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Keep the step's output out of the variables seen by later steps.
    pub fn private(mut self) -> Self {
        self.pass_to_next = false;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry_on_failure = false;
        self
    }

    /// Retries actually granted to this step.
    pub fn retry_budget(&self) -> u32 {
        if self.retry_on_failure {
            self.max_retries
        } else {
            0
        }
    }
}

/// Restricts which step outputs appear in the aggregated result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalOutput {
    /// Step ids to include; empty means every successful step.
    pub include: Vec<String>,
}

impl FinalOutput {
    pub fn includes(&self, step_id: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|s| s == step_id)
    }
}

/// A declarative multi-step pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(alias = "profile_id")]
    pub id: String,

    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub steps: Vec<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<FinalOutput>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Profile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            steps: Vec::new(),
            final_output: None,
            tags: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_final_output(mut self, final_output: FinalOutput) -> Self {
        self.final_output = Some(final_output);
        self
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Load a profile from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a profile from YAML.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Whether `step_id` belongs in the aggregated output.
    pub fn includes_in_output(&self, step_id: &str) -> bool {
        self.final_output
            .as_ref()
            .map_or(true, |f| f.includes(step_id))
    }
}

/// Check ids, dependency references and acyclicity.
pub fn validate_graph(profile: &Profile) -> std::result::Result<(), Vec<DefinitionError>> {
    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();

    for step in &profile.steps {
        if !seen.insert(step.id.as_str()) {
            errors.push(DefinitionError::DuplicateStep {
                step_id: step.id.clone(),
            });
        }
    }
    for step in &profile.steps {
        for dep in &step.depends_on {
            if !seen.contains(dep.as_str()) {
                errors.push(DefinitionError::MissingDependency {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    errors.extend(find_cycles(profile));

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Depth-first search over step -> dependency edges with an explicit stack.
///
/// Every back edge produces one [`DefinitionError::Cycle`] whose path starts
/// and ends with the same step.
fn find_cycles(profile: &Profile) -> Vec<DefinitionError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let index: HashMap<&str, usize> = profile
        .steps
        .iter()
        .enumerate()
        .rev()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let edges: Vec<Vec<usize>> = profile
        .steps
        .iter()
        .map(|s| {
            s.depends_on
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();

    let mut marks = vec![Mark::Unvisited; profile.steps.len()];
    let mut cycles = Vec::new();

    for root in 0..profile.steps.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // (node, next edge to explore)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;

        while let Some(frame) = stack.last_mut() {
            let (node, edge) = *frame;
            frame.1 += 1;
            if let Some(&dep) = edges[node].get(edge) {
                match marks[dep] {
                    Mark::Unvisited => {
                        marks[dep] = Mark::OnStack;
                        stack.push((dep, 0));
                    }
                    Mark::OnStack => {
                        let from = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                        let mut path: Vec<String> = stack[from..]
                            .iter()
                            .map(|&(n, _)| profile.steps[n].id.clone())
                            .collect();
                        path.push(profile.steps[dep].id.clone());
                        cycles.push(DefinitionError::Cycle { path });
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }
    cycles
}

/// Topological order of step ids (Kahn's algorithm).
///
/// Ties are broken by declaration order, so the result is deterministic.
pub fn compute_order(profile: &Profile) -> Result<Vec<String>> {
    validate_graph(profile).map_err(PipelineError::ProfileDefinition)?;

    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependants: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &profile.steps {
        let deps: BTreeSet<&str> = step.depends_on.iter().map(String::as_str).collect();
        in_degree.insert(step.id.as_str(), deps.len());
        for dep in deps {
            dependants.entry(dep).or_default().push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = profile
        .steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(profile.steps.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for &child in dependants.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if order.len() < profile.steps.len() {
        let stuck: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(PipelineError::ProfileDefinition(vec![
            DefinitionError::Cycle { path: stuck },
        ]));
    }
    Ok(order)
}

/// Variables `step` may reference: `input` plus direct dependencies that
/// pass their output on.
pub fn available_variables<'a>(profile: &'a Profile, step: &'a Step) -> BTreeSet<&'a str> {
    let mut available = BTreeSet::from([INPUT_VAR]);
    for dep in &step.depends_on {
        if profile.get_step(dep).is_some_and(|d| d.pass_to_next) {
            available.insert(dep.as_str());
        }
    }
    available
}

/// Walk steps in execution order and report, per step, every referenced
/// variable that would not be available when the step runs.
///
/// Templates with syntax errors are skipped here; [`validate`] reports them.
/// An empty map means the profile's variables are closed.
pub fn validate_variable_closure(profile: &Profile) -> Result<BTreeMap<String, Vec<String>>> {
    let order = compute_order(profile)?;
    Ok(unresolved_in_order(profile, &order))
}

/// Closure check against an already computed `order`.
pub(crate) fn unresolved_in_order(
    profile: &Profile,
    order: &[String],
) -> BTreeMap<String, Vec<String>> {
    let mut unresolved = BTreeMap::new();

    for id in order {
        let Some(step) = profile.get_step(id) else {
            continue;
        };
        let Ok(referenced) = interpolate::extract_variables(&step.prompt_template) else {
            continue;
        };
        let available = available_variables(profile, step);
        let missing: Vec<String> = referenced
            .into_iter()
            .filter(|v| !available.contains(v.as_str()))
            .collect();
        if !missing.is_empty() {
            unresolved.insert(id.clone(), missing);
        }
    }
    unresolved
}

/// Every definition problem in `profile`. Empty means it is safe to run.
pub fn validate(profile: &Profile) -> Vec<DefinitionError> {
    let mut errors = Vec::new();

    if profile.steps.is_empty() {
        errors.push(DefinitionError::EmptyProfile);
    }

    for step in &profile.steps {
        if RESERVED_IDS.contains(&step.id.as_str()) {
            errors.push(DefinitionError::ReservedStepId {
                step_id: step.id.clone(),
            });
        } else if !is_valid_name(&step.id) {
            errors.push(DefinitionError::InvalidStepId {
                step_id: step.id.clone(),
            });
        }
        if let Err(e) = interpolate::validate_template(&step.prompt_template) {
            errors.push(DefinitionError::InvalidTemplate {
                step_id: step.id.clone(),
                message: e.to_string(),
            });
        }
        if step.max_retries > MAX_RETRIES {
            errors.push(DefinitionError::RetryBoundTooLarge {
                step_id: step.id.clone(),
                max_retries: step.max_retries,
                limit: MAX_RETRIES,
            });
        }
        if let Err(e) = step.config.validate() {
            errors.push(DefinitionError::InvalidConfig {
                step_id: step.id.clone(),
                message: e.to_string(),
            });
        }
    }

    if let Some(ref final_output) = profile.final_output {
        for id in &final_output.include {
            if profile.get_step(id).is_none() {
                errors.push(DefinitionError::UnknownOutputStep {
                    step_id: id.clone(),
                });
            }
        }
    }

    match validate_graph(profile) {
        Ok(()) => {
            if let Ok(unresolved) = validate_variable_closure(profile) {
                errors.extend(unresolved.into_iter().map(|(step_id, variables)| {
                    DefinitionError::UnresolvedVariables { step_id, variables }
                }));
            }
        }
        Err(graph_errors) => errors.extend(graph_errors),
    }

    errors
}
