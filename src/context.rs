use crate::error::InterpolationError;
use crate::interpolate::{self, Variables};
use crate::profile::{Step, INPUT_VAR};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-run store of the input text and every output passed on so far.
///
/// Entries are append-only: once a step's output is recorded it is never
/// replaced.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    input: String,
    outputs: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn get(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    /// Record a step's output. Returns `false` if `step_id` was already
    /// recorded, in which case the existing value is kept.
    pub fn record(&mut self, step_id: impl Into<String>, output: Value) -> bool {
        use std::collections::btree_map::Entry;
        match self.outputs.entry(step_id.into()) {
            Entry::Vacant(slot) => {
                slot.insert(output);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Variables visible to `step`: `input` plus recorded outputs of its
    /// direct dependencies.
    pub fn variables_for(&self, step: &Step) -> Variables {
        let mut vars = Variables::new();
        vars.insert(INPUT_VAR.to_string(), Value::String(self.input.clone()));
        for dep in &step.depends_on {
            if let Some(value) = self.outputs.get(dep) {
                vars.insert(dep.clone(), value.clone());
            }
        }
        vars
    }

    /// Names `step`'s template references that are not yet available.
    pub fn missing_for(&self, step: &Step) -> Result<Vec<String>, InterpolationError> {
        let vars = self.variables_for(step);
        Ok(interpolate::extract_variables(&step.prompt_template)?
            .into_iter()
            .filter(|name| !vars.contains_key(name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_is_append_only() {
        let mut ctx = ExecutionContext::new("text");
        assert!(ctx.record("a", json!(1)));
        assert!(!ctx.record("a", json!(2)));
        assert_eq!(ctx.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_variables_only_from_dependencies() {
        let mut ctx = ExecutionContext::new("Alice met Bob.");
        ctx.record("extract", json!({"people": ["Alice", "Bob"]}));
        ctx.record("unrelated", json!("x"));

        let step = Step::new("summarize", "{extract} {input}").depends_on(["extract"]);
        let vars = ctx.variables_for(&step);
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["input"], json!("Alice met Bob."));
        assert!(!vars.contains_key("unrelated"));
        assert!(ctx.missing_for(&step).unwrap().is_empty());
    }

    #[test]
    fn test_missing_for_reports_unrecorded_dependency() {
        let ctx = ExecutionContext::new("x");
        let step = Step::new("b", "{a} and {input}").depends_on(["a"]);
        assert_eq!(ctx.missing_for(&step).unwrap(), vec!["a".to_string()]);
    }
}
