//! Dependency expansion into a memoised job DAG.
//!
//! `Planner::plan` walks the rule set recursively: for every input of the
//! requested target it searches all other rules for a producer, plans that
//! producer first, and records the resulting job as a dependency when it has
//! work to do. Memoisation keyed by `(rule, concrete outputs)` makes diamond
//! dependencies share a single job instead of exploding exponentially; a
//! visiting set over the same key turns rule cycles into [`Error::CyclicGraph`]
//! instead of unbounded recursion.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::debug;

use crate::Binding;
use crate::error::{Error, Result};
use crate::rule::Rule;

/// Job identifier (index into the plan's job vector).
pub(crate) type JobId = usize;

/// A planned invocation of a rule with a fixed wildcard binding.
#[derive(Debug)]
pub(crate) struct Job {
    /// Index of the owning rule in the registry.
    pub rule: usize,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub binding: Binding,
    /// Jobs that must finish successfully before this one may start. Only
    /// jobs with `needs_run` set are recorded; an up-to-date producer is no
    /// constraint.
    pub depends: Vec<JobId>,
    pub message: String,
    pub needs_run: bool,
}

/// The DAG of jobs rooted at the requested target.
#[derive(Debug)]
pub(crate) struct Plan {
    pub jobs: Vec<Job>,
    pub root: JobId,
}

pub(crate) struct Planner<'a> {
    rules: &'a [Rule],
    jobs: Vec<Job>,
    memo: HashMap<(usize, Vec<String>), JobId>,
    visiting: HashSet<(usize, Vec<String>)>,
    force_all: bool,
}

impl<'a> Planner<'a> {
    pub fn new(rules: &'a [Rule], force_all: bool) -> Self {
        Planner {
            rules,
            jobs: Vec::new(),
            memo: HashMap::new(),
            visiting: HashSet::new(),
            force_all,
        }
    }

    /// Plan the job producing `requested_output` via `rule_id`, recursively
    /// planning producers for each of its inputs.
    ///
    /// With `requested_output` absent the rule's patterns are used verbatim
    /// (an empty binding); callers reject that case up front for rules with
    /// wildcards.
    pub fn plan(
        &mut self,
        rule_id: usize,
        requested_output: Option<&str>,
        force_this: bool,
    ) -> Result<JobId> {
        let rule = &self.rules[rule_id];
        let binding = match requested_output {
            Some(path) => {
                rule.bind(path).ok_or_else(|| Error::MissingRule(path.to_string()))?
            }
            None => Binding::new(),
        };
        let (inputs, outputs) = rule.expand(&binding)?;

        let key = (rule_id, outputs.clone());
        if let Some(&job) = self.memo.get(&key) {
            return Ok(job);
        }
        if self.visiting.contains(&key) {
            return Err(Error::CyclicGraph { rule: rule.name().to_string(), outputs });
        }

        self.visiting.insert(key.clone());
        let planned = self.plan_dependencies(rule_id, inputs, outputs, binding, force_this);
        self.visiting.remove(&key);
        planned
    }

    fn plan_dependencies(
        &mut self,
        rule_id: usize,
        inputs: Vec<String>,
        outputs: Vec<String>,
        binding: Binding,
        force_this: bool,
    ) -> Result<JobId> {
        let mut missing_sources = Vec::new();
        let mut failed_files: HashSet<String> = HashSet::new();
        let mut produced: HashMap<String, usize> = HashMap::new();
        let mut depends: Vec<JobId> = Vec::new();

        for input in &inputs {
            for other_id in 0..self.rules.len() {
                if other_id == rule_id || !self.rules[other_id].is_producer(input) {
                    continue;
                }
                match self.plan(other_id, Some(input), false) {
                    Ok(child) => {
                        if let Some(&first) = produced.get(input) {
                            return Err(Error::AmbiguousRule {
                                path: input.clone(),
                                first: self.rules[first].name().to_string(),
                                second: self.rules[other_id].name().to_string(),
                            });
                        }
                        produced.insert(input.clone(), other_id);
                        if self.jobs[child].needs_run && !depends.contains(&child) {
                            depends.push(child);
                        }
                    }
                    Err(err @ Error::MissingInput { .. }) => {
                        // Not a viable producer; remember why in case nobody
                        // else can provide this input either.
                        failed_files.insert(input.clone());
                        missing_sources.push(err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let missing: Vec<String> = inputs
            .iter()
            .filter(|input| !produced.contains_key(*input))
            .filter(|input| !Path::new(input.as_str()).exists())
            .cloned()
            .collect();
        if !missing.is_empty() {
            let rule = &self.rules[rule_id];
            return Err(Error::MissingInput {
                rule: Some(rule.name().to_string()),
                files: missing.into_iter().filter(|file| !failed_files.contains(file)).collect(),
                sources: missing_sources,
            });
        }

        let rule = &self.rules[rule_id];
        let needs_run = force_this
            || self.force_all
            || !depends.is_empty()
            || rule.is_stale(&inputs, &outputs, false);
        debug!(
            "planned rule '{}' (outputs: {:?}, needs_run: {}, depends: {})",
            rule.name(),
            outputs,
            needs_run,
            depends.len()
        );

        let message = rule.format_message(&inputs, &outputs, &binding);
        let id = self.jobs.len();
        self.jobs.push(Job {
            rule: rule_id,
            inputs,
            outputs: outputs.clone(),
            binding,
            depends,
            message,
            needs_run,
        });
        self.memo.insert((rule_id, outputs), id);
        Ok(id)
    }

    pub fn into_plan(self, root: JobId) -> Plan {
        Plan { jobs: self.jobs, root }
    }
}
