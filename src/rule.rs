use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::pattern::{self, PathPattern};
use crate::{Action, ActionError, Binding};

/// A path, or an arbitrarily nested sequence of paths.
///
/// Rule loaders hand over inputs and outputs in whatever nesting their
/// surface syntax produced; [`Rule::add_input`] and [`Rule::add_output`]
/// flatten the tree recursively.
#[derive(Debug, Clone)]
pub enum PathSpec {
    One(String),
    Many(Vec<PathSpec>),
}

impl PathSpec {
    fn flatten_into(self, out: &mut Vec<String>) {
        match self {
            PathSpec::One(path) => out.push(path),
            PathSpec::Many(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
        }
    }

    pub(crate) fn flatten(self) -> Vec<String> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }
}

impl From<&str> for PathSpec {
    fn from(path: &str) -> Self {
        PathSpec::One(path.to_string())
    }
}

impl From<String> for PathSpec {
    fn from(path: String) -> Self {
        PathSpec::One(path)
    }
}

impl<T: Into<PathSpec>> From<Vec<T>> for PathSpec {
    fn from(items: Vec<T>) -> Self {
        PathSpec::Many(items.into_iter().map(Into::into).collect())
    }
}

/// A declarative recipe binding input path patterns and output path patterns
/// through an action.
///
/// All outputs of one rule must declare the same wildcard name set; that set
/// is what a requested output path binds against. Every name referenced by an
/// input pattern must appear in it, otherwise input expansion fails at
/// planning time.
pub struct Rule {
    name: String,
    inputs: Vec<PathPattern>,
    outputs: Vec<PathPattern>,
    wildcard_names: BTreeSet<String>,
    message: Option<String>,
    action: Option<Action>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("inputs", &self.inputs.iter().map(PathPattern::template).collect::<Vec<_>>())
            .field("outputs", &self.outputs.iter().map(PathPattern::template).collect::<Vec<_>>())
            .field("action", &self.action.as_ref().map(|_| "<function>"))
            .finish()
    }
}

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        Rule {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            wildcard_names: BTreeSet::new(),
            message: None,
            action: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append input path patterns. Nested sequences are flattened recursively.
    pub fn add_input(&mut self, paths: impl Into<PathSpec>) -> Result<()> {
        for template in paths.into().flatten() {
            self.inputs.push(PathPattern::compile(&template)?);
        }
        Ok(())
    }

    /// Append output path patterns. Nested sequences are flattened
    /// recursively.
    ///
    /// The first output establishes the rule's wildcard name set; every
    /// further output must declare exactly the same set, otherwise this fails
    /// with [`Error::InconsistentWildcards`].
    pub fn add_output(&mut self, paths: impl Into<PathSpec>) -> Result<()> {
        for template in paths.into().flatten() {
            let compiled = PathPattern::compile(&template)?;
            if self.outputs.is_empty() {
                self.wildcard_names = compiled.names().clone();
            } else if *compiled.names() != self.wildcard_names {
                return Err(Error::InconsistentWildcards {
                    rule: self.name.clone(),
                    pattern: template,
                });
            }
            self.outputs.push(compiled);
        }
        Ok(())
    }

    /// Set the message displayed when the rule executes. The template may
    /// reference wildcard names plus the pre-formatted `{input}` and
    /// `{output}` lists.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    /// Attach the action callback that turns this rule's inputs into its
    /// outputs.
    pub fn set_action<F>(&mut self, action: F)
    where
        F: Fn(&[String], &[String], &Binding) -> std::result::Result<(), ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.action = Some(Box::new(action));
    }

    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }

    pub(crate) fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    /// The wildcard name set established by the outputs.
    pub fn wildcard_names(&self) -> &BTreeSet<String> {
        &self.wildcard_names
    }

    pub fn has_wildcards(&self) -> bool {
        !self.wildcard_names.is_empty()
    }

    pub fn inputs(&self) -> impl Iterator<Item = &PathPattern> {
        self.inputs.iter()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &PathPattern> {
        self.outputs.iter()
    }

    /// True iff any output pattern matches `path` in full.
    pub fn is_producer(&self, path: &str) -> bool {
        self.outputs.iter().any(|output| output.matches(path).is_some())
    }

    /// Bind a concrete requested output against the output patterns.
    ///
    /// Among all output patterns that match, the one whose captured values
    /// have the shortest total length wins; ties go to the first in
    /// declaration order. Narrower captures beat a pattern that swallows
    /// directory components into a wildcard.
    pub fn bind(&self, requested_output: &str) -> Option<Binding> {
        let mut best: Option<(usize, Binding)> = None;
        for output in &self.outputs {
            if let Some(binding) = output.matches(requested_output) {
                let len: usize = binding.values().map(String::len).sum();
                if best.as_ref().is_none_or(|(best_len, _)| len < *best_len) {
                    best = Some((len, binding));
                }
            }
        }
        best.map(|(_, binding)| binding)
    }

    /// Format every input and output pattern against `binding`.
    pub fn expand(&self, binding: &Binding) -> Result<(Vec<String>, Vec<String>)> {
        let inputs =
            self.inputs.iter().map(|pattern| pattern.format(binding)).collect::<Result<Vec<_>>>()?;
        let outputs =
            self.outputs.iter().map(|pattern| pattern.format(binding)).collect::<Result<Vec<_>>>()?;
        Ok((inputs, outputs))
    }

    /// Decide whether the rule needs to run for the given concrete files.
    ///
    /// True if forced, if any output is missing, if the rule declares no
    /// outputs (an always-run action), or if no output is strictly newer than
    /// every existing input. Mtime equality counts as stale: a file produced
    /// within the same filesystem timestamp granularity as its consumer's
    /// output must re-trigger. A rule without an action is never stale.
    pub fn is_stale(&self, inputs: &[String], outputs: &[String], force: bool) -> bool {
        if self.action.is_none() {
            return false;
        }
        if force {
            return true;
        }
        if outputs.is_empty() {
            return true;
        }
        let mut oldest_output: Option<SystemTime> = None;
        for output in outputs {
            match mtime(output) {
                Some(time) => {
                    oldest_output =
                        Some(oldest_output.map_or(time, |current| current.min(time)));
                }
                None => return true,
            }
        }
        let Some(oldest) = oldest_output else { return true };
        inputs.iter().filter_map(|input| mtime(input)).any(|time| time >= oldest)
    }

    /// The rule's message with wildcards and the `{input}`/`{output}` lists
    /// substituted, or the default description when no message is set.
    pub fn format_message(&self, inputs: &[String], outputs: &[String], binding: &Binding) -> String {
        match &self.message {
            Some(template) => {
                let mut vars = binding.clone();
                vars.entry("input".to_string()).or_insert_with(|| inputs.join(", "));
                vars.entry("output".to_string()).or_insert_with(|| outputs.join(", "));
                pattern::substitute_lenient(template, &vars)
            }
            None => format!(
                "rule {}:\n\tinput: {}\n\toutput: {}",
                self.name,
                inputs.join(", "),
                outputs.join(", ")
            ),
        }
    }

    /// A rule that declares outputs must carry an action to produce them.
    pub(crate) fn check(&self) -> Result<()> {
        if !self.outputs.is_empty() && self.action.is_none() {
            return Err(Error::MissingAction(self.name.clone()));
        }
        Ok(())
    }
}

fn mtime(path: &str) -> Option<SystemTime> {
    fs::metadata(Path::new(path)).ok()?.modified().ok()
}
