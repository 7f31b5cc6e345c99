//! Error types for rule definition, planning and execution.

use thiserror::Error;

/// Boxed error returned by an action callback.
pub type ActionError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

/// All the ways a workflow can fail, from rule definition through execution.
///
/// Definition-time kinds (`DuplicateName`, `InconsistentWildcards`,
/// `MalformedPattern`, `MissingAction`) surface while the loader populates the
/// registry; the rest surface from planning or from the executor.
#[derive(Debug, Error)]
pub enum Error {
    /// No rule produces the requested file (or no rule has the requested name).
    #[error("no rule produces '{0}'")]
    MissingRule(String),

    /// Required inputs neither exist nor can be produced by any rule.
    ///
    /// `sources` carries the upstream failures of candidate producers, so the
    /// top-level diagnostic shows the whole causal chain in one report.
    #[error("{}", render_missing_input(.rule.as_deref(), .files, .sources))]
    MissingInput {
        rule: Option<String>,
        files: Vec<String>,
        sources: Vec<Error>,
    },

    /// An action returned successfully but a declared output is absent.
    #[error("output file '{path}' not produced by rule '{rule}'")]
    MissingOutput { rule: String, path: String },

    /// Two rules can produce the same file with equal standing.
    #[error("ambiguous rules for '{path}': '{first}' and '{second}'")]
    AmbiguousRule {
        path: String,
        first: String,
        second: String,
    },

    /// An output pattern does not declare the same wildcard set as the rule's
    /// other outputs.
    #[error("not all output files of rule '{rule}' contain the same wildcards (offending pattern: '{pattern}')")]
    InconsistentWildcards { rule: String, pattern: String },

    /// A path template could not be compiled.
    #[error("malformed pattern '{template}': {reason}")]
    MalformedPattern { template: String, reason: String },

    /// Formatting referenced a wildcard that the binding does not contain.
    #[error("could not resolve wildcard '{{{name}}}' in '{template}'")]
    UnboundWildcard { name: String, template: String },

    /// The user-supplied action callback failed.
    #[error("action of rule '{rule}' failed: {cause}")]
    ActionFailed {
        rule: String,
        #[source]
        cause: ActionError,
    },

    /// The planner re-entered a `(rule, outputs)` pair already on its stack.
    #[error("cyclic dependency involving rule '{rule}' (outputs: {})", .outputs.join(", "))]
    CyclicGraph { rule: String, outputs: Vec<String> },

    /// A rule with this name is already registered.
    #[error("the name '{0}' is already used by another rule")]
    DuplicateName(String),

    /// A rule declares outputs but carries no action to produce them.
    #[error("rule '{0}' defines outputs but does not have an action")]
    MissingAction(String),
}

fn render_missing_input(rule: Option<&str>, files: &[String], sources: &[Error]) -> String {
    let mut out = match (rule, files.is_empty()) {
        (Some(rule), false) => {
            format!("missing input files for rule '{}': {}", rule, files.join(", "))
        }
        (Some(rule), true) => format!("missing input files for rule '{rule}'"),
        (None, _) => "missing input files".to_string(),
    };
    for source in sources {
        for line in source.to_string().lines() {
            out.push('\n');
            out.push('\t');
            out.push_str(line);
        }
    }
    out
}
