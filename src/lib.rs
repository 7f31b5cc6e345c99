#[macro_use]
mod macros;
mod engine;
mod error;
mod pattern;
mod rule;
mod workflow;

pub use error::{ActionError, Error, Result};
pub use pattern::PathPattern;
pub use rule::{PathSpec, Rule};
pub use workflow::{Options, RunFlags, Workflow};

use std::collections::BTreeMap;

// --- Shared types -----------------------------------------------------------

/// Mapping from wildcard names to the concrete strings captured from a
/// requested output path.
///
/// A `BTreeMap` keeps iteration deterministic, which in turn keeps messages
/// and planning order stable across runs.
pub type Binding = BTreeMap<String, String>;

/// Action callback stored on a [`Rule`].
///
/// Invoked with the concrete `(inputs, outputs, wildcards)` of a planned job.
/// The callback is supplied by the rule loader; the engine never inspects it
/// beyond calling it and checking the result.
pub type Action =
    Box<dyn Fn(&[String], &[String], &Binding) -> std::result::Result<(), ActionError> + Send + Sync>;
