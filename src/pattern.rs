//! Wildcard path templates.
//!
//! A template is a literal path containing zero or more `{name}` placeholders,
//! for example `reads/{sample}.fastq`. Compilation turns the template into an
//! anchored regular expression (one named capture group per wildcard) and a
//! formatter. A wildcard matches any non-empty run of characters, including
//! path separators, and matching is greedy; literal text, `.` included, is
//! matched literally.

use std::collections::BTreeSet;

use regex::Regex;

use crate::Binding;
use crate::error::{Error, Result};

/// A compiled path template.
///
/// ```
/// use foreman::PathPattern;
///
/// let pattern = PathPattern::compile("data/{sample}.raw").unwrap();
/// let binding = pattern.matches("data/s1.raw").unwrap();
/// assert_eq!(binding["sample"], "s1");
/// assert_eq!(pattern.format(&binding).unwrap(), "data/s1.raw");
/// ```
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    regex: Regex,
    names: BTreeSet<String>,
}

impl PathPattern {
    /// Compile `template` into a matcher and formatter.
    ///
    /// Fails with [`Error::MalformedPattern`] if a placeholder name is empty,
    /// not an identifier, or repeated within the template. Unpaired braces are
    /// treated as literal text.
    pub fn compile(template: &str) -> Result<Self> {
        let placeholder = regex!(r"\{([^{}]*)\}");

        let mut names = BTreeSet::new();
        let mut pattern = String::from("^");
        let mut last = 0;
        for caps in placeholder.captures_iter(template) {
            let whole = caps.get(0).unwrap();
            let name = caps.get(1).unwrap().as_str();
            if !is_identifier(name) {
                return Err(Error::MalformedPattern {
                    template: template.to_string(),
                    reason: format!("'{{{name}}}' is not a valid wildcard name"),
                });
            }
            if !names.insert(name.to_string()) {
                return Err(Error::MalformedPattern {
                    template: template.to_string(),
                    reason: format!("wildcard '{{{name}}}' appears more than once"),
                });
            }
            pattern.push_str(&regex::escape(&template[last..whole.start()]));
            pattern.push_str("(?P<");
            pattern.push_str(name);
            pattern.push_str(">.+)");
            last = whole.end();
        }
        pattern.push_str(&regex::escape(&template[last..]));
        pattern.push('$');

        // Identifier-checked group names over escaped literals cannot fail to
        // compile.
        let regex = Regex::new(&pattern).expect("escaped template compiles");
        Ok(PathPattern { template: template.to_string(), regex, names })
    }

    /// Match `concrete` against the full template and extract the wildcard
    /// binding. The match is anchored at both ends; a partial match is no
    /// match.
    pub fn matches(&self, concrete: &str) -> Option<Binding> {
        let caps = self.regex.captures(concrete)?;
        let mut binding = Binding::new();
        for name in &self.names {
            binding.insert(name.clone(), caps[name.as_str()].to_string());
        }
        Some(binding)
    }

    /// Substitute `binding` into the template, producing a concrete path.
    ///
    /// Fails with [`Error::UnboundWildcard`] if the template references a name
    /// the binding does not contain.
    pub fn format(&self, binding: &Binding) -> Result<String> {
        substitute(&self.template, binding)
    }

    /// The wildcard names this template declares.
    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn has_wildcards(&self) -> bool {
        !self.names.is_empty()
    }
}

/// Strict placeholder substitution: unknown names are an error.
pub(crate) fn substitute(template: &str, binding: &Binding) -> Result<String> {
    expand_placeholders(template, |name, out| match binding.get(name) {
        Some(value) => {
            out.push_str(value);
            Ok(())
        }
        None => Err(Error::UnboundWildcard {
            name: name.to_string(),
            template: template.to_string(),
        }),
    })
}

/// Lenient placeholder substitution: unknown names are left verbatim.
/// Used for message templates, where a typo should not abort planning.
pub(crate) fn substitute_lenient(template: &str, binding: &Binding) -> String {
    let result = expand_placeholders(template, |name, out| {
        match binding.get(name) {
            Some(value) => out.push_str(value),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        Ok(())
    });
    match result {
        Ok(out) => out,
        Err(_) => unreachable!("lenient substitution is infallible"),
    }
}

fn expand_placeholders(
    template: &str,
    mut fill: impl FnMut(&str, &mut String) -> Result<()>,
) -> Result<String> {
    let placeholder = regex!(r"\{([^{}]*)\}");
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let name = caps.get(1).unwrap().as_str();
        out.push_str(&template[last..whole.start()]);
        fill(name, &mut out)?;
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
