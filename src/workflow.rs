use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use bitflags::bitflags;
use log::{debug, info};

use crate::engine::{self, Planner};
use crate::error::{Error, Result};
use crate::rule::Rule;

bitflags! {
    /// Coarse run options shared by every entry point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RunFlags: u8 {
        /// Plan and print messages; perform no action.
        const DRY_RUN    = 1 << 0;
        /// Force the requested rule to run even if up to date.
        const FORCE_THIS = 1 << 1;
        /// Force every transitively required rule to run.
        const FORCE_ALL  = 1 << 2;
        /// Suppress per-rule messages (but not errors).
        const QUIET      = 1 << 3;
    }
}

/// Options for one run of a workflow.
#[derive(Debug, Clone)]
pub struct Options {
    pub flags: RunFlags,
    /// Worker pool size; at least 1.
    pub jobs: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options { flags: RunFlags::empty(), jobs: num_cpus::get().max(1) }
    }
}

impl Options {
    pub fn with_flags(flags: RunFlags) -> Self {
        Options { flags, ..Options::default() }
    }
}

/// Registry of rules plus the entry points that plan and execute them.
///
/// The registry is populated once by a rule loader, then read-only while
/// planning and executing. The embedding front-end owns exactly one instance.
///
/// ```no_run
/// use foreman::{Options, Workflow, rule};
///
/// let mut workflow = Workflow::new();
/// workflow.register(rule! {
///     name: "copy",
///     inputs: ["src/{name}.txt"],
///     outputs: ["dst/{name}.txt"],
///     action: |inputs: &[String], outputs: &[String], _| {
///         std::fs::copy(&inputs[0], &outputs[0])?;
///         Ok(())
///     },
/// }?)?;
///
/// workflow.check_rules()?;
/// workflow.produce("dst/readme.txt", &Options::default())?;
/// # Ok::<(), foreman::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct Workflow {
    rules: Vec<Rule>,
    by_name: HashMap<String, usize>,
    workdir_set: bool,
}

impl Workflow {
    pub fn new() -> Self {
        Workflow::default()
    }

    /// Register a fully built rule. Fails with [`Error::DuplicateName`] if a
    /// rule with the same name exists.
    pub fn register(&mut self, rule: Rule) -> Result<()> {
        if self.by_name.contains_key(rule.name()) {
            return Err(Error::DuplicateName(rule.name().to_string()));
        }
        debug!("registered rule '{}'", rule.name());
        self.by_name.insert(rule.name().to_string(), self.rules.len());
        self.rules.push(rule);
        Ok(())
    }

    /// Create and register an empty rule, returning a handle for the loader
    /// to populate.
    pub fn declare_rule(&mut self, name: impl Into<String>) -> Result<&mut Rule> {
        self.register(Rule::new(name))?;
        let last = self.rules.len() - 1;
        Ok(&mut self.rules[last])
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn get_rule(&self, name: &str) -> Option<&Rule> {
        self.by_name.get(name).map(|&id| &self.rules[id])
    }

    pub fn rule_mut(&mut self, name: &str) -> Option<&mut Rule> {
        let &id = self.by_name.get(name)?;
        Some(&mut self.rules[id])
    }

    /// The first-registered rule: the default target.
    pub fn first_rule(&self) -> Option<&Rule> {
        self.rules.first()
    }

    /// The most recently registered rule.
    pub fn last_rule(&self) -> Option<&Rule> {
        self.rules.last()
    }

    /// Mutable handle to the most recently registered rule; loaders that
    /// parse rule definitions top to bottom attach inputs, outputs, message
    /// and action through this.
    pub fn last_rule_mut(&mut self) -> Option<&mut Rule> {
        self.rules.last_mut()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Every rule that declares outputs must have an action.
    pub fn check_rules(&self) -> Result<()> {
        self.rules.iter().try_for_each(Rule::check)
    }

    /// Create `path` if needed and make it the process working directory.
    /// Only the first call has any effect; further calls are ignored.
    pub fn set_workdir(&mut self, path: impl AsRef<Path>) -> io::Result<()> {
        if self.workdir_set {
            return Ok(());
        }
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        std::env::set_current_dir(path)?;
        self.workdir_set = true;
        info!("working directory set to {}", path.display());
        Ok(())
    }

    /// Run the first-registered rule with no requested output.
    pub fn run_first(&self, options: &Options) -> Result<()> {
        if self.rules.is_empty() {
            return Err(Error::MissingRule("(first rule)".to_string()));
        }
        self.run_target(0, None, options)
    }

    /// Run the named rule with no requested output.
    pub fn run_named(&self, name: &str, options: &Options) -> Result<()> {
        let &rule_id =
            self.by_name.get(name).ok_or_else(|| Error::MissingRule(name.to_string()))?;
        self.run_target(rule_id, None, options)
    }

    /// Plan and execute whichever rule produces `path`.
    ///
    /// Every candidate producer gets a dry planning probe first, so a rule
    /// whose own inputs are unobtainable does not count as a producer. More
    /// than one viable producer is [`Error::AmbiguousRule`]; none at all is
    /// [`Error::MissingRule`], or the aggregated [`Error::MissingInput`] when
    /// candidates existed but all failed on their inputs.
    pub fn produce(&self, path: &str, options: &Options) -> Result<()> {
        let mut producer: Option<usize> = None;
        let mut failures: Vec<Error> = Vec::new();
        for (id, rule) in self.rules.iter().enumerate() {
            if !rule.is_producer(path) {
                continue;
            }
            let mut probe = Planner::new(&self.rules, false);
            match probe.plan(id, Some(path), false) {
                Ok(_) => {
                    if let Some(first) = producer {
                        return Err(Error::AmbiguousRule {
                            path: path.to_string(),
                            first: self.rules[first].name().to_string(),
                            second: rule.name().to_string(),
                        });
                    }
                    producer = Some(id);
                }
                Err(err @ Error::MissingInput { .. }) => failures.push(err),
                Err(err) => return Err(err),
            }
        }

        match producer {
            Some(id) => self.run_target(id, Some(path), options),
            None if !failures.is_empty() => {
                Err(Error::MissingInput { rule: None, files: Vec::new(), sources: failures })
            }
            None => Err(Error::MissingRule(path.to_string())),
        }
    }

    fn run_target(&self, rule_id: usize, requested: Option<&str>, options: &Options) -> Result<()> {
        let rule = &self.rules[rule_id];
        if requested.is_none() && rule.has_wildcards() {
            // Nothing binds the wildcards when no concrete output is
            // requested; there is no default binding.
            if let (Some(name), Some(output)) =
                (rule.wildcard_names().iter().next(), rule.outputs().next())
            {
                return Err(Error::UnboundWildcard {
                    name: name.clone(),
                    template: output.template().to_string(),
                });
            }
        }

        let mut planner =
            Planner::new(&self.rules, options.flags.contains(RunFlags::FORCE_ALL));
        let root = planner.plan(rule_id, requested, options.flags.contains(RunFlags::FORCE_THIS))?;
        let plan = planner.into_plan(root);
        info!("planned {} job(s) for rule '{}'", plan.jobs.len(), rule.name());
        engine::execute(&self.rules, &plan, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ActionError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant, SystemTime};

    fn quiet() -> Options {
        Options { flags: RunFlags::QUIET, jobs: 2 }
    }

    fn set_mtime(path: &Path, mtime: SystemTime) {
        fs::File::options().write(true).open(path).unwrap().set_modified(mtime).unwrap();
    }

    /// The two-rule pipeline of the produce-by-file scenario: `raw` writes
    /// `data/{sample}.raw`, `clean` copies it and appends `+clean`.
    fn pipeline(base: &str) -> (Workflow, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let raw_runs = Arc::new(AtomicUsize::new(0));
        let clean_runs = Arc::new(AtomicUsize::new(0));

        let mut workflow = Workflow::new();
        let counter = raw_runs.clone();
        workflow
            .register(
                rule! {
                    name: "raw",
                    outputs: [format!("{base}/data/{{sample}}.raw")],
                    action: move |_, outputs: &[String], wildcards: &crate::Binding| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        fs::write(&outputs[0], format!("raw-{}", wildcards["sample"]))?;
                        Ok(())
                    },
                }
                .unwrap(),
            )
            .unwrap();
        let counter = clean_runs.clone();
        workflow
            .register(
                rule! {
                    name: "clean",
                    inputs: [format!("{base}/data/{{sample}}.raw")],
                    outputs: [format!("{base}/data/{{sample}}.clean")],
                    action: move |inputs: &[String], outputs: &[String], _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let raw = fs::read_to_string(&inputs[0])?;
                        fs::write(&outputs[0], format!("{raw}+clean"))?;
                        Ok(())
                    },
                }
                .unwrap(),
            )
            .unwrap();

        (workflow, raw_runs, clean_runs)
    }

    #[test]
    fn produce_by_file_runs_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let (workflow, raw_runs, clean_runs) = pipeline(base);

        workflow.produce(&format!("{base}/data/s1.clean"), &quiet()).unwrap();

        assert_eq!(raw_runs.load(Ordering::SeqCst), 1);
        assert_eq!(clean_runs.load(Ordering::SeqCst), 1);
        let content = fs::read_to_string(dir.path().join("data/s1.clean")).unwrap();
        assert_eq!(content, "raw-s1+clean");
    }

    #[test]
    fn up_to_date_targets_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let (workflow, raw_runs, clean_runs) = pipeline(base);

        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let now = SystemTime::now();
        fs::write(data.join("s1.raw"), "raw-s1").unwrap();
        set_mtime(&data.join("s1.raw"), now - Duration::from_secs(60));
        fs::write(data.join("s1.clean"), "raw-s1+clean").unwrap();
        set_mtime(&data.join("s1.clean"), now);

        workflow.produce(&format!("{base}/data/s1.clean"), &quiet()).unwrap();

        assert_eq!(raw_runs.load(Ordering::SeqCst), 0);
        assert_eq!(clean_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn force_all_rebuilds_fresh_targets() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let (workflow, raw_runs, clean_runs) = pipeline(base);

        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let now = SystemTime::now();
        fs::write(data.join("s1.raw"), "raw-s1").unwrap();
        set_mtime(&data.join("s1.raw"), now - Duration::from_secs(60));
        fs::write(data.join("s1.clean"), "raw-s1+clean").unwrap();
        set_mtime(&data.join("s1.clean"), now);

        let options = Options { flags: RunFlags::QUIET | RunFlags::FORCE_ALL, jobs: 2 };
        workflow.produce(&format!("{base}/data/s1.clean"), &options).unwrap();

        assert_eq!(raw_runs.load(Ordering::SeqCst), 1);
        assert_eq!(clean_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dry_run_performs_no_action() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let (workflow, raw_runs, clean_runs) = pipeline(base);

        let options = Options::with_flags(RunFlags::QUIET | RunFlags::DRY_RUN);
        workflow.produce(&format!("{base}/data/s1.clean"), &options).unwrap();

        assert_eq!(raw_runs.load(Ordering::SeqCst), 0);
        assert_eq!(clean_runs.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("data/s1.clean").exists());
    }

    #[test]
    fn ambiguous_producers_fail_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();

        let mut workflow = Workflow::new();
        for name in ["render", "plot"] {
            workflow
                .register(
                    rule! {
                        name: name,
                        outputs: [format!("{base}/out/{{x}}.txt")],
                        action: |_, outputs: &[String], _| {
                            fs::write(&outputs[0], b"data")?;
                            Ok(())
                        },
                    }
                    .unwrap(),
                )
                .unwrap();
        }

        let err = workflow.produce(&format!("{base}/out/a.txt"), &quiet()).unwrap_err();
        match err {
            Error::AmbiguousRule { first, second, .. } => {
                assert_eq!(first, "render");
                assert_eq!(second, "plot");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dir.path().join("out/a.txt").exists());
    }

    #[test]
    fn missing_input_names_rule_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();

        let mut workflow = Workflow::new();
        workflow
            .register(
                rule! {
                    name: "analyse",
                    inputs: [format!("{base}/in/x.txt")],
                    outputs: [format!("{base}/out/x.report")],
                    action: |_, _, _| Ok(()),
                }
                .unwrap(),
            )
            .unwrap();

        let err = workflow.produce(&format!("{base}/out/x.report"), &quiet()).unwrap_err();
        let report = err.to_string();
        assert!(report.contains("analyse"), "missing rule name in: {report}");
        assert!(report.contains(&format!("{base}/in/x.txt")), "missing file in: {report}");
    }

    #[test]
    fn failed_action_cleans_up_and_halts_dependants() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let downstream_runs = Arc::new(AtomicUsize::new(0));

        let mut workflow = Workflow::new();
        workflow
            .register(
                rule! {
                    name: "flaky",
                    outputs: [format!("{base}/stage/{{s}}.tmp")],
                    action: |_, outputs: &[String], _| {
                        fs::write(&outputs[0], b"partial")?;
                        Err(ActionError::from("deliberate failure"))
                    },
                }
                .unwrap(),
            )
            .unwrap();
        let counter = downstream_runs.clone();
        workflow
            .register(
                rule! {
                    name: "pack",
                    inputs: [format!("{base}/stage/{{s}}.tmp")],
                    outputs: [format!("{base}/stage/{{s}}.pack")],
                    action: move |_, outputs: &[String], _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        fs::write(&outputs[0], b"packed")?;
                        Ok(())
                    },
                }
                .unwrap(),
            )
            .unwrap();

        let err = workflow.produce(&format!("{base}/stage/s1.pack"), &quiet()).unwrap_err();
        assert!(matches!(err, Error::ActionFailed { ref rule, .. } if rule == "flaky"));
        assert!(!dir.path().join("stage/s1.tmp").exists(), "partial output not cleaned up");
        assert_eq!(downstream_runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dependants_start_after_dependencies_finish() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let spans: Arc<Mutex<Vec<(&'static str, Instant, Instant)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let mut workflow = Workflow::new();
        let recorder = spans.clone();
        workflow
            .register(
                rule! {
                    name: "first",
                    outputs: [format!("{base}/{{s}}.one")],
                    action: move |_, outputs: &[String], _| {
                        let start = Instant::now();
                        std::thread::sleep(Duration::from_millis(20));
                        fs::write(&outputs[0], b"one")?;
                        recorder.lock().unwrap().push(("first", start, Instant::now()));
                        Ok(())
                    },
                }
                .unwrap(),
            )
            .unwrap();
        let recorder = spans.clone();
        workflow
            .register(
                rule! {
                    name: "second",
                    inputs: [format!("{base}/{{s}}.one")],
                    outputs: [format!("{base}/{{s}}.two")],
                    action: move |_, outputs: &[String], _| {
                        let start = Instant::now();
                        fs::write(&outputs[0], b"two")?;
                        recorder.lock().unwrap().push(("second", start, Instant::now()));
                        Ok(())
                    },
                }
                .unwrap(),
            )
            .unwrap();

        workflow.produce(&format!("{base}/s1.two"), &quiet()).unwrap();

        let spans = spans.lock().unwrap();
        let first_end = spans.iter().find(|(name, ..)| *name == "first").unwrap().2;
        let second_start = spans.iter().find(|(name, ..)| *name == "second").unwrap().1;
        assert!(second_start >= first_end, "dependant started before its dependency finished");
    }

    #[test]
    fn independent_jobs_run_on_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut workflow = Workflow::new();
        for name in ["alpha", "beta", "gamma"] {
            let counter = runs.clone();
            workflow
                .register(
                    rule! {
                        name: name,
                        outputs: [format!("{base}/{name}/{{s}}.part")],
                        action: move |_, outputs: &[String], _| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            fs::write(&outputs[0], b"part")?;
                            Ok(())
                        },
                    }
                    .unwrap(),
                )
                .unwrap();
        }
        workflow
            .register(
                rule! {
                    name: "join",
                    inputs: [
                        format!("{base}/alpha/{{s}}.part"),
                        format!("{base}/beta/{{s}}.part"),
                        format!("{base}/gamma/{{s}}.part"),
                    ],
                    outputs: [format!("{base}/{{s}}.joined")],
                    action: |_, outputs: &[String], _| {
                        fs::write(&outputs[0], b"joined")?;
                        Ok(())
                    },
                }
                .unwrap(),
            )
            .unwrap();

        let options = Options { flags: RunFlags::QUIET, jobs: 3 };
        workflow.produce(&format!("{base}/s1.joined"), &options).unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(dir.path().join("s1.joined").exists());
    }

    #[test]
    fn run_named_executes_a_wildcard_free_rule() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();

        let mut workflow = Workflow::new();
        workflow
            .register(
                rule! {
                    name: "init",
                    outputs: [format!("{base}/marker.txt")],
                    message: "initialising {output}",
                    action: |_, outputs: &[String], _| {
                        fs::write(&outputs[0], b"ready")?;
                        Ok(())
                    },
                }
                .unwrap(),
            )
            .unwrap();

        workflow.run_named("init", &quiet()).unwrap();
        assert!(dir.path().join("marker.txt").exists());

        let err = workflow.run_named("missing", &quiet()).unwrap_err();
        assert!(matches!(err, Error::MissingRule(name) if name == "missing"));
    }

    #[test]
    fn run_first_rejects_wildcard_rules() {
        let mut workflow = Workflow::new();
        workflow
            .register(
                rule! {
                    name: "templated",
                    outputs: ["out/{x}.txt"],
                    action: |_, _, _| Ok(()),
                }
                .unwrap(),
            )
            .unwrap();

        let err = workflow.run_first(&quiet()).unwrap_err();
        match err {
            Error::UnboundWildcard { name, .. } => assert_eq!(name, "x"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_rule_names_are_rejected() {
        let mut workflow = Workflow::new();
        workflow.declare_rule("build").unwrap();
        let err = workflow.declare_rule("build").unwrap_err();
        assert!(matches!(err, Error::DuplicateName(name) if name == "build"));
    }

    #[test]
    fn declared_rules_are_found_in_insertion_order() {
        let mut workflow = Workflow::new();
        workflow.declare_rule("one").unwrap();
        workflow.declare_rule("two").unwrap();

        assert!(workflow.has_rule("one"));
        assert!(!workflow.has_rule("three"));
        assert_eq!(workflow.first_rule().unwrap().name(), "one");
        assert_eq!(workflow.last_rule().unwrap().name(), "two");
        assert_eq!(workflow.rules().count(), 2);
    }

    #[test]
    fn loader_populates_the_last_declared_rule() {
        let mut workflow = Workflow::new();
        workflow.declare_rule("stage").unwrap();
        {
            let rule = workflow.last_rule_mut().unwrap();
            rule.add_input(crate::paths!["in.txt"]).unwrap();
            rule.add_output(crate::paths!["out.txt"]).unwrap();
            rule.set_action(|_, _, _| Ok(()));
        }
        assert!(workflow.get_rule("stage").unwrap().has_action());
    }

    #[test]
    fn check_rules_flags_output_without_action() {
        let mut workflow = Workflow::new();
        workflow.declare_rule("orphan").unwrap();
        workflow.last_rule_mut().unwrap().add_output(crate::paths!["out.txt"]).unwrap();

        let err = workflow.check_rules().unwrap_err();
        assert!(matches!(err, Error::MissingAction(name) if name == "orphan"));
    }

    #[test]
    fn produce_reports_aggregated_probe_failures() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();

        // The only candidate producer needs an input nobody can provide, so
        // `produce` reports the aggregated probe failure, not MissingRule.
        let mut workflow = Workflow::new();
        workflow
            .register(
                rule! {
                    name: "derive",
                    inputs: [format!("{base}/absent.src")],
                    outputs: [format!("{base}/{{x}}.out")],
                    action: |_, _, _| Ok(()),
                }
                .unwrap(),
            )
            .unwrap();

        let err = workflow.produce(&format!("{base}/a.out"), &quiet()).unwrap_err();
        match &err {
            Error::MissingInput { rule: None, sources, .. } => {
                assert_eq!(sources.len(), 1);
                assert!(sources[0].to_string().contains("derive"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = workflow.produce(&format!("{base}/nothing.txt"), &quiet()).unwrap_err();
        assert!(matches!(err, Error::MissingRule(_)));
    }

    #[test]
    fn set_workdir_creates_and_latches() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("work");
        let second = dir.path().join("other");

        let mut workflow = Workflow::new();
        workflow.set_workdir(&first).unwrap();
        assert!(first.is_dir());

        // Latched: the second call is ignored entirely.
        workflow.set_workdir(&second).unwrap();
        assert!(!second.exists());
    }
}
