//! Configurable scrape pipeline.
//!
//! A pipeline is an ordered list of named steps sharing one mutable
//! context per run. Steps sort by position, with insertion order breaking
//! ties. The default line-up is fetch, parse, extract, clean; plugins sit
//! after them. Default steps are fatal (their failure aborts the run),
//! everything else records its error and lets the run continue. `run`
//! always returns the context, however far it got.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clean::Cleaner;
use crate::content::FetchResult;
use crate::error::ScrapeError;
use crate::extract::RuleEngine;
use crate::fetch::FetchOptions;
use crate::parse::ParsedContent;
use crate::rules::RuleSet;
use crate::traits::{Fetcher, TextAnalyzer};

pub const POSITION_FETCH: i32 = 10;
pub const POSITION_PARSE: i32 = 20;
pub const POSITION_EXTRACT: i32 = 30;
pub const POSITION_CLEAN: i32 = 40;
pub const POSITION_PLUGINS: i32 = 50;

/// Everything a run accumulates, passed through every step.
#[derive(Debug)]
pub struct PipelineContext {
    /// Unique id for this run, mainly for log correlation.
    pub id: Uuid,
    pub url: String,
    pub rules: RuleSet,
    pub fetch_result: Option<FetchResult>,
    pub parsed: Option<ParsedContent>,
    /// Field values extracted so far; plugins may rewrite these.
    pub extracted: Map<String, Value>,
    pub errors: Vec<StepError>,
    /// Scratch space for steps that need to hand data to later steps.
    pub metadata: Map<String, Value>,
}

impl PipelineContext {
    fn new(url: String, rules: RuleSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            rules,
            fetch_result: None,
            parsed: None,
            extracted: Map::new(),
            errors: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn record_error(&mut self, step: impl Into<String>, error: ScrapeError) {
        self.errors.push(StepError {
            step: step.into(),
            error,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// An error recorded during a run, attributed to the step that hit it.
#[derive(Debug)]
pub struct StepError {
    pub step: String,
    pub error: ScrapeError,
}

/// A unit of pipeline work.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    async fn run(&self, context: &mut PipelineContext) -> Result<(), ScrapeError>;
}

/// Transforms extracted fields after the default steps have run.
///
/// Plugins are registered as non-fatal steps at [`POSITION_PLUGINS`] and
/// execute in registration order.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    async fn process(&self, fields: &mut Map<String, Value>) -> Result<(), ScrapeError>;
}

#[derive(Clone)]
struct StepSlot {
    name: String,
    step: Arc<dyn PipelineStep>,
    position: i32,
    enabled: bool,
    fatal: bool,
    seq: u64,
}

/// The step table plus run machinery. Cloning shares the table, so a
/// pipeline can be reconfigured while clones keep running; each run
/// snapshots the table when it starts.
#[derive(Clone)]
pub struct Pipeline {
    steps: Arc<RwLock<Vec<StepSlot>>>,
    next_seq: Arc<AtomicU64>,
}

impl Pipeline {
    /// A pipeline with no steps at all.
    pub fn empty() -> Self {
        Self {
            steps: Arc::new(RwLock::new(Vec::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The default line-up: fetch, parse, extract (all fatal) and a
    /// non-fatal clean step.
    pub fn standard<F, A>(fetcher: F, engine: RuleEngine<A>) -> Self
    where
        F: Fetcher + 'static,
        A: TextAnalyzer + 'static,
    {
        Self::standard_with_options(fetcher, engine, FetchOptions::default())
    }

    pub fn standard_with_options<F, A>(
        fetcher: F,
        engine: RuleEngine<A>,
        options: FetchOptions,
    ) -> Self
    where
        F: Fetcher + 'static,
        A: TextAnalyzer + 'static,
    {
        let pipeline = Self::empty();
        pipeline.push(
            "fetch",
            POSITION_FETCH,
            Arc::new(FetchStep { fetcher, options }),
            true,
        );
        pipeline.push("parse", POSITION_PARSE, Arc::new(ParseStep), true);
        pipeline.push("extract", POSITION_EXTRACT, Arc::new(ExtractStep { engine }), true);
        pipeline.push("clean", POSITION_CLEAN, Arc::new(CleanStep::default()), false);
        pipeline
    }

    fn read_steps(&self) -> RwLockReadGuard<'_, Vec<StepSlot>> {
        match self.steps.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Pipeline step table lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_steps(&self) -> RwLockWriteGuard<'_, Vec<StepSlot>> {
        match self.steps.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Pipeline step table lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn push(&self, name: &str, position: i32, step: Arc<dyn PipelineStep>, fatal: bool) {
        let mut steps = self.write_steps();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        steps.push(StepSlot {
            name: name.to_string(),
            step,
            position,
            enabled: true,
            fatal,
            seq,
        });
    }

    fn insert(
        &self,
        name: String,
        position: i32,
        step: Arc<dyn PipelineStep>,
        fatal: bool,
    ) -> Result<(), ScrapeError> {
        let mut steps = self.write_steps();
        if steps.iter().any(|s| s.name == name) {
            return Err(ScrapeError::Config(format!(
                "duplicate pipeline step '{name}'"
            )));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        steps.push(StepSlot {
            name,
            step,
            position,
            enabled: true,
            fatal,
            seq,
        });
        Ok(())
    }

    /// Register a non-fatal step. Names must be unique.
    pub fn add_step(
        &self,
        name: impl Into<String>,
        position: i32,
        step: Arc<dyn PipelineStep>,
    ) -> Result<(), ScrapeError> {
        self.insert(name.into(), position, step, false)
    }

    /// Register a step whose failure aborts the run.
    pub fn add_fatal_step(
        &self,
        name: impl Into<String>,
        position: i32,
        step: Arc<dyn PipelineStep>,
    ) -> Result<(), ScrapeError> {
        self.insert(name.into(), position, step, true)
    }

    /// Register a plugin under its own name at [`POSITION_PLUGINS`].
    pub fn add_plugin<P: Plugin + 'static>(&self, plugin: P) -> Result<(), ScrapeError> {
        let name = plugin.name().to_string();
        self.insert(
            name.clone(),
            POSITION_PLUGINS,
            Arc::new(PluginStep { name, plugin }),
            false,
        )
    }

    /// Remove a step by name. Returns whether it existed.
    pub fn remove_step(&self, name: &str) -> bool {
        let mut steps = self.write_steps();
        let before = steps.len();
        steps.retain(|s| s.name != name);
        steps.len() != before
    }

    /// Enable or disable a step without forgetting its registration.
    /// Returns whether the step exists.
    pub fn enable_step(&self, name: &str, enabled: bool) -> bool {
        let mut steps = self.write_steps();
        match steps.iter_mut().find(|s| s.name == name) {
            Some(slot) => {
                slot.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// All registered step names in execution order, disabled ones included.
    pub fn step_names(&self) -> Vec<String> {
        let steps = self.read_steps();
        let mut slots: Vec<(i32, u64, String)> = steps
            .iter()
            .map(|s| (s.position, s.seq, s.name.clone()))
            .collect();
        slots.sort();
        slots.into_iter().map(|(_, _, name)| name).collect()
    }

    /// Run every enabled step against a fresh context.
    ///
    /// The step list is snapshotted up front, so reconfiguring the
    /// pipeline mid-run does not affect runs already started. The context
    /// is always returned, with whatever the steps managed to produce.
    pub async fn run(&self, url: impl Into<String>, rules: RuleSet) -> PipelineContext {
        let url = url.into();
        let mut context = PipelineContext::new(url, rules);
        let snapshot: Vec<StepSlot> = {
            let steps = self.read_steps();
            let mut active: Vec<StepSlot> =
                steps.iter().filter(|s| s.enabled).cloned().collect();
            active.sort_by_key(|s| (s.position, s.seq));
            active
        };

        tracing::info!(
            run_id = %context.id,
            url = %context.url,
            steps = snapshot.len(),
            "Pipeline run started"
        );
        for slot in &snapshot {
            match slot.step.run(&mut context).await {
                Ok(()) => {}
                Err(e) if slot.fatal => {
                    tracing::warn!(
                        run_id = %context.id,
                        step = %slot.name,
                        error = %e,
                        "Fatal step failed, aborting run"
                    );
                    context.record_error(&slot.name, e);
                    break;
                }
                Err(e) => {
                    tracing::debug!(
                        run_id = %context.id,
                        step = %slot.name,
                        error = %e,
                        "Step failed, continuing"
                    );
                    context.record_error(&slot.name, e);
                }
            }
        }
        context
    }

    /// Run the pipeline over several URLs concurrently. Results come back
    /// in input order.
    pub async fn run_many(&self, urls: &[String], rules: &RuleSet) -> Vec<PipelineContext> {
        let runs = urls.iter().map(|url| self.run(url.clone(), rules.clone()));
        futures::future::join_all(runs).await
    }
}

// ---------------------------------------------------------------------------
// Default steps
// ---------------------------------------------------------------------------

struct FetchStep<F: Fetcher> {
    fetcher: F,
    options: FetchOptions,
}

#[async_trait]
impl<F: Fetcher> PipelineStep for FetchStep<F> {
    async fn run(&self, context: &mut PipelineContext) -> Result<(), ScrapeError> {
        let result = self.fetcher.fetch(&context.url, &self.options).await?;
        context.fetch_result = Some(result);
        Ok(())
    }
}

struct ParseStep;

#[async_trait]
impl PipelineStep for ParseStep {
    async fn run(&self, context: &mut PipelineContext) -> Result<(), ScrapeError> {
        let fetch = context
            .fetch_result
            .as_ref()
            .ok_or_else(|| ScrapeError::Parse("nothing fetched".to_string()))?;
        context.parsed = Some(ParsedContent::from_fetch(fetch)?);
        Ok(())
    }
}

struct ExtractStep<A: TextAnalyzer> {
    engine: RuleEngine<A>,
}

#[async_trait]
impl<A: TextAnalyzer> PipelineStep for ExtractStep<A> {
    async fn run(&self, context: &mut PipelineContext) -> Result<(), ScrapeError> {
        let parsed = context
            .parsed
            .as_ref()
            .ok_or_else(|| ScrapeError::Parse("nothing parsed".to_string()))?;
        let extracted = self.engine.extract(parsed, &context.rules).await?;
        for failure in extracted.failures {
            context.errors.push(StepError {
                step: "extract".to_string(),
                error: ScrapeError::Extraction {
                    field: failure.field,
                    message: failure.message,
                },
            });
        }
        for (field, value) in extracted.fields {
            context.extracted.insert(field, value);
        }
        Ok(())
    }
}

/// The default cleanup step. Public so a customized [`Cleaner`] can be
/// swapped in under the same position.
pub struct CleanStep {
    cleaner: Cleaner,
}

impl CleanStep {
    pub fn new(cleaner: Cleaner) -> Self {
        Self { cleaner }
    }
}

impl Default for CleanStep {
    fn default() -> Self {
        Self::new(Cleaner::default())
    }
}

#[async_trait]
impl PipelineStep for CleanStep {
    async fn run(&self, context: &mut PipelineContext) -> Result<(), ScrapeError> {
        self.cleaner.clean(&mut context.extracted);
        Ok(())
    }
}

struct PluginStep<P> {
    name: String,
    plugin: P,
}

#[async_trait]
impl<P: Plugin> PipelineStep for PluginStep<P> {
    async fn run(&self, context: &mut PipelineContext) -> Result<(), ScrapeError> {
        self.plugin
            .process(&mut context.extracted)
            .await
            .map_err(|e| match e {
                already @ ScrapeError::Plugin { .. } => already,
                other => ScrapeError::Plugin {
                    name: self.name.clone(),
                    message: other.to_string(),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use crate::testutil::MockSite;
    use serde_json::json;

    fn site_with_product() -> MockSite {
        let site = MockSite::new();
        site.add_page(
            "https://site.test/product",
            "<html><body><h1>Widget   Pro</h1><p class=\"desc\">Fine.</p></body></html>",
        );
        site
    }

    fn title_rules() -> RuleSet {
        RuleSet::new().with("title", Rule::css("h1"))
    }

    /// Appends its tag to a metadata array, to observe execution order.
    struct MarkStep {
        tag: &'static str,
    }

    #[async_trait]
    impl PipelineStep for MarkStep {
        async fn run(&self, context: &mut PipelineContext) -> Result<(), ScrapeError> {
            let order = context
                .metadata
                .entry("order")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = order {
                items.push(json!(self.tag));
            }
            Ok(())
        }
    }

    struct FailStep;

    #[async_trait]
    impl PipelineStep for FailStep {
        async fn run(&self, _context: &mut PipelineContext) -> Result<(), ScrapeError> {
            Err(ScrapeError::Config("step exploded".to_string()))
        }
    }

    struct TagPlugin {
        name: &'static str,
        tag: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for TagPlugin {
        fn name(&self) -> &str {
            self.name
        }

        async fn process(&self, fields: &mut Map<String, Value>) -> Result<(), ScrapeError> {
            if self.fail {
                return Err(ScrapeError::Config("plugin exploded".to_string()));
            }
            let order = fields
                .entry("plugin_order")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = order {
                items.push(json!(self.tag));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn standard_run_populates_the_context() {
        let pipeline = Pipeline::standard(site_with_product(), RuleEngine::new());
        let context = pipeline.run("https://site.test/product", title_rules()).await;

        assert!(context.fetch_result.is_some());
        assert!(context.parsed.is_some());
        assert_eq!(context.extracted["title"], json!("Widget Pro"));
        assert!(!context.has_errors());
        assert_ne!(context.id, Uuid::nil());
    }

    #[tokio::test]
    async fn fatal_fetch_failure_short_circuits_the_run() {
        let pipeline = Pipeline::standard(MockSite::new(), RuleEngine::new());
        let context = pipeline.run("https://site.test/gone", title_rules()).await;

        assert_eq!(context.errors.len(), 1);
        assert_eq!(context.errors[0].step, "fetch");
        assert!(matches!(
            context.errors[0].error,
            ScrapeError::HttpStatus { status: 404, .. }
        ));
        assert!(context.parsed.is_none());
        assert!(context.extracted.is_empty());
    }

    #[tokio::test]
    async fn failing_clean_step_still_returns_extraction() {
        let pipeline = Pipeline::standard(site_with_product(), RuleEngine::new());
        assert!(pipeline.remove_step("clean"));
        pipeline
            .add_step("clean", POSITION_CLEAN, Arc::new(FailStep))
            .unwrap();

        let context = pipeline.run("https://site.test/product", title_rules()).await;

        assert_eq!(context.extracted["title"], json!("Widget Pro"));
        assert_eq!(context.errors.len(), 1);
        assert_eq!(context.errors[0].step, "clean");
    }

    #[tokio::test]
    async fn plugin_failure_does_not_stop_later_plugins() {
        let pipeline = Pipeline::standard(site_with_product(), RuleEngine::new());
        pipeline
            .add_plugin(TagPlugin {
                name: "broken",
                tag: "x",
                fail: true,
            })
            .unwrap();
        pipeline
            .add_plugin(TagPlugin {
                name: "tagger",
                tag: "ran",
                fail: false,
            })
            .unwrap();

        let context = pipeline.run("https://site.test/product", title_rules()).await;

        assert_eq!(context.extracted["plugin_order"], json!(["ran"]));
        assert_eq!(context.errors.len(), 1);
        match &context.errors[0].error {
            ScrapeError::Plugin { name, .. } => assert_eq!(name, "broken"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn plugins_run_in_registration_order() {
        let pipeline = Pipeline::standard(site_with_product(), RuleEngine::new());
        for (name, tag) in [("first", "a"), ("second", "b"), ("third", "c")] {
            pipeline
                .add_plugin(TagPlugin {
                    name,
                    tag,
                    fail: false,
                })
                .unwrap();
        }

        let context = pipeline.run("https://site.test/product", title_rules()).await;
        assert_eq!(context.extracted["plugin_order"], json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn step_names_must_be_unique() {
        let pipeline = Pipeline::empty();
        pipeline
            .add_step("mark", 10, Arc::new(MarkStep { tag: "a" }))
            .unwrap();
        let err = pipeline
            .add_step("mark", 20, Arc::new(MarkStep { tag: "b" }))
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Config(_)));

        assert!(pipeline.remove_step("mark"));
        assert!(!pipeline.remove_step("mark"));
        assert!(pipeline
            .add_step("mark", 20, Arc::new(MarkStep { tag: "b" }))
            .is_ok());
    }

    #[tokio::test]
    async fn disabled_steps_are_skipped_but_not_forgotten() {
        let pipeline = Pipeline::empty();
        pipeline
            .add_step("mark", 10, Arc::new(MarkStep { tag: "m" }))
            .unwrap();

        assert!(pipeline.enable_step("mark", false));
        let context = pipeline.run("https://site.test/x", RuleSet::new()).await;
        assert!(context.metadata.get("order").is_none());

        assert!(pipeline.enable_step("mark", true));
        let context = pipeline.run("https://site.test/x", RuleSet::new()).await;
        assert_eq!(context.metadata["order"], json!(["m"]));

        assert!(!pipeline.enable_step("missing", true));
    }

    #[tokio::test]
    async fn equal_positions_run_in_insertion_order() {
        let pipeline = Pipeline::empty();
        pipeline
            .add_step("late", 10, Arc::new(MarkStep { tag: "late" }))
            .unwrap();
        pipeline
            .add_step("early", 5, Arc::new(MarkStep { tag: "early" }))
            .unwrap();
        pipeline
            .add_step("late-too", 10, Arc::new(MarkStep { tag: "late-too" }))
            .unwrap();

        assert_eq!(pipeline.step_names(), ["early", "late", "late-too"]);

        let context = pipeline.run("https://site.test/x", RuleSet::new()).await;
        assert_eq!(context.metadata["order"], json!(["early", "late", "late-too"]));
    }

    #[tokio::test]
    async fn run_many_keeps_input_order() {
        let site = MockSite::new();
        for (page, title) in [("a", "Alpha"), ("b", "Beta"), ("c", "Gamma")] {
            site.add_page(
                &format!("https://site.test/{page}"),
                &format!("<html><body><h1>{title}</h1></body></html>"),
            );
        }
        let pipeline = Pipeline::standard(site, RuleEngine::new());

        let urls: Vec<String> = ["a", "b", "c"]
            .iter()
            .map(|p| format!("https://site.test/{p}"))
            .collect();
        let contexts = pipeline.run_many(&urls, &title_rules()).await;

        assert_eq!(contexts.len(), 3);
        let titles: Vec<&Value> = contexts.iter().map(|c| &c.extracted["title"]).collect();
        assert_eq!(titles, [&json!("Alpha"), &json!("Beta"), &json!("Gamma")]);
        for (context, url) in contexts.iter().zip(&urls) {
            assert_eq!(&context.url, url);
        }
    }

    #[tokio::test]
    async fn malformed_rules_fail_the_extract_step() {
        let pipeline = Pipeline::standard(site_with_product(), RuleEngine::new());
        let rules = RuleSet::new().with("bad", Rule::css("div >"));
        let context = pipeline.run("https://site.test/product", rules).await;

        assert_eq!(context.errors.len(), 1);
        assert_eq!(context.errors[0].step, "extract");
        assert!(matches!(
            context.errors[0].error,
            ScrapeError::InvalidRule { .. }
        ));
        assert!(context.extracted.is_empty());
    }

    #[tokio::test]
    async fn field_failures_are_recorded_but_do_not_abort() {
        let pipeline = Pipeline::standard(site_with_product(), RuleEngine::new());
        let rules = RuleSet::new()
            .with("title", Rule::css("h1"))
            .with(
                "broken",
                Rule::css("p.desc").with_processor(|_| Err("nope".to_string())),
            );
        let context = pipeline.run("https://site.test/product", rules).await;

        assert_eq!(context.extracted["title"], json!("Widget Pro"));
        assert_eq!(context.extracted["broken"], Value::Null);
        assert_eq!(context.errors.len(), 1);
        assert_eq!(context.errors[0].step, "extract");
        assert!(matches!(
            context.errors[0].error,
            ScrapeError::Extraction { .. }
        ));
    }
}
