//! Application wiring
//!
//! Builds one self-contained set of components from configuration: operator
//! registry, event bus, workflow engine, rule engine and the task applying
//! rule commands. Nothing is global; hosts may create several applications.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::engine::{RunOutcome, WorkflowEngine};
use crate::events::middleware::LoggingMiddleware;
use crate::events::EventBus;
use crate::operator::builtin::register_builtins;
use crate::operator::OperatorRegistry;
use crate::rules::{OperatorCommandRunner, Rule, RuleEngine};
use crate::types::Variables;
use crate::workflow::WorkflowDefinition;

const RUNNER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Application {
    pub config: Config,
    pub registry: Arc<OperatorRegistry>,
    pub bus: Arc<EventBus>,
    pub engine: WorkflowEngine,
    pub rules: Arc<RuleEngine>,
    command_runner: JoinHandle<usize>,
}

impl Application {
    /// Assemble the components; must run inside a Tokio runtime
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(OperatorRegistry::new());
        let bus = Arc::new(EventBus::new(config.event_bus.history_capacity));
        bus.use_middleware(LoggingMiddleware);
        register_builtins(&registry, bus.clone());

        let engine = WorkflowEngine::new(registry.clone(), bus.clone(), config.engine.clone());

        let (runner, sender) = OperatorCommandRunner::new(registry.clone());
        let rules = Arc::new(RuleEngine::new(Arc::new(sender), &config.rules));
        rules.attach(&bus);

        Self {
            config,
            registry,
            bus,
            engine,
            rules,
            command_runner: runner.spawn(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub async fn run(&self, workflow_id: &str, variables: Variables) -> RunOutcome {
        self.engine.run(workflow_id, variables).await
    }

    /// Drain pending rule commands, then stop every operator
    ///
    /// Returns how many rule commands were applied over the application's life.
    pub async fn shutdown(self) -> Result<usize> {
        let Application {
            registry,
            rules,
            mut command_runner,
            ..
        } = self;

        // the runner ends once the rule engine (the only sender) is gone
        drop(rules);
        let applied = match tokio::time::timeout(RUNNER_DRAIN_TIMEOUT, &mut command_runner).await {
            Ok(joined) => joined.context("Command runner task failed")?,
            Err(_) => {
                tracing::warn!("rule engine still referenced; aborting command runner");
                command_runner.abort();
                0
            }
        };

        let stopped = registry.stop_all().await;
        tracing::info!(applied, stopped, "application shut down");
        Ok(applied)
    }
}

/* ===================== Initialization ===================== */

/// Workflow definition file, JSON or TOML by extension
#[derive(Debug, Clone)]
pub struct WorkflowFile {
    pub file_path: PathBuf,
}

impl WorkflowFile {
    pub fn load(&self) -> Result<WorkflowDefinition> {
        let source = std::fs::read_to_string(&self.file_path)
            .with_context(|| format!("Failed to read workflow file {}", self.file_path.display()))?;
        let is_toml = self
            .file_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let definition = if is_toml {
            WorkflowDefinition::from_toml_str(&source)
        } else {
            WorkflowDefinition::from_json_str(&source)
        };
        definition.with_context(|| format!("Failed to parse workflow file {}", self.file_path.display()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Config file path (overrides default search)
    pub config_path: Option<PathBuf>,
    pub load_dotenv: bool,
    /// Install the tracing subscriber from `[logging]`
    pub init_logging: bool,
    /// Dotted config overrides, applied last
    pub overrides: Vec<(String, String)>,
    pub workflows: Vec<WorkflowDefinition>,
    pub workflow_files: Vec<WorkflowFile>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Default)]
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn load_dotenv(mut self, load: bool) -> Self {
        self.options.load_dotenv = load;
        self
    }

    pub fn init_logging(mut self, init: bool) -> Self {
        self.options.init_logging = init;
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.overrides.push((key.into(), value.into()));
        self
    }

    pub fn workflow(mut self, definition: WorkflowDefinition) -> Self {
        self.options.workflows.push(definition);
        self
    }

    pub fn workflow_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.workflow_files.push(WorkflowFile {
            file_path: path.into(),
        });
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.options.rules.push(rule);
        self
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

/// Load configuration, assemble an [`Application`] and register workflows and rules
pub async fn initialize(options: InitOptions) -> Result<Application> {
    let mut builder = Config::builder()
        .config_path(options.config_path)
        .load_dotenv(options.load_dotenv);
    for (key, value) in options.overrides {
        builder = builder.set(key, value);
    }
    let config = builder.build()?;

    if options.init_logging && !crate::logging::init(&config.logging) {
        tracing::debug!("tracing subscriber already installed");
    }

    let app = Application::new(config);

    let mut definitions = options.workflows;
    for file in &options.workflow_files {
        definitions.push(file.load()?);
    }
    for definition in definitions {
        let id = definition.id.clone();
        app.engine
            .register_workflow(definition)
            .with_context(|| format!("Failed to register workflow '{}'", id))?;
    }

    for rule in options.rules {
        app.rules.add_rule(rule);
    }

    tracing::info!(
        workflows = app.engine.workflow_ids().len(),
        rules = app.rules.rules().len(),
        "application initialized"
    );
    Ok(app)
}
