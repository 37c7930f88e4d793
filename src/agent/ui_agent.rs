//! Agent facade: plan-cache replay, planning loop, locate and short memory.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use super::context::UiContextSource;
use super::executor::{FlushOutput, NoopObserver, TaskObserver, TaskRunner};
use super::resolver::LocateResolver;
use super::short_memory::{ShortMemoryManager, WarmupOptions, WarmupTarget};
use super::task_builder::{BuildOptions, TaskBuilder};
use crate::cache::{CacheConfig, TaskCache};
use crate::device::{Device, DeviceAction};
use crate::error::EngineError;
use crate::model::{LocateService, ModelClient, PlanRequest, PlanService};
use crate::script::WorkflowScript;
use crate::types::{
    executor_fn, ExecutionDump, ExecutorContext, HitBy, HitSource, LocateParam,
    LocateResultElement, Plan, PlanningAction, Task, TaskCacheHit, TaskKind, TaskReturn,
};

/// Default bound on planning rounds per instruction.
pub const DEFAULT_REPLANNING_CYCLE_LIMIT: usize = 20;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Group name written into dumps.
    pub name: String,
    pub replanning_cycle_limit: usize,
    pub cache: Option<CacheConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "ui-agent".to_string(),
            replanning_cycle_limit: DEFAULT_REPLANNING_CYCLE_LIMIT,
            cache: None,
        }
    }
}

impl AgentConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_replanning_cycle_limit(mut self, limit: usize) -> Self {
        self.replanning_cycle_limit = limit.max(1);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Options for [`UiAgent::ai_act`].
#[derive(Debug, Clone, Default)]
pub struct ActOptions {
    /// `Some(false)` bypasses both cache tiers.
    pub cacheable: Option<bool>,
    /// Extra context for the planner.
    pub action_context: Option<String>,
}

/// Options for [`UiAgent::ai_locate`].
#[derive(Debug, Clone, Default)]
pub struct LocateOptions {
    pub cacheable: Option<bool>,
    pub deep_think: Option<bool>,
}

/// All executions of one agent, as written by [`UiAgent::write_dump`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedDump {
    pub group_name: String,
    pub executions: Vec<ExecutionDump>,
}

fn join_context(existing: Option<String>, extra: Option<String>) -> Option<String> {
    match (existing, extra) {
        (Some(a), Some(b)) => Some(format!("{}\n{}", a, b)),
        (a, b) => a.or(b),
    }
}

/// Drives a device from natural-language instructions.
pub struct UiAgent {
    config: AgentConfig,
    device: Arc<dyn Device>,
    locator: Arc<dyn LocateService>,
    planner: Arc<dyn PlanService>,
    cache: Option<Arc<TaskCache>>,
    source: Arc<UiContextSource>,
    resolver: Arc<LocateResolver>,
    short_memory: Arc<ShortMemoryManager>,
    observer: Arc<dyn TaskObserver>,
    dumps: Mutex<Vec<ExecutionDump>>,
}

impl UiAgent {
    pub fn new(
        device: Arc<dyn Device>,
        locator: Arc<dyn LocateService>,
        planner: Arc<dyn PlanService>,
        config: AgentConfig,
    ) -> Self {
        let cache = config
            .cache
            .clone()
            .map(|cache_config| Arc::new(TaskCache::new(cache_config)));
        let source = Arc::new(UiContextSource::new(device.clone()));
        let resolver = Arc::new(LocateResolver::new(
            device.clone(),
            locator.clone(),
            cache.clone(),
        ));
        let short_memory = Arc::new(ShortMemoryManager::new(source.clone(), locator.clone()));

        Self {
            config,
            device,
            locator,
            planner,
            cache,
            source,
            resolver,
            short_memory,
            observer: Arc::new(NoopObserver),
            dumps: Mutex::new(Vec::new()),
        }
    }

    /// Agent backed by one model client for both planning and locating.
    pub fn with_model_client(
        device: Arc<dyn Device>,
        client: Arc<ModelClient>,
        config: AgentConfig,
    ) -> Self {
        Self::new(device, client.clone(), client, config)
    }

    /// Use an existing cache instance.
    pub fn with_cache(mut self, cache: Arc<TaskCache>) -> Self {
        self.resolver = Arc::new(LocateResolver::new(
            self.device.clone(),
            self.locator.clone(),
            Some(cache.clone()),
        ));
        self.cache = Some(cache);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn cache(&self) -> Option<&Arc<TaskCache>> {
        self.cache.as_ref()
    }

    pub fn short_memory(&self) -> &Arc<ShortMemoryManager> {
        &self.short_memory
    }

    /// Device actions plus the short memory actions.
    pub fn action_space(&self) -> Vec<Arc<dyn DeviceAction>> {
        let mut space = self.device.action_space();
        space.extend(self.short_memory.actions(self.device.clone()));
        space
    }

    fn builder(&self) -> TaskBuilder {
        TaskBuilder::new(self.device.clone(), self.resolver.clone(), self.action_space())
    }

    fn new_runner(&self, name: impl Into<String>) -> TaskRunner {
        TaskRunner::new(name, self.source.clone())
            .with_observer(self.observer.clone())
            .with_model_name(self.locator.model_name())
    }

    fn record(&self, runner: &TaskRunner) {
        self.dumps.lock().push(runner.dump());
    }

    /// Carry out `prompt`, replaying a cached workflow when one is usable.
    pub async fn ai_act(
        &self,
        prompt: &str,
        options: ActOptions,
    ) -> Result<Option<FlushOutput>, EngineError> {
        let cacheable = options.cacheable != Some(false);
        let action_context = options.action_context.clone();

        if let Some(cache) = self.cache.as_ref().filter(|_| cacheable) {
            if let Some(record) = cache.match_plan_cache(prompt) {
                match record.usable_workflow() {
                    Some(workflow) => return self.replay_cached_plan(prompt, workflow).await,
                    None => tracing::debug!(
                        "Cached workflow for \"{}\" is empty, planning instead",
                        prompt
                    ),
                }
            }
        }

        let mut runner = self.new_runner(format!("Act - {}", prompt));
        let result = self
            .plan_and_run(&mut runner, prompt, options.cacheable, action_context)
            .await;
        self.record(&runner);
        let (output, executed) = result?;

        if let Some(cache) = self.cache.as_ref().filter(|_| cacheable) {
            let script = WorkflowScript::from_actions(prompt, &executed);
            if script.step_count() > 0 {
                match script.to_yaml() {
                    Ok(yaml) => {
                        if let Err(e) = cache.write_plan_cache(prompt, &yaml) {
                            tracing::warn!("Failed to write plan cache for \"{}\": {}", prompt, e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to serialize workflow for \"{}\": {}", prompt, e),
                }
            }
        }
        Ok(output)
    }

    async fn replay_cached_plan(
        &self,
        prompt: &str,
        workflow: &str,
    ) -> Result<Option<FlushOutput>, EngineError> {
        let yaml = workflow.to_string();
        let load_task = Task::new(
            TaskKind::Planning,
            "LoadYaml",
            json!({ "userInstruction": prompt }),
        )
        .with_executor(executor_fn(move |_, _| {
            let yaml = yaml.clone();
            async move {
                Ok(TaskReturn {
                    output: Some(json!({ "yamlString": yaml })),
                    cache: Some(TaskCacheHit { hit: true }),
                    hit_by: Some(HitBy::new(HitSource::Cache, json!({ "yamlString": yaml }))),
                    ..Default::default()
                })
            }
        }));

        let mut runner = self.new_runner(format!("Act - {}", prompt));
        let loaded = match runner.append(vec![load_task]) {
            Ok(()) => runner.flush().await,
            Err(e) => Err(e),
        };
        self.record(&runner);
        loaded?;

        tracing::debug!("Replaying cached workflow for \"{}\"", prompt);
        self.run_yaml(workflow).await
    }

    async fn plan_and_run(
        &self,
        runner: &mut TaskRunner,
        prompt: &str,
        cacheable: Option<bool>,
        action_context: Option<String>,
    ) -> Result<(Option<FlushOutput>, Vec<PlanningAction>), EngineError> {
        let builder = self.builder();
        let descriptions: Vec<Value> = builder
            .action_space()
            .iter()
            .map(|action| action.spec().describe())
            .collect();
        let limit = self.config.replanning_cycle_limit;

        let mut executed = Vec::new();
        let mut previous_log: Option<String> = None;
        let mut output;
        let mut cycle = 0;

        loop {
            if cycle >= limit {
                let message = format!(
                    "Replanning too many times (more than {}), split the instruction into smaller steps",
                    limit
                );
                runner.append_error_plan(&message)?;
                return Err(EngineError::Planning(message));
            }
            cycle += 1;

            let planner_context =
                join_context(action_context.clone(), self.short_memory.build_ai_context());
            let slot: Arc<Mutex<Option<Plan>>> = Arc::new(Mutex::new(None));
            let planning_task = self.planning_task(
                prompt,
                descriptions.clone(),
                planner_context,
                previous_log.clone(),
                slot.clone(),
            );
            runner.append(vec![planning_task])?;
            runner.flush().await?;

            let plan = slot.lock().take().ok_or_else(|| {
                EngineError::RunnerState("planning task produced no plan".to_string())
            })?;
            if let Some(error) = plan.error.clone() {
                runner.append_error_plan(&error)?;
                return Err(EngineError::Planning(error));
            }

            let tasks = match builder.build(
                &plan.actions,
                BuildOptions::default().with_cacheable(cacheable),
            ) {
                Ok(tasks) => tasks,
                Err(e) => {
                    runner.append_error_plan(&e.to_string())?;
                    return Err(e);
                }
            };
            runner.append(tasks)?;
            output = runner.flush().await?;
            executed.extend(plan.actions.iter().cloned());

            previous_log = join_context(previous_log, plan.log.clone());
            if !plan.more_actions_needed_by_instruction {
                break;
            }
            tracing::debug!("Planner asked for another round ({}/{})", cycle, limit);
        }

        Ok((output, executed))
    }

    fn planning_task(
        &self,
        prompt: &str,
        action_space: Vec<Value>,
        action_context: Option<String>,
        previous_log: Option<String>,
        slot: Arc<Mutex<Option<Plan>>>,
    ) -> Task {
        let planner = self.planner.clone();
        let device = self.device.clone();
        let instruction = prompt.to_string();
        Task::new(
            TaskKind::Planning,
            "Plan",
            json!({ "userInstruction": prompt }),
        )
        .with_executor(executor_fn(move |_, ctx: ExecutorContext| {
            let planner = planner.clone();
            let device = device.clone();
            let slot = slot.clone();
            let request_parts = (
                instruction.clone(),
                action_space.clone(),
                action_context.clone(),
                previous_log.clone(),
            );
            async move {
                let ui_context = match ctx.ui_context {
                    Some(context) => context,
                    None => device.ui_context().await?,
                };
                let (instruction, action_space, action_context, previous_log) = request_parts;
                let request = PlanRequest::new(instruction, ui_context)
                    .with_action_space(action_space)
                    .with_action_context(action_context)
                    .with_previous_log(previous_log);
                let plan = planner.plan(request).await?;

                let thought = plan.actions.first().and_then(|a| a.thought.clone());
                let returned = TaskReturn {
                    output: Some(serde_json::to_value(&plan)?),
                    log: plan.log.clone().map(Value::String),
                    thought,
                    ..Default::default()
                };
                *slot.lock() = Some(plan);
                Ok(returned)
            }
        }))
    }

    /// Replay a workflow script, one runner per script task.
    pub async fn run_yaml(&self, yaml: &str) -> Result<Option<FlushOutput>, EngineError> {
        let script = WorkflowScript::parse(yaml)?;
        let builder = self.builder();
        let mut output = None;

        for task in &script.tasks {
            let mut runner = self.new_runner(task.name.clone());
            let result = match builder
                .build(&task.flow, BuildOptions::default())
                .and_then(|tasks| runner.append(tasks))
            {
                Ok(()) => runner.flush().await,
                Err(e) => Err(e),
            };
            self.record(&runner);

            match result {
                Ok(flushed) => output = flushed,
                Err(e) if task.continue_on_error => {
                    tracing::warn!("Workflow task '{}' failed, continuing: {}", task.name, e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(output)
    }

    /// Resolve `prompt` to a single element.
    pub async fn ai_locate(
        &self,
        prompt: &str,
        options: LocateOptions,
    ) -> Result<LocateResultElement, EngineError> {
        let mut param = LocateParam::new(prompt);
        param.cacheable = options.cacheable;
        param.deep_think = options.deep_think;

        let tasks = self
            .builder()
            .build(&[PlanningAction::locate(param)], BuildOptions::default())?;
        let mut runner = self.new_runner(format!("Locate - {}", prompt));
        runner.append(tasks)?;
        let result = runner.flush().await;
        self.record(&runner);

        let element = result?
            .and_then(|flushed| flushed.output)
            .and_then(|output| output.get("element").cloned())
            .ok_or_else(|| EngineError::NotFound(prompt.to_string()))?;
        Ok(serde_json::from_value(element)?)
    }

    /// Pre-resolve targets into short memory.
    pub async fn warmup_short_memory(
        &self,
        targets: &[WarmupTarget],
        options: WarmupOptions,
    ) -> Result<Vec<String>, EngineError> {
        self.short_memory.warmup(targets, options).await
    }

    /// Hold one snapshot for every following call. Returns whether this call
    /// established the freeze.
    pub async fn freeze_page_context(&self) -> Result<bool, EngineError> {
        self.source.freeze().await
    }

    pub fn unfreeze_page_context(&self) -> bool {
        self.source.unfreeze()
    }

    /// One dump per runner, in execution order.
    pub fn dumps(&self) -> Vec<ExecutionDump> {
        self.dumps.lock().clone()
    }

    pub fn write_dump(&self, path: &Path) -> Result<(), EngineError> {
        let grouped = GroupedDump {
            group_name: self.config.name.clone(),
            executions: self.dumps(),
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(&grouped)?)?;
        tracing::info!("Execution dump written to {}", path.display());
        Ok(())
    }

    pub fn flush_cache(&self, clean_unused: bool) -> Result<(), EngineError> {
        if let Some(cache) = &self.cache {
            cache.flush(clean_unused)?;
        }
        Ok(())
    }
}
