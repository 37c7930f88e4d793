//! Task Builder: plans to executable tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::resolver::{resolution_output, LocateResolver};
use crate::device::{find_action, ActionContext, Device, DeviceAction};
use crate::error::EngineError;
use crate::types::{
    executor_fn, ExecutorContext, LocateParam, LocateResultElement, PlanningAction, Task,
    TaskCacheHit, TaskKind, TaskReturn,
};

/// Build-wide options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// `Some(false)` disables caching for every derived locate task.
    pub cacheable: Option<bool>,
}

impl BuildOptions {
    pub fn with_cacheable(mut self, cacheable: Option<bool>) -> Self {
        self.cacheable = cacheable;
        self
    }
}

/// Pause used when a `Sleep` step has no positive `timeMs`.
const DEFAULT_SLEEP_MS: u64 = 3000;

fn sleep_duration(param: &Value) -> Duration {
    let time_ms = param
        .get("timeMs")
        .and_then(Value::as_u64)
        .filter(|ms| *ms > 0)
        .unwrap_or(DEFAULT_SLEEP_MS);
    Duration::from_millis(time_ms)
}

type ElementSlots = Arc<Mutex<HashMap<String, LocateResultElement>>>;

/// Explicit `false` anywhere wins; otherwise the first explicit value.
fn merge_cacheable(flags: &[Option<bool>]) -> Option<bool> {
    if flags.contains(&Some(false)) {
        return Some(false);
    }
    flags.iter().flatten().next().copied()
}

/// Converts planned actions into tasks wired to the resolver and device.
pub struct TaskBuilder {
    device: Arc<dyn Device>,
    resolver: Arc<LocateResolver>,
    action_space: Vec<Arc<dyn DeviceAction>>,
}

impl TaskBuilder {
    pub fn new(
        device: Arc<dyn Device>,
        resolver: Arc<LocateResolver>,
        action_space: Vec<Arc<dyn DeviceAction>>,
    ) -> Self {
        Self {
            device,
            resolver,
            action_space,
        }
    }

    pub fn action_space(&self) -> &[Arc<dyn DeviceAction>] {
        &self.action_space
    }

    /// Build tasks for `plan` in order.
    pub fn build(
        &self,
        plan: &[PlanningAction],
        options: BuildOptions,
    ) -> Result<Vec<Task>, EngineError> {
        let mut tasks = Vec::new();
        for action in plan {
            let step_cacheable = merge_cacheable(&[options.cacheable, action.cacheable()]);
            match action.action_type.as_str() {
                "Locate" => {
                    let mut param = match &action.locate {
                        Some(param) => param.clone(),
                        None => LocateParam::from_value(&action.param)?,
                    };
                    param.cacheable = merge_cacheable(&[step_cacheable, param.cacheable]);
                    tasks.push(
                        self.locate_task(param, None)
                            .with_thought(action.thought.clone()),
                    );
                }
                "Finished" => tasks.push(
                    Task::new(TaskKind::Action, "Finished", action.param.clone())
                        .with_thought(action.thought.clone())
                        .with_executor(executor_fn(|_, _| async { Ok(TaskReturn::default()) })),
                ),
                "Error" => {
                    let message = action
                        .thought
                        .clone()
                        .or_else(|| {
                            action
                                .param
                                .get("thought")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                        .unwrap_or_else(|| "planner reported an error".to_string());
                    tasks.push(
                        Task::new(TaskKind::Action, "Error", action.param.clone())
                            .with_thought(action.thought.clone())
                            .with_executor(executor_fn(move |_, _| {
                                let message = message.clone();
                                async move { Err(EngineError::Planning(message)) }
                            })),
                    );
                }
                "Sleep" => {
                    let duration = sleep_duration(&action.param);
                    tasks.push(
                        Task::new(TaskKind::Action, "Sleep", action.param.clone())
                            .with_thought(action.thought.clone())
                            .with_executor(executor_fn(move |_, _| async move {
                                tokio::time::sleep(duration).await;
                                Ok(TaskReturn::default())
                            })),
                    );
                }
                name => {
                    let device_action = find_action(&self.action_space, name)
                        .ok_or_else(|| EngineError::ActionNotFound(name.to_string()))?;
                    tasks.extend(self.action_tasks(action, device_action, step_cacheable)?);
                }
            }
        }
        Ok(tasks)
    }

    /// One locate task per present locate field, then the action itself.
    fn action_tasks(
        &self,
        action: &PlanningAction,
        device_action: Arc<dyn DeviceAction>,
        step_cacheable: Option<bool>,
    ) -> Result<Vec<Task>, EngineError> {
        let spec = device_action.spec().clone();
        let slots: ElementSlots = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = Vec::new();
        let mut locate_fields = Vec::new();

        for field in spec.locate_fields() {
            let value = action.param.get(&field.name).filter(|v| !v.is_null());
            let Some(value) = value else {
                if field.is_required() {
                    return Err(EngineError::InvalidParam(format!(
                        "{}: missing required locate field '{}'",
                        spec.name, field.name
                    )));
                }
                continue;
            };
            let mut param = LocateParam::from_value(value)?;
            if param.is_empty() {
                if field.is_required() {
                    return Err(EngineError::InvalidParam(format!(
                        "{}: locate field '{}' is empty",
                        spec.name, field.name
                    )));
                }
                continue;
            }
            param.cacheable = merge_cacheable(&[step_cacheable, param.cacheable]);
            tasks.push(self.locate_task(param, Some((field.name.clone(), slots.clone()))));
            locate_fields.push(field.name.clone());
        }

        let device = self.device.clone();
        let name = spec.name.clone();
        let executor = executor_fn(move |param: Value, ctx: ExecutorContext| {
            let device = device.clone();
            let device_action = device_action.clone();
            let slots = slots.clone();
            let locate_fields = locate_fields.clone();
            let name = name.clone();
            async move {
                let mut elements = slots.lock().clone();
                if let (Some(first), Some(element)) = (locate_fields.first(), ctx.element) {
                    elements.entry(first.clone()).or_insert(element);
                }
                let action_context = ActionContext {
                    task_index: ctx.task_index,
                    ui_context: ctx.ui_context,
                    elements,
                };

                device.before_invoke_action(&name, &param).await?;
                let output = device_action.call(param.clone(), action_context).await?;
                device.after_invoke_action(&name, &param).await?;

                if let Some(delay) = device_action.spec().delay_after_ms {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Ok(TaskReturn::with_output(output))
            }
        });

        tasks.push(
            Task::new(TaskKind::Action, spec.name.clone(), action.param.clone())
                .with_thought(action.thought.clone())
                .with_executor(executor),
        );
        Ok(tasks)
    }

    /// A locate task resolving `param`; stores its element in `slot` when given.
    fn locate_task(&self, param: LocateParam, slot: Option<(String, ElementSlots)>) -> Task {
        let resolver = self.resolver.clone();
        let device = self.device.clone();
        let task_param = serde_json::to_value(&param).unwrap_or(Value::Null);
        let executor = executor_fn(move |_, ctx: ExecutorContext| {
            let resolver = resolver.clone();
            let device = device.clone();
            let param = param.clone();
            let slot = slot.clone();
            async move {
                let ui_context = match ctx.ui_context {
                    Some(context) => context,
                    None => device.ui_context().await?,
                };
                let resolution = resolver.resolve(&param, &ui_context).await?;
                if let Some((field, slots)) = &slot {
                    slots.lock().insert(field.clone(), resolution.element.clone());
                }
                Ok(TaskReturn {
                    output: Some(resolution_output(&resolution)),
                    log: Some(json!({ "prompt": param.prompt })),
                    cache: Some(TaskCacheHit {
                        hit: resolution.from_cache(),
                    }),
                    hit_by: Some(resolution.hit_by.clone()),
                    element: Some(resolution.element),
                    ..Default::default()
                })
            }
        });
        Task::new(TaskKind::Locate, "Locate", task_param).with_executor(executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TaskCache;
    use crate::testing::{MockDevice, MockLocator};
    use crate::types::{ElementCacheFeature, HitSource, Rect, UiContext};

    struct Fixture {
        device: Arc<MockDevice>,
        locator: Arc<MockLocator>,
        cache: Arc<TaskCache>,
        builder: TaskBuilder,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(MockDevice::new());
        let locator = Arc::new(MockLocator::new());
        let cache = Arc::new(TaskCache::in_memory("builder").unwrap());
        let resolver = Arc::new(LocateResolver::new(
            device.clone(),
            locator.clone(),
            Some(cache.clone()),
        ));
        let builder = TaskBuilder::new(device.clone(), resolver, device.action_space());
        Fixture {
            device,
            locator,
            cache,
            builder,
        }
    }

    async fn run_all(tasks: Vec<Task>, context: UiContext) -> Vec<TaskReturn> {
        let mut previous = None;
        let mut returns = Vec::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let executor = task.executor.clone().unwrap();
            let ctx = ExecutorContext {
                task_index: index,
                element: previous.take(),
                ui_context: Some(context.clone()),
            };
            let returned = executor(task.param.clone(), ctx).await.unwrap();
            previous = returned.element.clone();
            returns.push(returned);
        }
        returns
    }

    #[test]
    fn test_sleep_defaults_when_time_missing() {
        let f = fixture();
        let plan = vec![PlanningAction::new("Sleep", json!({}))];
        let tasks = f.builder.build(&plan, BuildOptions::default()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].sub_type, "Sleep");

        assert_eq!(sleep_duration(&json!({})), Duration::from_millis(3000));
        assert_eq!(sleep_duration(&json!({ "timeMs": 0 })), Duration::from_millis(3000));
        assert_eq!(sleep_duration(&json!({ "timeMs": 250 })), Duration::from_millis(250));
    }

    #[test]
    fn test_merge_cacheable() {
        assert_eq!(merge_cacheable(&[None, None]), None);
        assert_eq!(merge_cacheable(&[Some(true), Some(false)]), Some(false));
        assert_eq!(merge_cacheable(&[None, Some(true)]), Some(true));
    }

    #[test]
    fn test_locate_task_precedes_action() {
        let f = fixture();
        let plan = vec![PlanningAction::new("Tap", json!({ "locate": "OK" }))];
        let tasks = f.builder.build(&plan, BuildOptions::default()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].kind, TaskKind::Locate);
        assert_eq!(tasks[0].param["prompt"], "OK");
        assert_eq!(tasks[1].kind, TaskKind::Action);
        assert_eq!(tasks[1].sub_type, "Tap");
    }

    #[test]
    fn test_optional_locate_field_skipped() {
        let f = fixture();
        let plan = vec![PlanningAction::new("Input", json!({ "value": "hi" }))];
        let tasks = f.builder.build(&plan, BuildOptions::default()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].sub_type, "Input");
    }

    #[test]
    fn test_missing_required_locate_field() {
        let f = fixture();
        let plan = vec![PlanningAction::new("Tap", json!({}))];
        assert!(matches!(
            f.builder.build(&plan, BuildOptions::default()),
            Err(EngineError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_unknown_action() {
        let f = fixture();
        let plan = vec![PlanningAction::new("Teleport", json!({}))];
        assert!(matches!(
            f.builder.build(&plan, BuildOptions::default()),
            Err(EngineError::ActionNotFound(name)) if name == "Teleport"
        ));
    }

    #[test]
    fn test_cacheable_false_propagates_to_every_locate() {
        let f = fixture();
        let plan = vec![PlanningAction::new(
            "DragAndDrop",
            json!({ "from": "card", "to": { "prompt": "column", "cacheable": true }, "cacheable": false }),
        )];
        let tasks = f.builder.build(&plan, BuildOptions::default()).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].param["cacheable"], false);
        assert_eq!(tasks[1].param["cacheable"], false);

        let tasks = f
            .builder
            .build(
                &[PlanningAction::new("Tap", json!({ "locate": "OK" }))],
                BuildOptions::default().with_cacheable(Some(false)),
            )
            .unwrap();
        assert_eq!(tasks[0].param["cacheable"], false);
    }

    #[tokio::test]
    async fn test_cacheable_false_chain_never_uses_cache() {
        let f = fixture();
        f.cache
            .write_locate_cache("OK", Some(ElementCacheFeature::from_xpaths(vec!["/b".to_string()])))
            .unwrap();
        f.device.set_valid_xpath("/b", Rect::new(0.0, 0.0, 10.0, 10.0));
        f.device.set_feature(Some(ElementCacheFeature::from_xpaths(vec!["/c".to_string()])));
        f.locator.respond_at("OK", (40.0, 40.0));

        let plan = vec![PlanningAction::new("Tap", json!({ "locate": "OK" }))];
        let tasks = f
            .builder
            .build(&plan, BuildOptions::default().with_cacheable(Some(false)))
            .unwrap();
        let context = f.device.ui_context().await.unwrap();
        let returns = run_all(tasks, context).await;

        assert_eq!(returns[0].hit_by.as_ref().unwrap().from, HitSource::Ai);
        assert_eq!(f.device.validation_calls(), 0);
        assert_eq!(f.device.feature_calls(), 0);
        assert_eq!(f.device.calls()[0].point, Some((40.0, 40.0)));
    }

    #[tokio::test]
    async fn test_bbox_step_taps_without_model() {
        let f = fixture();
        let plan = vec![PlanningAction::new(
            "Tap",
            json!({ "locate": { "prompt": "OK", "bbox": [0, 0, 20, 10] } }),
        )];
        let tasks = f.builder.build(&plan, BuildOptions::default()).unwrap();
        let context = f.device.ui_context().await.unwrap();
        let returns = run_all(tasks, context).await;

        assert_eq!(returns[0].hit_by.as_ref().unwrap().from, HitSource::Plan);
        assert_eq!(f.locator.calls(), 0);
        assert_eq!(f.device.calls()[0].point, Some((10.0, 5.0)));
    }

    #[tokio::test]
    async fn test_two_locate_fields_fill_their_slots() {
        let f = fixture();
        f.locator.respond_at("card", (10.0, 10.0));
        f.locator.respond_at("column", (300.0, 10.0));
        let plan = vec![PlanningAction::new(
            "DragAndDrop",
            json!({ "from": "card", "to": "column" }),
        )];
        let tasks = f.builder.build(&plan, BuildOptions::default()).unwrap();
        let context = f.device.ui_context().await.unwrap();
        run_all(tasks, context).await;

        assert_eq!(f.locator.prompts(), vec!["card".to_string(), "column".to_string()]);
        assert_eq!(f.device.call_names(), vec!["DragAndDrop".to_string()]);
    }

    #[tokio::test]
    async fn test_error_step_fails() {
        let f = fixture();
        let tasks = f
            .builder
            .build(&[PlanningAction::error("cannot find login")], BuildOptions::default())
            .unwrap();
        let executor = tasks[0].executor.clone().unwrap();
        let result = executor(Value::Null, ExecutorContext::default()).await;
        assert!(matches!(result, Err(EngineError::Planning(msg)) if msg == "cannot find login"));
    }
}
