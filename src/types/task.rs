//! Task records produced by the builder and mutated by the runner.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::element::{LocateResultElement, UiContext};
use crate::error::EngineError;

/// Task category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Planning,
    /// Report renderers know locate tasks as `Insight`.
    #[serde(rename = "Insight")]
    Locate,
    Action,
}

/// Task lifecycle. `Finished`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Finished)
                | (Self::Running, Self::Failed)
        )
    }
}

/// Start/end timestamps in epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTiming {
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<i64>,
}

impl TaskTiming {
    pub fn started_now() -> Self {
        Self {
            start: now_millis(),
            end: None,
            cost: None,
        }
    }

    pub fn finish_now(&mut self) {
        let end = now_millis();
        self.end = Some(end);
        self.cost = Some(end - self.start);
    }
}

/// Which resolution path produced an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitSource {
    #[serde(rename = "Planning")]
    Plan,
    Cache,
    #[serde(rename = "AI model")]
    Ai,
}

/// Provenance of a task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitBy {
    pub from: HitSource,
    #[serde(default)]
    pub context: Value,
}

impl HitBy {
    pub fn new(from: HitSource, context: Value) -> Self {
        Self { from, context }
    }
}

/// Cache usage marker on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCacheHit {
    pub hit: bool,
}

/// Screenshot captured around a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    pub screenshot: String,
    pub timing: String,
}

impl RecorderItem {
    pub fn screenshot(screenshot: impl Into<String>, timing: &str) -> Self {
        Self {
            kind: "screenshot".to_string(),
            ts: now_millis(),
            screenshot: screenshot.into(),
            timing: timing.to_string(),
        }
    }
}

/// What an executor function hands back to the runner.
#[derive(Debug, Clone, Default)]
pub struct TaskReturn {
    pub output: Option<Value>,
    pub log: Option<Value>,
    pub recorder: Vec<RecorderItem>,
    pub cache: Option<TaskCacheHit>,
    pub hit_by: Option<HitBy>,
    pub thought: Option<String>,
    /// Element found by a locate task, offered to the next task.
    pub element: Option<LocateResultElement>,
}

impl TaskReturn {
    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Default::default()
        }
    }
}

/// Context passed to an executor function.
#[derive(Debug, Clone, Default)]
pub struct ExecutorContext {
    pub task_index: usize,
    /// Element produced by the preceding locate task, if any.
    pub element: Option<LocateResultElement>,
    pub ui_context: Option<UiContext>,
}

pub type ExecutorFn = Arc<
    dyn Fn(Value, ExecutorContext) -> BoxFuture<'static, Result<TaskReturn, EngineError>>
        + Send
        + Sync,
>;

/// Box an async closure into an [`ExecutorFn`].
pub fn executor_fn<F, Fut>(f: F) -> ExecutorFn
where
    F: Fn(Value, ExecutorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskReturn, EngineError>> + Send + 'static,
{
    Arc::new(move |param, context| Box::pin(f(param, context)))
}

/// One step of execution.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub sub_type: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub sub_task: bool,
    pub param: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TaskTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recorder: Vec<RecorderItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<TaskCacheHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_by: Option<HitBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    #[serde(skip)]
    pub ui_context: Option<UiContext>,
    #[serde(skip)]
    pub executor: Option<ExecutorFn>,
}

impl Task {
    pub fn new(kind: TaskKind, sub_type: impl Into<String>, param: Value) -> Self {
        Self {
            kind,
            sub_type: sub_type.into(),
            sub_task: false,
            param,
            thought: None,
            status: TaskStatus::Pending,
            timing: None,
            output: None,
            log: None,
            recorder: Vec::new(),
            cache: None,
            hit_by: None,
            error: None,
            error_stack: None,
            ui_context: None,
            executor: None,
        }
    }

    pub fn with_executor(mut self, executor: ExecutorFn) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_thought(mut self, thought: Option<String>) -> Self {
        self.thought = thought;
        self
    }

    pub fn as_sub_task(mut self) -> Self {
        self.sub_task = true;
        self
    }

    /// Move to `next`, rejecting transitions out of terminal states.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::RunnerState(format!(
                "illegal task status transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Merge an executor result into the record.
    pub fn apply_return(&mut self, returned: TaskReturn) {
        if returned.output.is_some() {
            self.output = returned.output;
        }
        if returned.log.is_some() {
            self.log = returned.log;
        }
        self.recorder.extend(returned.recorder);
        if returned.cache.is_some() {
            self.cache = returned.cache;
        }
        if returned.hit_by.is_some() {
            self.hit_by = returned.hit_by;
        }
        if returned.thought.is_some() {
            self.thought = returned.thought;
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("sub_type", &self.sub_type)
            .field("status", &self.status)
            .field("param", &self.param)
            .field("hit_by", &self.hit_by)
            .field("error", &self.error)
            .finish()
    }
}

/// Serializable record of one runner, consumed by report renderers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDump {
    pub sdk_version: String,
    pub model_name: String,
    pub log_time: i64,
    pub name: String,
    pub tasks: Vec<Task>,
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Finished.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Finished));
    }

    #[test]
    fn test_transition_rejects_terminal_exit() {
        let mut task = Task::new(TaskKind::Action, "Tap", Value::Null);
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Finished).unwrap();
        assert!(task.transition(TaskStatus::Failed).is_err());
        assert_eq!(task.status, TaskStatus::Finished);
    }

    #[test]
    fn test_task_serializes_report_field_names() {
        let mut task = Task::new(TaskKind::Locate, "Locate", json!({ "prompt": "OK" }));
        task.hit_by = Some(HitBy::new(HitSource::Ai, json!({ "prompt": "OK" })));
        task.error_stack = Some("stack".to_string());
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "Insight");
        assert_eq!(value["subType"], "Locate");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["hitBy"]["from"], "AI model");
        assert_eq!(value["errorStack"], "stack");
        assert!(value.get("subTask").is_none());
    }

    #[test]
    fn test_dump_field_names() {
        let dump = ExecutionDump {
            sdk_version: "0.1.0".to_string(),
            model_name: "m".to_string(),
            log_time: 1,
            name: "run".to_string(),
            tasks: vec![],
        };
        let value = serde_json::to_value(&dump).unwrap();
        for key in ["sdkVersion", "modelName", "logTime", "name", "tasks"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_timing_cost() {
        let mut timing = TaskTiming::started_now();
        timing.finish_now();
        assert!(timing.cost.unwrap() >= 0);
    }
}
