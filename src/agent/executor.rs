//! Task runner: a sequential, fail-fast state machine over a task list.

use std::sync::Arc;

use serde_json::{json, Value};

use super::context::UiContextSource;
use crate::cache::ENGINE_VERSION;
use crate::error::EngineError;
use crate::types::{
    now_millis, ExecutionDump, ExecutorContext, LocateResultElement, RecorderItem, Task, TaskKind,
    TaskStatus, TaskTiming, UiContext,
};

/// Runner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Init,
    Pending,
    Running,
    Completed,
    Error,
}

/// Notified before each task starts running. Errors are logged and ignored.
pub trait TaskObserver: Send + Sync {
    fn on_task_start(&self, task: &Task) -> Result<(), EngineError>;
}

/// Observer that does nothing.
pub struct NoopObserver;

impl TaskObserver for NoopObserver {
    fn on_task_start(&self, _task: &Task) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Result of the last task run by `flush`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushOutput {
    pub output: Option<Value>,
    pub thought: Option<String>,
}

/// Runs tasks strictly in order.
pub struct TaskRunner {
    name: String,
    model_name: String,
    tasks: Vec<Task>,
    status: RunnerStatus,
    source: Arc<UiContextSource>,
    observer: Arc<dyn TaskObserver>,
}

impl TaskRunner {
    pub fn new(name: impl Into<String>, source: Arc<UiContextSource>) -> Self {
        Self {
            name: name.into(),
            model_name: String::new(),
            tasks: Vec::new(),
            status: RunnerStatus::Init,
            source,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> RunnerStatus {
        self.status
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn is_in_error_state(&self) -> bool {
        self.status == RunnerStatus::Error
    }

    /// Enqueue pending tasks.
    pub fn append(&mut self, tasks: Vec<Task>) -> Result<(), EngineError> {
        if self.status == RunnerStatus::Error {
            return Err(EngineError::RunnerState(
                "task runner is in error state, cannot append task".to_string(),
            ));
        }
        for mut task in tasks {
            task.status = TaskStatus::Pending;
            self.tasks.push(task);
        }
        if self.status != RunnerStatus::Running {
            self.status = RunnerStatus::Pending;
        }
        Ok(())
    }

    /// Run every pending task in order, stopping at the first failure.
    pub async fn flush(&mut self) -> Result<Option<FlushOutput>, EngineError> {
        if self.status == RunnerStatus::Init && !self.tasks.is_empty() {
            tracing::warn!("Task runner '{}' flushed before any append", self.name);
        }
        if matches!(
            self.status,
            RunnerStatus::Running | RunnerStatus::Completed | RunnerStatus::Error
        ) {
            return Err(EngineError::RunnerState(format!(
                "task runner is {:?}, cannot flush",
                self.status
            )));
        }

        self.status = RunnerStatus::Running;
        let Some(start) = self
            .tasks
            .iter()
            .position(|task| task.status == TaskStatus::Pending)
        else {
            self.status = RunnerStatus::Completed;
            return Ok(None);
        };

        let mut previous_element: Option<LocateResultElement> = None;
        let mut previous_after: Option<String> = None;

        for index in start..self.tasks.len() {
            if let Err(error) = self
                .run_task(index, &mut previous_element, &mut previous_after)
                .await
            {
                return Err(self.fail_from(index, error));
            }
        }

        self.status = RunnerStatus::Completed;
        Ok(self.tasks.last().map(|task| FlushOutput {
            output: task.output.clone(),
            thought: task.thought.clone(),
        }))
    }

    async fn run_task(
        &mut self,
        index: usize,
        previous_element: &mut Option<LocateResultElement>,
        previous_after: &mut Option<String>,
    ) -> Result<(), EngineError> {
        self.tasks[index].timing = Some(TaskTiming::started_now());

        let ui_context = self.task_ui_context(index).await?;
        let sub_task = self.tasks[index].sub_task;
        if !sub_task {
            let before = previous_after
                .take()
                .unwrap_or_else(|| ui_context.screenshot_base64.clone());
            self.tasks[index]
                .recorder
                .push(RecorderItem::screenshot(before, "before"));
        }
        self.tasks[index].ui_context = Some(ui_context.clone());

        if let Err(e) = self.observer.on_task_start(&self.tasks[index]) {
            tracing::warn!("Task start observer failed: {}", e);
        }

        self.tasks[index].transition(TaskStatus::Running)?;
        let executor = self.tasks[index].executor.clone().ok_or_else(|| {
            EngineError::RunnerState(format!("task {} has no executor", index))
        })?;

        let context = ExecutorContext {
            task_index: index,
            element: previous_element.take(),
            ui_context: Some(ui_context),
        };
        let returned = executor(self.tasks[index].param.clone(), context).await?;

        let is_locate = self.tasks[index].kind == TaskKind::Locate;
        *previous_element = if is_locate {
            returned.element.clone()
        } else {
            None
        };

        let task = &mut self.tasks[index];
        task.apply_return(returned);
        task.transition(TaskStatus::Finished)?;
        if let Some(timing) = task.timing.as_mut() {
            timing.finish_now();
        }

        if !sub_task {
            match self.source.current().await {
                Ok(after) => {
                    self.tasks[index]
                        .recorder
                        .push(RecorderItem::screenshot(after.screenshot_base64.clone(), "after"));
                    *previous_after = Some(after.screenshot_base64);
                }
                Err(e) => tracing::warn!("Failed to capture screenshot after task {}: {}", index, e),
            }
        }
        Ok(())
    }

    /// Sub-tasks reuse the context of the nearest previous non-sub-task.
    async fn task_ui_context(&self, index: usize) -> Result<UiContext, EngineError> {
        if !self.tasks[index].sub_task {
            return self.source.current().await;
        }
        self.tasks[..index]
            .iter()
            .rev()
            .find(|task| !task.sub_task)
            .and_then(|task| task.ui_context.clone())
            .ok_or_else(|| {
                EngineError::RunnerState(format!(
                    "sub-task {} has no preceding task with a UI context",
                    index
                ))
            })
    }

    /// Mark task `index` failed, cancel everything after it, enter the error state.
    fn fail_from(&mut self, index: usize, error: EngineError) -> EngineError {
        let task = &mut self.tasks[index];
        tracing::error!("Task {} ({}) failed: {}", index, task.sub_type, error);

        task.error = Some(error.to_string());
        task.error_stack = Some(error.stack());
        if task.status == TaskStatus::Pending {
            let _ = task.transition(TaskStatus::Running);
        }
        let _ = task.transition(TaskStatus::Failed);
        if let Some(timing) = task.timing.as_mut() {
            timing.finish_now();
        }
        let sub_type = task.sub_type.clone();

        for later in self.tasks.iter_mut().skip(index + 1) {
            if later.status == TaskStatus::Pending {
                let _ = later.transition(TaskStatus::Cancelled);
            }
        }
        self.status = RunnerStatus::Error;

        EngineError::TaskExecutionFailed {
            index,
            sub_type,
            message: error.to_string(),
        }
    }

    /// Record a planning failure without running anything.
    pub fn append_error_plan(&mut self, message: &str) -> Result<(), EngineError> {
        let mut task = Task::new(TaskKind::Planning, "Plan", json!({ "userInstruction": "" }));
        let mut timing = TaskTiming::started_now();
        timing.finish_now();
        task.timing = Some(timing);
        task.error = Some(message.to_string());
        task.error_stack = Some(message.to_string());
        task.transition(TaskStatus::Running)?;
        task.transition(TaskStatus::Failed)?;
        self.tasks.push(task);
        self.status = RunnerStatus::Error;
        Ok(())
    }

    /// The most recent failed task.
    pub fn latest_error_task(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .rev()
            .find(|task| task.status == TaskStatus::Failed)
    }

    pub fn dump(&self) -> ExecutionDump {
        ExecutionDump {
            sdk_version: ENGINE_VERSION.to_string(),
            model_name: self.model_name.clone(),
            log_time: now_millis(),
            name: self.name.clone(),
            tasks: self.tasks.clone(),
        }
    }
}
