//! AI collaborator contracts.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::types::{LocateParam, LocateResultElement, Plan, UiContext};

/// Resolves textual target descriptions to elements.
#[async_trait]
pub trait LocateService: Send + Sync {
    /// Elements matching `param`. Callers decide how many are acceptable.
    async fn locate(
        &self,
        param: &LocateParam,
        context: &UiContext,
    ) -> Result<Vec<LocateResultElement>, EngineError>;

    /// Every match of `prompt`, in discovery order.
    async fn locate_all(
        &self,
        prompt: &str,
        context: &UiContext,
    ) -> Result<Vec<LocateResultElement>, EngineError>;

    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// Input to one planning round.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub instruction: String,
    pub ui_context: UiContext,
    /// `ActionSpec::describe()` for each available action.
    pub action_space: Vec<Value>,
    /// Extra context such as a failed cached replay.
    pub action_context: Option<String>,
    /// Log returned by the previous round.
    pub previous_log: Option<String>,
}

impl PlanRequest {
    pub fn new(instruction: impl Into<String>, ui_context: UiContext) -> Self {
        Self {
            instruction: instruction.into(),
            ui_context,
            action_space: Vec::new(),
            action_context: None,
            previous_log: None,
        }
    }

    pub fn with_action_space(mut self, action_space: Vec<Value>) -> Self {
        self.action_space = action_space;
        self
    }

    pub fn with_action_context(mut self, context: Option<String>) -> Self {
        self.action_context = context;
        self
    }

    pub fn with_previous_log(mut self, log: Option<String>) -> Self {
        self.previous_log = log;
        self
    }
}

/// Turns an instruction into typed actions.
#[async_trait]
pub trait PlanService: Send + Sync {
    async fn plan(&self, request: PlanRequest) -> Result<Plan, EngineError>;
}
