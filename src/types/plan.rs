//! Planner output: ordered, typed actions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::EngineError;

/// Description of a target element, optionally with a planner-supplied box.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocateParam {
    #[serde(default)]
    pub prompt: String,
    /// `[x1, y1, x2, y2]` when the planner already knows where the target is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_think: Option<bool>,
    /// `Some(false)` disables every cache read and write for this target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacheable: Option<bool>,
}

impl LocateParam {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_bbox(mut self, bbox: [f64; 4]) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = Some(cacheable);
        self
    }

    pub fn with_deep_think(mut self, deep_think: bool) -> Self {
        self.deep_think = Some(deep_think);
        self
    }

    /// Parse a locate field, which may be a bare description or an object.
    pub fn from_value(value: &Value) -> Result<Self, EngineError> {
        match value {
            Value::String(prompt) => Ok(Self::new(prompt.clone())),
            Value::Object(_) => Ok(serde_json::from_value(value.clone())?),
            other => Err(EngineError::InvalidParam(format!(
                "locate param must be a string or an object, got {}",
                other
            ))),
        }
    }

    /// Nothing to resolve: no description and no box.
    pub fn is_empty(&self) -> bool {
        self.prompt.trim().is_empty() && self.bbox.is_none()
    }

    /// Whether cache reads and writes are allowed. Defaults to allowed.
    pub fn cache_allowed(&self) -> bool {
        self.cacheable != Some(false)
    }
}

impl From<&str> for LocateParam {
    fn from(prompt: &str) -> Self {
        Self::new(prompt)
    }
}

/// A single planned step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub param: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    /// Target of a standalone `Locate` step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locate: Option<LocateParam>,
}

impl PlanningAction {
    pub fn new(action_type: impl Into<String>, param: Value) -> Self {
        Self {
            action_type: action_type.into(),
            param,
            thought: None,
            locate: None,
        }
    }

    /// A standalone locate step.
    pub fn locate(param: LocateParam) -> Self {
        Self {
            action_type: "Locate".to_string(),
            param: serde_json::to_value(&param).unwrap_or(Value::Null),
            thought: None,
            locate: Some(param),
        }
    }

    pub fn sleep(time_ms: u64) -> Self {
        Self::new("Sleep", json!({ "timeMs": time_ms }))
    }

    pub fn finished() -> Self {
        Self::new("Finished", Value::Null)
    }

    pub fn error(thought: impl Into<String>) -> Self {
        let thought = thought.into();
        Self::new("Error", json!({ "thought": thought })).with_thought(thought)
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    /// Step-level `cacheable` flag carried in the param object.
    pub fn cacheable(&self) -> Option<bool> {
        self.param.get("cacheable").and_then(|v| v.as_bool())
    }
}

/// One planning round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub actions: Vec<PlanningAction>,
    #[serde(default)]
    pub more_actions_needed_by_instruction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Plan {
    pub fn new(actions: Vec<PlanningAction>) -> Self {
        Self {
            actions,
            ..Default::default()
        }
    }

    pub fn with_more_actions(mut self, more: bool) -> Self {
        self.more_actions_needed_by_instruction = more;
        self
    }
}
