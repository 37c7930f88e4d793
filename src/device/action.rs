//! Action descriptors exposed by a device.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::types::{LocateResultElement, UiContext};

/// How a parameter field is treated by the task builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Names a target that must be resolved to coordinates before the call.
    Locate { required: bool },
    /// Passed through unchanged.
    Value { required: bool },
}

/// One declared parameter of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamField {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
}

impl ParamField {
    pub fn is_locate(&self) -> bool {
        matches!(self.kind, ParamKind::Locate { .. })
    }

    pub fn is_required(&self) -> bool {
        match self.kind {
            ParamKind::Locate { required } | ParamKind::Value { required } => required,
        }
    }
}

/// Action metadata, fixed at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub fields: Vec<ParamField>,
    /// Pause after the call so the interface can settle.
    pub delay_after_ms: Option<u64>,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            fields: Vec::new(),
            delay_after_ms: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare a field that names a target element.
    pub fn with_locate_field(mut self, name: impl Into<String>, required: bool) -> Self {
        self.fields.push(ParamField {
            name: name.into(),
            kind: ParamKind::Locate { required },
            description: String::new(),
        });
        self
    }

    pub fn with_value_field(
        mut self,
        name: impl Into<String>,
        required: bool,
        description: impl Into<String>,
    ) -> Self {
        self.fields.push(ParamField {
            name: name.into(),
            kind: ParamKind::Value { required },
            description: description.into(),
        });
        self
    }

    pub fn with_delay_after_ms(mut self, ms: u64) -> Self {
        self.delay_after_ms = Some(ms);
        self
    }

    pub fn locate_fields(&self) -> impl Iterator<Item = &ParamField> {
        self.fields.iter().filter(|field| field.is_locate())
    }

    /// Summary handed to the planner.
    pub fn describe(&self) -> Value {
        let params: Vec<Value> = self
            .fields
            .iter()
            .map(|field| {
                json!({
                    "name": field.name,
                    "kind": if field.is_locate() { "locate" } else { "value" },
                    "required": field.is_required(),
                    "description": field.description,
                })
            })
            .collect();
        json!({
            "name": self.name,
            "description": self.description,
            "params": params,
        })
    }
}

/// Resolved targets handed to an action.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub task_index: usize,
    pub ui_context: Option<UiContext>,
    /// Locate field name to resolved element.
    pub elements: HashMap<String, LocateResultElement>,
}

impl ActionContext {
    pub fn element(&self, field: &str) -> Option<&LocateResultElement> {
        self.elements.get(field)
    }

    /// The element for `field`, or a `NotFound` error naming the action.
    pub fn require_element(
        &self,
        action: &str,
        field: &str,
    ) -> Result<&LocateResultElement, EngineError> {
        self.element(field)
            .ok_or_else(|| EngineError::NotFound(format!("{}: no element for '{}'", action, field)))
    }
}

/// An executable device action.
#[async_trait]
pub trait DeviceAction: Send + Sync {
    fn spec(&self) -> &ActionSpec;

    async fn call(&self, param: Value, ctx: ActionContext) -> Result<Value, EngineError>;
}

type ActionFn =
    Arc<dyn Fn(Value, ActionContext) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync>;

/// Action backed by an async closure.
pub struct FnAction {
    spec: ActionSpec,
    handler: ActionFn,
}

impl FnAction {
    pub fn new<F, Fut>(spec: ActionSpec, handler: F) -> Self
    where
        F: Fn(Value, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        Self {
            spec,
            handler: Arc::new(move |param, ctx| Box::pin(handler(param, ctx))),
        }
    }
}

#[async_trait]
impl DeviceAction for FnAction {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    async fn call(&self, param: Value, ctx: ActionContext) -> Result<Value, EngineError> {
        (self.handler)(param, ctx).await
    }
}

/// Find an action by name.
pub fn find_action(space: &[Arc<dyn DeviceAction>], name: &str) -> Option<Arc<dyn DeviceAction>> {
    space.iter().find(|action| action.spec().name == name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_locate_fields() {
        let spec = ActionSpec::new("DragAndDrop")
            .with_locate_field("from", true)
            .with_locate_field("to", true)
            .with_value_field("speed", false, "drag speed");
        let names: Vec<&str> = spec.locate_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["from", "to"]);
        assert_eq!(spec.describe()["params"][2]["kind"], "value");
    }

    #[tokio::test]
    async fn test_fn_action_call() {
        let action = FnAction::new(ActionSpec::new("Echo"), |param, _ctx| async move { Ok(param) });
        let out = action
            .call(json!({ "x": 1 }), ActionContext::default())
            .await
            .unwrap();
        assert_eq!(out["x"], 1);
    }

    #[test]
    fn test_require_element_missing() {
        let ctx = ActionContext::default();
        assert!(matches!(
            ctx.require_element("Tap", "locate"),
            Err(EngineError::NotFound(_))
        ));
    }
}
