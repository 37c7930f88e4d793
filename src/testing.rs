//! Recording mocks for the device and AI collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::device::{ActionContext, ActionSpec, Device, DeviceAction, FnAction};
use crate::error::EngineError;
use crate::model::{LocateService, PlanRequest, PlanService};
use crate::types::{
    ElementCacheFeature, LocateParam, LocateResultElement, Plan, Point, Rect, Size, UiContext,
};

/// One action invocation seen by [`MockDevice`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    pub name: String,
    pub param: Value,
    pub point: Option<Point>,
}

#[derive(Default)]
struct DeviceState {
    calls: Vec<ActionCall>,
    feature: Option<ElementCacheFeature>,
    valid_xpaths: HashMap<String, Rect>,
    validation_error: Option<String>,
    failing_action: Option<String>,
    screenshot: String,
}

/// Device whose actions record their calls.
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
    ui_context_calls: AtomicUsize,
    validation_calls: AtomicUsize,
    feature_calls: AtomicUsize,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                screenshot: "c2NyZWVu".to_string(),
                ..Default::default()
            })),
            ui_context_calls: AtomicUsize::new(0),
            validation_calls: AtomicUsize::new(0),
            feature_calls: AtomicUsize::new(0),
        }
    }

    /// Descriptor returned for any point.
    pub fn set_feature(&self, feature: Option<ElementCacheFeature>) {
        self.state.lock().feature = feature;
    }

    /// Make descriptors whose first xpath is `xpath` validate to `rect`.
    pub fn set_valid_xpath(&self, xpath: &str, rect: Rect) {
        self.state.lock().valid_xpaths.insert(xpath.to_string(), rect);
    }

    /// Make validation throw.
    pub fn fail_validation(&self, message: &str) {
        self.state.lock().validation_error = Some(message.to_string());
    }

    pub fn fail_action(&self, name: &str) {
        self.state.lock().failing_action = Some(name.to_string());
    }

    pub fn set_screenshot(&self, screenshot: &str) {
        self.state.lock().screenshot = screenshot.to_string();
    }

    pub fn calls(&self) -> Vec<ActionCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.name).collect()
    }

    pub fn ui_context_calls(&self) -> usize {
        self.ui_context_calls.load(Ordering::SeqCst)
    }

    pub fn validation_calls(&self) -> usize {
        self.validation_calls.load(Ordering::SeqCst)
    }

    pub fn feature_calls(&self) -> usize {
        self.feature_calls.load(Ordering::SeqCst)
    }

    fn recording_action(&self, spec: ActionSpec) -> Arc<dyn DeviceAction> {
        let state = self.state.clone();
        let name = spec.name.clone();
        Arc::new(FnAction::new(spec, move |param: Value, ctx: ActionContext| {
            let state = state.clone();
            let name = name.clone();
            async move {
                let point = ctx.element("locate").map(|element| element.center);
                let mut state = state.lock();
                if state.failing_action.as_deref() == Some(name.as_str()) {
                    return Err(EngineError::Device(format!("{} failed", name)));
                }
                state.calls.push(ActionCall {
                    name: name.clone(),
                    param,
                    point,
                });
                Ok(json!({ "done": name }))
            }
        }))
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for MockDevice {
    fn interface_type(&self) -> &str {
        "mock"
    }

    fn action_space(&self) -> Vec<Arc<dyn DeviceAction>> {
        vec![
            self.recording_action(ActionSpec::new("Tap").with_locate_field("locate", true)),
            self.recording_action(
                ActionSpec::new("Input")
                    .with_locate_field("locate", false)
                    .with_value_field("value", true, "text to type"),
            ),
            self.recording_action(ActionSpec::new("Hover").with_locate_field("locate", true)),
            self.recording_action(ActionSpec::new("RightClick").with_locate_field("locate", true)),
            self.recording_action(ActionSpec::new("DoubleClick").with_locate_field("locate", true)),
            self.recording_action(
                ActionSpec::new("DragAndDrop")
                    .with_locate_field("from", true)
                    .with_locate_field("to", true),
            ),
            self.recording_action(ActionSpec::new("KeyboardPress").with_value_field(
                "keyName",
                true,
                "key to press",
            )),
        ]
    }

    async fn ui_context(&self) -> Result<UiContext, EngineError> {
        self.ui_context_calls.fetch_add(1, Ordering::SeqCst);
        let screenshot = self.state.lock().screenshot.clone();
        Ok(UiContext::new(Size::new(1280.0, 720.0), screenshot))
    }

    async fn cache_feature_for_point(
        &self,
        _point: Point,
    ) -> Result<Option<ElementCacheFeature>, EngineError> {
        self.feature_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().feature.clone())
    }

    async fn rect_matches_cache_feature(
        &self,
        feature: &ElementCacheFeature,
    ) -> Result<Option<Rect>, EngineError> {
        self.validation_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if let Some(message) = &state.validation_error {
            return Err(EngineError::Device(message.clone()));
        }
        let first = feature
            .xpaths
            .as_ref()
            .and_then(|xpaths| xpaths.first());
        Ok(first.and_then(|xpath| state.valid_xpaths.get(xpath).copied()))
    }
}

/// Locate service answering from a prompt table.
#[derive(Default)]
pub struct MockLocator {
    responses: Mutex<HashMap<String, Vec<LocateResultElement>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prompt: &str, elements: Vec<LocateResultElement>) {
        self.responses.lock().insert(prompt.to_string(), elements);
    }

    /// Answer `prompt` with one element centered on `point`.
    pub fn respond_at(&self, prompt: &str, point: Point) {
        let rect = Rect::new(point.0 - 10.0, point.1 - 10.0, 20.0, 20.0);
        self.respond(prompt, vec![LocateResultElement::from_rect(rect)]);
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn answer(&self, prompt: &str) -> Vec<LocateResultElement> {
        self.prompts.lock().push(prompt.to_string());
        self.responses
            .lock()
            .get(prompt)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LocateService for MockLocator {
    async fn locate(
        &self,
        param: &LocateParam,
        _context: &UiContext,
    ) -> Result<Vec<LocateResultElement>, EngineError> {
        Ok(self.answer(&param.prompt))
    }

    async fn locate_all(
        &self,
        prompt: &str,
        _context: &UiContext,
    ) -> Result<Vec<LocateResultElement>, EngineError> {
        Ok(self.answer(prompt))
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}

/// Planner replaying queued plans.
#[derive(Default)]
pub struct MockPlanner {
    plans: Mutex<VecDeque<Plan>>,
    requests: Mutex<Vec<PlanRequest>>,
}

impl MockPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, plan: Plan) {
        self.plans.lock().push_back(plan);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PlanService for MockPlanner {
    async fn plan(&self, request: PlanRequest) -> Result<Plan, EngineError> {
        self.requests.lock().push(request);
        self.plans
            .lock()
            .pop_front()
            .ok_or_else(|| EngineError::Planning("no plan queued".to_string()))
    }
}
