//! Short memory: pre-resolved token to point table and token-addressed actions.
//!
//! Tokens are valid for one UI snapshot only. Nothing detects when the
//! interface changes; callers clear or re-warm explicitly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::context::UiContextSource;
use crate::device::{find_action, ActionContext, ActionSpec, Device, DeviceAction};
use crate::error::EngineError;
use crate::model::LocateService;
use crate::types::{LocateParam, LocateResultElement, Point, UiContext};

static GROUPED_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)#(\d+)$").expect("grouped token pattern is valid"));

/// How many matches a warmup target resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupMode {
    #[default]
    Single,
    All,
}

/// A description to pre-resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WarmupTarget {
    Prompt(String),
    Detailed {
        prompt: String,
        #[serde(default)]
        mode: WarmupMode,
    },
}

impl WarmupTarget {
    pub fn single(prompt: impl Into<String>) -> Self {
        Self::Prompt(prompt.into())
    }

    pub fn all(prompt: impl Into<String>) -> Self {
        Self::Detailed {
            prompt: prompt.into(),
            mode: WarmupMode::All,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            Self::Prompt(prompt) | Self::Detailed { prompt, .. } => prompt,
        }
    }

    pub fn mode(&self) -> WarmupMode {
        match self {
            Self::Prompt(_) => WarmupMode::Single,
            Self::Detailed { mode, .. } => *mode,
        }
    }
}

impl From<&str> for WarmupTarget {
    fn from(prompt: &str) -> Self {
        Self::single(prompt)
    }
}

/// Warmup options.
#[derive(Debug, Clone)]
pub struct WarmupOptions {
    /// Replace the table instead of merging into it.
    pub clear_short_memory: bool,
    /// Resolve every target against one held snapshot.
    pub freeze_context: bool,
    /// Concurrent single-target locate calls. `None` runs them all at once.
    pub concurrency: Option<usize>,
    /// Resolve against this snapshot instead of capturing one.
    pub ui_context: Option<UiContext>,
}

impl Default for WarmupOptions {
    fn default() -> Self {
        Self {
            clear_short_memory: true,
            freeze_context: true,
            concurrency: None,
            ui_context: None,
        }
    }
}

impl WarmupOptions {
    pub fn with_clear_short_memory(mut self, clear: bool) -> Self {
        self.clear_short_memory = clear;
        self
    }

    pub fn with_freeze_context(mut self, freeze: bool) -> Self {
        self.freeze_context = freeze;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    pub fn with_ui_context(mut self, context: UiContext) -> Self {
        self.ui_context = Some(context);
        self
    }
}

/// Default pause between taps, longer for bigger batches.
pub fn default_tap_interval_ms(count: usize) -> u64 {
    match count {
        n if n >= 12 => 200,
        n if n >= 6 => 150,
        _ => 80,
    }
}

/// Token to point table with bulk warmup.
pub struct ShortMemoryManager {
    points: RwLock<IndexMap<String, Point>>,
    source: Arc<UiContextSource>,
    locator: Arc<dyn LocateService>,
}

impl ShortMemoryManager {
    pub fn new(source: Arc<UiContextSource>, locator: Arc<dyn LocateService>) -> Self {
        Self {
            points: RwLock::new(IndexMap::new()),
            source,
            locator,
        }
    }

    pub fn points(&self) -> IndexMap<String, Point> {
        self.points.read().clone()
    }

    pub fn set_points(&self, points: IndexMap<String, Point>) {
        *self.points.write() = points;
    }

    pub fn get(&self, token: &str) -> Option<Point> {
        self.points.read().get(token).copied()
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }

    /// Drop every token. Returns how many were held.
    pub fn clear(&self) -> usize {
        let mut points = self.points.write();
        let cleared = points.len();
        points.clear();
        cleared
    }

    /// Resolve `targets` once and store their centers as tokens.
    ///
    /// Single targets are stored under their prompt; `all` targets under
    /// `<prompt>#1`, `<prompt>#2`, ... in discovery order. The table is only
    /// updated when every locate call succeeds.
    pub async fn warmup(
        &self,
        targets: &[WarmupTarget],
        options: WarmupOptions,
    ) -> Result<Vec<String>, EngineError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut owned_freeze = false;
        let context = match options.ui_context.clone() {
            Some(context) => context,
            None if options.freeze_context => {
                owned_freeze = self.source.freeze().await?;
                self.source.current().await?
            }
            None => self.source.current().await?,
        };

        let resolved = self.resolve_targets(targets, &context, options.concurrency).await;
        if owned_freeze {
            self.source.unfreeze();
        }
        let resolved = resolved?;

        let mut points = if options.clear_short_memory {
            IndexMap::new()
        } else {
            self.points()
        };
        let tokens: Vec<String> = resolved.iter().map(|(token, _)| token.clone()).collect();
        points.extend(resolved);
        self.set_points(points);

        tracing::debug!("Short memory warmed with {} tokens", tokens.len());
        Ok(tokens)
    }

    async fn resolve_targets(
        &self,
        targets: &[WarmupTarget],
        context: &UiContext,
        concurrency: Option<usize>,
    ) -> Result<Vec<(String, Point)>, EngineError> {
        let singles: Vec<String> = targets
            .iter()
            .filter(|target| target.mode() == WarmupMode::Single)
            .map(|target| target.prompt().to_string())
            .collect();
        let limit = concurrency.unwrap_or(singles.len()).max(1);

        let single_results: Vec<(String, Vec<LocateResultElement>)> = stream::iter(singles)
            .map(|prompt| {
                let locator = self.locator.clone();
                let context = context.clone();
                async move {
                    let found = locator.locate(&LocateParam::new(prompt.as_str()), &context).await?;
                    Ok::<_, EngineError>((prompt, found))
                }
                .boxed()
            })
            .buffered(limit)
            .try_collect()
            .await?;

        let mut resolved = Vec::new();
        for (prompt, mut found) in single_results {
            match found.len() {
                0 => tracing::warn!("Warmup could not locate \"{}\", skipping token", prompt),
                1 => {
                    let element = found.remove(0);
                    resolved.push((prompt, element.center));
                }
                count => return Err(EngineError::MultipleElementsFound { prompt, count }),
            }
        }

        for target in targets.iter().filter(|t| t.mode() == WarmupMode::All) {
            let found = self.locator.locate_all(target.prompt(), context).await?;
            if found.is_empty() {
                tracing::warn!("Warmup found no matches for \"{}\"", target.prompt());
            }
            for (index, element) in found.into_iter().enumerate() {
                resolved.push((format!("{}#{}", target.prompt(), index + 1), element.center));
            }
        }
        Ok(resolved)
    }

    /// Planner-facing summary of the available tokens.
    pub fn build_ai_context(&self) -> Option<String> {
        let points = self.points.read();
        if points.is_empty() {
            return None;
        }

        let mut groups: IndexMap<String, Vec<u64>> = IndexMap::new();
        let mut ungrouped = Vec::new();
        for token in points.keys() {
            let index = GROUPED_TOKEN
                .captures(token)
                .and_then(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str().parse::<u64>().ok()?)));
            match index {
                Some((base, n)) => groups.entry(base.to_string()).or_default().push(n),
                None => ungrouped.push(token.as_str()),
            }
        }

        let mut lines = vec![
            "[ShortMemory] These targets are already located on the current screen.".to_string(),
        ];
        if !groups.is_empty() {
            let summaries: Vec<String> = groups
                .iter_mut()
                .map(|(base, indices)| {
                    indices.sort_unstable();
                    let first = indices[0];
                    let last = indices[indices.len() - 1];
                    let range = if first == last {
                        format!("#{}", first)
                    } else {
                        format!("#{}..#{}", first, last)
                    };
                    format!("{}{} (count {})", base, range, indices.len())
                })
                .collect();
            lines.push(format!("Token groups: {}", summaries.join("; ")));
        }
        if !ungrouped.is_empty() {
            lines.push(format!("Ungrouped tokens: {}", ungrouped.join(", ")));
        }
        let all: Vec<&str> = points.keys().map(String::as_str).collect();
        lines.push(format!("All tokens (full list): {}", all.join(", ")));
        lines.push(
            "Use tokens verbatim with the *WithShortMemory actions; tokens sharing a base name are multiple matches of one target."
                .to_string(),
        );
        Some(lines.join("\n"))
    }

    /// Token-addressed actions plus warmup and clear.
    pub fn actions(self: &Arc<Self>, device: Arc<dyn Device>) -> Vec<Arc<dyn DeviceAction>> {
        let token_action = |kind: TokenActionKind| -> Arc<dyn DeviceAction> {
            Arc::new(TokenAction {
                spec: kind.spec(),
                kind,
                memory: self.clone(),
                device: device.clone(),
            })
        };
        vec![
            token_action(TokenActionKind::Tap),
            token_action(TokenActionKind::Input),
            token_action(TokenActionKind::Hover),
            token_action(TokenActionKind::RightClick),
            token_action(TokenActionKind::DoubleClick),
            Arc::new(ClearShortMemoryAction {
                spec: ActionSpec::new("ClearShortMemory")
                    .with_description("Clear short memory tokens when the screen has changed.")
                    .with_value_field("reason", false, "why the tokens are cleared"),
                memory: self.clone(),
            }),
            Arc::new(WarmupShortMemoryAction {
                spec: ActionSpec::new("WarmupShortMemory")
                    .with_description("Locate targets once and store them as short memory tokens.")
                    .with_value_field("targets", true, "descriptions or {prompt, mode}")
                    .with_value_field("freezeContext", false, "hold one snapshot, default true")
                    .with_value_field("clearShortMemory", false, "replace existing tokens, default true"),
                memory: self.clone(),
            }),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenActionKind {
    Tap,
    Input,
    Hover,
    RightClick,
    DoubleClick,
}

impl TokenActionKind {
    /// Device action this variant forwards to.
    fn target(self) -> &'static str {
        match self {
            Self::Tap => "Tap",
            Self::Input => "Input",
            Self::Hover => "Hover",
            Self::RightClick => "RightClick",
            Self::DoubleClick => "DoubleClick",
        }
    }

    fn spec(self) -> ActionSpec {
        let spec = ActionSpec::new(format!("{}WithShortMemory", self.target()));
        match self {
            Self::Tap => spec
                .with_description("Tap pre-located tokens in order without locating.")
                .with_value_field("tokens", true, "tokens to tap in order")
                .with_value_field("intervalMs", false, "delay between taps")
                .with_value_field("strict", false, "fail on a missing token, default true"),
            Self::Input => spec
                .with_description("Type into a pre-located field token.")
                .with_value_field("token", true, "field token")
                .with_value_field("value", true, "text to input")
                .with_value_field("mode", false, "replace, clear or append"),
            _ => spec
                .with_description(format!("{} a pre-located token.", self.target()))
                .with_value_field("token", true, "target token"),
        }
    }
}

struct TokenAction {
    spec: ActionSpec,
    kind: TokenActionKind,
    memory: Arc<ShortMemoryManager>,
    device: Arc<dyn Device>,
}

impl TokenAction {
    fn lookup(&self, token: &str) -> Result<Point, EngineError> {
        self.memory
            .get(token)
            .ok_or_else(|| EngineError::TokenNotFound {
                action: self.spec.name.clone(),
                token: token.to_string(),
            })
    }

    async fn forward(
        &self,
        target: &Arc<dyn DeviceAction>,
        token: &str,
        point: Point,
        mut param: Value,
        ctx: &ActionContext,
    ) -> Result<Value, EngineError> {
        let element = LocateResultElement::at_point(point).with_description(token);
        if let Value::Object(map) = &mut param {
            map.insert("locate".to_string(), json!({ "prompt": token }));
        }
        let mut forwarded = ctx.clone();
        forwarded.elements.insert("locate".to_string(), element);
        target.call(param, forwarded).await
    }

    fn token_param(param: &Value) -> Result<String, EngineError> {
        param
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::InvalidParam("token is required".to_string()))
    }
}

#[async_trait]
impl DeviceAction for TokenAction {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    async fn call(&self, param: Value, ctx: ActionContext) -> Result<Value, EngineError> {
        let target_name = self.kind.target();
        let target = find_action(&self.device.action_space(), target_name).ok_or_else(|| {
            EngineError::ActionNotFound(format!("{} (required by {})", target_name, self.spec.name))
        })?;

        match self.kind {
            TokenActionKind::Tap => {
                let tokens: Vec<String> = match param.get("tokens") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect(),
                    Some(Value::String(token)) => vec![token.clone()],
                    _ => Vec::new(),
                };
                if tokens.is_empty() {
                    return Err(EngineError::InvalidParam(
                        "TapWithShortMemory needs at least one token".to_string(),
                    ));
                }
                let strict = param.get("strict").and_then(Value::as_bool).unwrap_or(true);
                let interval = param
                    .get("intervalMs")
                    .and_then(Value::as_u64)
                    .unwrap_or_else(|| default_tap_interval_ms(tokens.len()));

                let mut targets = Vec::new();
                let mut skipped = Vec::new();
                for token in &tokens {
                    match self.lookup(token) {
                        Ok(point) => targets.push((token.clone(), point)),
                        Err(e) if strict => return Err(e),
                        Err(_) => {
                            tracing::debug!("Skipping unknown short memory token \"{}\"", token);
                            skipped.push(token.clone());
                        }
                    }
                }

                let last = targets.len().saturating_sub(1);
                for (index, (token, point)) in targets.iter().enumerate() {
                    self.forward(&target, token, *point, json!({}), &ctx).await?;
                    if index < last && interval > 0 {
                        tokio::time::sleep(Duration::from_millis(interval)).await;
                    }
                }
                Ok(json!({ "count": targets.len(), "skipped": skipped }))
            }
            TokenActionKind::Input => {
                let token = Self::token_param(&param)?;
                let point = self.lookup(&token)?;
                let mode = param.get("mode").and_then(Value::as_str).unwrap_or("replace");
                if !matches!(mode, "replace" | "clear" | "append") {
                    return Err(EngineError::InvalidParam(format!(
                        "unknown input mode \"{}\", expected replace, clear or append",
                        mode
                    )));
                }
                let value = match (mode, param.get("value")) {
                    ("clear", _) => String::new(),
                    (_, Some(Value::String(s))) => s.clone(),
                    (_, Some(Value::Number(n))) => n.to_string(),
                    _ => {
                        return Err(EngineError::InvalidParam(
                            "InputWithShortMemory needs a value".to_string(),
                        ))
                    }
                };
                self.forward(
                    &target,
                    &token,
                    point,
                    json!({ "value": value, "mode": mode }),
                    &ctx,
                )
                .await?;
                Ok(json!({ "token": token }))
            }
            _ => {
                let token = Self::token_param(&param)?;
                let point = self.lookup(&token)?;
                self.forward(&target, &token, point, json!({}), &ctx).await?;
                Ok(json!({ "token": token }))
            }
        }
    }
}

struct ClearShortMemoryAction {
    spec: ActionSpec,
    memory: Arc<ShortMemoryManager>,
}

#[async_trait]
impl DeviceAction for ClearShortMemoryAction {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    async fn call(&self, param: Value, _ctx: ActionContext) -> Result<Value, EngineError> {
        let cleared = self.memory.clear();
        if let Some(reason) = param.get("reason").and_then(Value::as_str) {
            tracing::debug!("Cleared {} short memory tokens: {}", cleared, reason);
        }
        Ok(json!({ "cleared": cleared }))
    }
}

struct WarmupShortMemoryAction {
    spec: ActionSpec,
    memory: Arc<ShortMemoryManager>,
}

#[async_trait]
impl DeviceAction for WarmupShortMemoryAction {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    async fn call(&self, param: Value, ctx: ActionContext) -> Result<Value, EngineError> {
        let targets: Vec<WarmupTarget> = serde_json::from_value(
            param.get("targets").cloned().unwrap_or(Value::Null),
        )?;
        let mut options = WarmupOptions::default();
        if let Some(freeze) = param.get("freezeContext").and_then(Value::as_bool) {
            options.freeze_context = freeze;
        }
        if let Some(clear) = param.get("clearShortMemory").and_then(Value::as_bool) {
            options.clear_short_memory = clear;
        }
        options.ui_context = ctx.ui_context;
        self.memory.warmup(&targets, options).await?;
        Ok(json!({ "count": self.memory.len() }))
    }
}
