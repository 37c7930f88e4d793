//! Device/interface collaborator.

mod action;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::types::{ElementCacheFeature, Point, Rect, UiContext};

pub use action::{
    find_action, ActionContext, ActionSpec, DeviceAction, FnAction, ParamField, ParamKind,
};

/// A live interface the engine drives.
#[async_trait]
pub trait Device: Send + Sync {
    /// Interface type reported in dumps.
    fn interface_type(&self) -> &str {
        "device"
    }

    /// Actions this device can perform.
    fn action_space(&self) -> Vec<Arc<dyn DeviceAction>>;

    /// Capture the current interface state.
    async fn ui_context(&self) -> Result<UiContext, EngineError>;

    /// Extract a feature descriptor for the element at `point`.
    async fn cache_feature_for_point(
        &self,
        _point: Point,
    ) -> Result<Option<ElementCacheFeature>, EngineError> {
        Ok(None)
    }

    /// Re-find a cached descriptor on the live interface.
    async fn rect_matches_cache_feature(
        &self,
        _feature: &ElementCacheFeature,
    ) -> Result<Option<Rect>, EngineError> {
        Ok(None)
    }

    async fn before_invoke_action(&self, _name: &str, _param: &Value) -> Result<(), EngineError> {
        Ok(())
    }

    async fn after_invoke_action(&self, _name: &str, _param: &Value) -> Result<(), EngineError> {
        Ok(())
    }
}
