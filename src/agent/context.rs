//! UI context capture with freeze support.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::Device;
use crate::error::EngineError;
use crate::types::UiContext;

/// Source of UI snapshots. While frozen, every caller sees the same snapshot.
pub struct UiContextSource {
    device: Arc<dyn Device>,
    frozen: Mutex<Option<UiContext>>,
}

impl UiContextSource {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            frozen: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The frozen snapshot, or a fresh capture.
    pub async fn current(&self) -> Result<UiContext, EngineError> {
        if let Some(frozen) = self.frozen.lock().clone() {
            return Ok(frozen);
        }
        self.device.ui_context().await
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.lock().is_some()
    }

    /// Capture and hold a snapshot. Returns `false` without changes when a
    /// freeze is already held; the caller then owns nothing to release.
    pub async fn freeze(&self) -> Result<bool, EngineError> {
        if self.is_frozen() {
            tracing::debug!("UI context already frozen, reusing it");
            return Ok(false);
        }
        let context = self.device.ui_context().await?;
        Ok(self.freeze_with(context))
    }

    /// Hold `context` as the frozen snapshot unless one is already held.
    pub fn freeze_with(&self, mut context: UiContext) -> bool {
        let mut frozen = self.frozen.lock();
        if frozen.is_some() {
            return false;
        }
        context.frozen = true;
        *frozen = Some(context);
        tracing::debug!("UI context frozen");
        true
    }

    /// Release the frozen snapshot. Returns whether one was held.
    pub fn unfreeze(&self) -> bool {
        let released = self.frozen.lock().take().is_some();
        if released {
            tracing::debug!("UI context unfrozen");
        }
        released
    }
}
