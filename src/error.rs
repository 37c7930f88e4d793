//! Error taxonomy shared by the resolver, builder, runner and short memory.

use thiserror::Error;

use crate::cache::CacheError;
use crate::model::ModelError;

/// Engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Resolution produced zero elements when one was required.
    #[error("Element not found: {0}")]
    NotFound(String),
    /// The locate service returned more than one match for a single-target query.
    #[error("Multiple elements found for \"{prompt}\": expected 1, got {count}")]
    MultipleElementsFound { prompt: String, count: usize },
    /// A short-memory token is missing under strict mode.
    #[error("{action}: token not found: {token}. Did you preload token->point mapping?")]
    TokenNotFound { action: String, token: String },
    /// A cached feature descriptor no longer matches the live interface.
    /// Recovered locally by falling back to the locate service.
    #[error("Cache validation failed for \"{prompt}\": {reason}")]
    CacheValidationFailed { prompt: String, reason: String },
    /// A task executor failed; raised to callers after the runner stops.
    #[error("Task {index} ({sub_type}) failed: {message}")]
    TaskExecutionFailed {
        index: usize,
        sub_type: String,
        message: String,
    },
    /// The planner reported it cannot continue.
    #[error("Planning failed: {0}")]
    Planning(String),
    #[error("Action type '{0}' not found")]
    ActionNotFound(String),
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
    #[error("Task runner state error: {0}")]
    RunnerState(String),
    #[error("Device error: {0}")]
    Device(String),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Workflow error: {0}")]
    Workflow(#[from] serde_yaml::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Render the error and its source chain, one cause per line.
    pub fn stack(&self) -> String {
        let mut lines = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            lines.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_not_found_message() {
        let err = EngineError::TokenNotFound {
            action: "TapWithShortMemory".to_string(),
            token: "7".to_string(),
        };
        assert!(err.to_string().contains("token not found: 7"));
    }

    #[test]
    fn test_stack_includes_source_chain() {
        let err = EngineError::Cache(CacheError::InvalidConfig("bad".to_string()));
        let stack = err.stack();
        assert!(stack.starts_with("Cache error"));
        assert!(stack.contains("caused by: Invalid cache config: bad"));
    }
}
