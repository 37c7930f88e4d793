//! AI collaborators and the OpenAI-compatible client that implements them.

mod client;
mod service;

pub use client::{MessageBuilder, ModelClient, ModelConfig, ModelError};
pub use service::{LocateService, PlanRequest, PlanService};
