// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # UI Agent Core
//!
//! Resolution and caching engine for AI-driven UI automation.
//!
//! Natural-language element descriptions are resolved to on-screen targets
//! through a priority pipeline (planner box, validated cache descriptor, AI
//! model). Resolved targets are cached per prompt, together with replayable
//! plan workflows, so repeated runs skip model calls. A short-memory table of
//! pre-resolved tokens gives a bulk fast path for dense interfaces such as
//! keypads.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ui_agent_core::{CacheConfig, CacheStrategy, TaskCache};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = CacheConfig::new("checkout flow")?
//!         .with_strategy(CacheStrategy::ReadWrite)
//!         .with_cache_dir("./cache");
//!     let cache = TaskCache::new(config);
//!
//!     if let Some(record) = cache.match_plan_cache("add item to cart") {
//!         println!("cached workflow: {:?}", record.usable_workflow());
//!     }
//!     cache.flush(true)?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cache;
pub mod device;
pub mod error;
pub mod model;
pub mod script;
pub mod settings;
pub mod types;

#[cfg(test)]
mod testing;

pub use agent::{
    ActOptions, AgentConfig, LocateOptions, ShortMemoryManager, TaskRunner, UiAgent,
    WarmupOptions, WarmupTarget,
};
pub use cache::{CacheConfig, CacheError, CacheStrategy, TaskCache};
pub use device::{ActionSpec, Device, DeviceAction, FnAction};
pub use error::EngineError;
pub use model::{LocateService, ModelClient, ModelConfig, ModelError, PlanService};
pub use script::WorkflowScript;
pub use settings::EngineSettings;
pub use types::{
    ElementCacheFeature, LocateParam, LocateResultElement, Plan, PlanningAction, Rect, Task,
    UiContext,
};
