//! Agent layer: resolution, task building, execution and short memory.

mod context;
mod executor;
mod resolver;
mod short_memory;
mod task_builder;
mod ui_agent;

pub use context::UiContextSource;
pub use executor::{FlushOutput, NoopObserver, RunnerStatus, TaskObserver, TaskRunner};
pub use resolver::{resolution_output, LocateResolver, Resolution};
pub use short_memory::{
    default_tap_interval_ms, ShortMemoryManager, WarmupMode, WarmupOptions, WarmupTarget,
};
pub use task_builder::{BuildOptions, TaskBuilder};
pub use ui_agent::{
    ActOptions, AgentConfig, GroupedDump, LocateOptions, UiAgent, DEFAULT_REPLANNING_CYCLE_LIMIT,
};
