//! Data model shared across the engine.

mod element;
mod plan;
mod task;

pub use element::{ElementCacheFeature, LocateResultElement, Point, Rect, Size, UiContext};
pub use plan::{LocateParam, Plan, PlanningAction};
pub use task::{
    executor_fn, now_millis, ExecutionDump, ExecutorContext, ExecutorFn, HitBy, HitSource,
    RecorderItem, Task, TaskCacheHit, TaskKind, TaskReturn, TaskStatus, TaskTiming,
};
