//! OpenMP lowering onto the SIMT master–worker protocol.
//!
//! `CodegenSession` walks a translation unit, outlines every parallel and
//! simd construct, plans how captured locals are shared and emits the
//! kernel entries, wrappers and worker loops the device runtime expects.

pub mod callgraph;
pub mod dispatch;
pub mod kernel;
pub mod level;
pub mod lower;
pub mod schedule;
pub mod session;
pub mod sharing;
pub mod wrapper;

pub use dispatch::OutlinedRegion;
pub use kernel::{initializer_name, kernel_name, worker_name, SHARED_DATA_SLOTS};
pub use level::{
    plan_dispatch, DispatchArm, DispatchPlan, Guard, Regime, StaticLevel, PARALLELISM_LEVELS,
    PARALLEL_LEVEL_STEP, SIMD_LEVEL_STEP,
};
pub use schedule::SchedulePolicy;
pub use session::{CodegenSession, EntryFunctionRecord, EXIT_LABEL};
pub use sharing::{plan_context, ContextId, DataSharingContext, SharedRecords, SharingMode};
pub use wrapper::WrapperRecord;
