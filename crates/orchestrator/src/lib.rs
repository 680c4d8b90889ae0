pub mod commands;
pub mod controller;
pub mod executor;
pub mod handle;
pub mod plan;
pub mod registry;

pub use commands::JobCommand;
pub use controller::JobController;
pub use executor::{
    EvaluationContext, TokioPoolFactory, UnitOutcome, VariantExecutor, WorkUnit, WorkerPool,
    WorkerPoolFactory,
};
pub use handle::JobHandle;
pub use plan::{JobPlan, WalkForwardPlan};
pub use registry::JobRegistry;
