pub mod commands;
pub mod engine;
pub mod events;
pub mod fill_queue;
pub mod handle;
pub mod lots;
pub mod orders;
pub mod planner;
pub mod reconciler;
pub mod risk;
pub mod runtime;

pub use commands::{CancelAllReport, EngineCommand, EngineStatus};
pub use engine::Engine;
pub use events::{EventBus, EventStream};
pub use fill_queue::FillQueue;
pub use handle::EngineHandle;
pub use lots::{FillOutcome, LotManager};
pub use orders::{OrderSubmitter, SubmitError, SubmitOutcome};
pub use planner::{desired_levels, GridLevel, PlannedGrid, SizingInputs};
pub use reconciler::{ApiBudget, ReconcileReport, Reconciler, StartupReport};
pub use risk::{Admission, DenyReason, RiskGovernor, RiskSnapshot};
pub use runtime::{start, EngineRuntime, StreamManager};
