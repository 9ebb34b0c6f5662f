//! Reconciliation engine.
//!
//! The evaluator diffs desired pods against current allocations and
//! compiles the difference into phased instruction batches; the executor
//! runs each batch against the init system, one pod at a time.

mod evaluator;
mod executor;
mod instruction;
mod sink;

pub use evaluator::{Evaluator, EvaluatorConfig};
pub use executor::Executor;
pub use instruction::{plan_create, plan_destroy, plan_update, Instruction, Phase};
pub use sink::Sink;

use thiserror::Error;

use crate::allocation::AllocationError;
use crate::systemd::SystemdError;

/// Errors from rendering or executing a pod's instruction batch.
///
/// A failure aborts the remainder of that pod's batch only; other pods
/// are unaffected.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Systemd(#[from] SystemdError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}
