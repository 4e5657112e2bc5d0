pub mod entities;
pub mod ports;
pub mod repositories;

#[cfg(feature = "sqlx-support")]
pub mod sqlx_impls;

pub use entities::*;
pub use jobsched_errors::{
    ExecutionPhase, RejectReason, SchedulerError, SchedulerResult,
};
pub use ports::*;
pub use repositories::*;
