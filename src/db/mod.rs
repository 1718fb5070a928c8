//! Database layer - retry-safe SQLite access and the work-status store

pub mod retry;
pub mod store;
pub mod work_status;

pub use retry::RetryPolicy;
pub use store::StatusDb;
pub use work_status::{
    FailureRecord, ScheduledUnit, StatusCount, StatusUpdate, UnitKey, WorkStatus,
    WorkStatusStore, WorkUnit,
};
