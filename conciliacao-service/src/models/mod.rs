//! Domain models for conciliacao-service.

pub mod contribution;
pub mod sync_log;

pub use contribution::{
    Contribution, ContributionStatus, ContributionType, Employer, IntegrationSource,
    NewContribution,
};
pub use sync_log::{
    ConciliationOutcome, ItemOutcome, NewConciliationLog, RunCounters, RunSummary, SyncLog,
    SyncRunStatus, SyncType,
};
