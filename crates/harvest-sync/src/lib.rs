//! Job orchestration, recurring schedules, incremental collection and the
//! stale-entity refresh queue.

pub mod config;
pub mod domains;
pub mod incremental;
pub mod orchestrator;
pub mod refresh_queue;
pub mod scheduler;

pub use config::{ConfigError, HarvestConfig, SourceOverride};
pub use domains::{DomainEntry, DomainTable};
pub use incremental::{inject_incremental, rule_for, wants_incremental, IncrementalRule, SinceFormat};
pub use orchestrator::{
    DomainRunReport, FullSyncReport, JobHandle, Orchestrator, OrchestratorError, SourceOutcome, SourceRun,
};
pub use refresh_queue::{
    priority_for_age, AddOutcome, AgeThresholds, QueueStats, RefreshPriority, RefreshQueue, RefreshTask,
    StaleEntity,
};
pub use scheduler::{compute_next_run, parse_cron, Scheduler, SchedulerError, SchedulerOptions};

pub const CRATE_NAME: &str = "harvest-sync";
