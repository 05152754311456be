// Scheduler module for periodic repository synchronization

pub mod engine;

pub use engine::{RoundSummary, SchedulerConfig, SyncScheduler};
