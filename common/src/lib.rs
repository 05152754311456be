// Common library for shared code across scheduler, worker, and API

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod github;
pub mod models;
pub mod parser;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod webhook;
pub mod worker;
