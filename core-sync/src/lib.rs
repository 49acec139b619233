//! # Sync Module
//!
//! Keeps the local photo cache in line with the selected remote albums.
//!
//! ## Overview
//!
//! Each cycle lists the active albums, diffs them against the cache
//! manifest, then downloads, relabels, removes and evicts until the cache
//! mirrors the selection within its quota.
//!
//! ## Components
//!
//! - **Planner** (`planner`): diff of remote listings against the manifest
//! - **Download Worker Pool** (`pool`): bounded parallel downloads with a single committer
//! - **Sync Engine** (`engine`): one cycle from settings to orphan sweep
//! - **Scheduler** (`scheduler`): timer and on-demand triggers, one cycle at a time
//! - **Cycle Records** (`cycle`): cycle identity and statistics

pub mod cycle;
pub mod engine;
pub mod error;
pub mod planner;
pub mod pool;
pub mod scheduler;

pub use cycle::{CycleId, CycleReport, CycleStats};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use planner::{RemoteSnapshot, SyncPlan, SyncPlanner};
pub use pool::{DownloadWorkerPool, PoolReport};
pub use scheduler::{CycleRunner, SchedulerState, SchedulerStatus, SyncScheduler, TriggerOutcome};
