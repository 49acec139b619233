//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the sync core:
//! - Logging and tracing setup
//! - Configuration and per-cycle sync settings
//! - Event bus for auth, sync and cache notifications
//!
//! ## Overview
//!
//! Every other `core-*` crate depends on this one for its logging
//! conventions, its `CoreEvent` types and the `SyncSettings` it reads at the
//! start of a cycle.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
