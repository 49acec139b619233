//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (e.g., `core-service`). Host applications can depend on
//! `lookout-workspace` and enable `desktop-shims` to get the reqwest, SQLite
//! and keyring bridges without wiring each crate individually.

#[cfg(feature = "desktop-shims")]
pub use core_service;
