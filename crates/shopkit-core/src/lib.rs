//! `shopkit-core` — shared plumbing for the shopkit workspace.
//!
//! Holds the configuration loader (TOML file + `SHOPKIT_*` env overrides)
//! and the platform error type. Subsystem crates depend on this instead of
//! each other.

pub mod config;
pub mod error;

pub use config::ShopkitConfig;
pub use error::{Result, ShopkitError};
