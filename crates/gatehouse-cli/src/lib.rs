//! Library half of the `gatehouse` binary.
//!
//! - **[`config`]** -- `gatehouse.toml` with environment overrides.
//! - **[`bootstrap`]** -- builds the store, cascade, risk assessor and
//!   approval controller from a [`config::GateConfig`].
//! - **[`helpers`]** -- tracing setup and the audit log subscriber.

pub mod bootstrap;
pub mod config;
pub mod helpers;

pub use bootstrap::{Runtime, build, build_with_database, check_rules};
pub use config::{GateConfig, LogFormat};
