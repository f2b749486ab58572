//! Host-side plumbing for transaction-link.
//!
//! This crate provides the pieces an application needs around the claim
//! primitives in `txlink-core`:
//!
//! - [`TransactionService`]: begins transactions, tracks the running ones and
//!   accumulates their token counters for harvest
//! - A background reaper that releases tokens nobody will ever link
//! - [`ServiceConfig`], loadable from TOML
//! - [`init_logging`] for binaries and examples

mod config;
mod error;
mod service;
mod telemetry;

pub use config::{ServiceConfig, DEFAULT_LOG_FILTER, DEFAULT_SWEEP_INTERVAL};
pub use error::ConfigError;
pub use service::TransactionService;
pub use telemetry::init_logging;
