//! Taskweave - dependency-aware task scheduling and agent orchestration.
//!
//! Raw atomic tasks go through three stages:
//!
//! 1. [`scheduling`] resolves dependency cycles, orders the tasks, forms
//!    batches, balances them and assigns an agent to each batch.
//! 2. [`orchestration`] dispatches those batches to agents with timeouts,
//!    retries and fallback while a health monitor keeps the agent registry
//!    current.
//! 3. Results are assembled per batch and per workflow.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod scheduling;

pub use config::EngineConfig;
pub use error::{Error, Result};
