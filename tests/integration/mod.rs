//! Integration test suite for taskweave.
//!
//! These tests drive the public API end to end: planning over a registry,
//! dispatch through a scripted transport, health probing and workflow
//! orchestration. They verify that the components work together correctly.
//!
//! # Test Categories
//!
//! - `scenarios`: The reference scenarios (cycle resolution, affinity
//!   grouping, missing capability, probe failures, retry then succeed)
//! - `scheduling`: Planner properties over larger task sets
//! - `execution`: Retry, timeout, fallback and batch assembly
//! - `health`: Health monitor and registry interplay
//!
//! # CI Compatibility
//!
//! All agents are scripted in-process; no network calls are made. Tests that
//! wait on backoff or timeouts run on a paused tokio clock.


mod scheduling;
mod execution;
mod health;
