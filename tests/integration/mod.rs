//! Integration test suite for conductor.
//!
//! These tests drive the public API end to end with an in-memory store,
//! the in-process channel hub, and a fake spawner. Workers are simulated
//! by event subscribers that move their tasks and report back through the
//! lifecycle manager, so no real agent processes are started.
//!
//! # Test Categories
//!
//! - `task_graph`: Acyclicity, readiness, and transition legality
//! - `agent_fleet`: Termination, dependency waits, and event ordering
//! - `cleanup_sweep`: Dry-run purity and partial failures
//! - `run_e2e`: Full runs from objective to archived outcome

mod fixtures;

mod task_graph;
mod agent_fleet;
mod cleanup_sweep;
mod run_e2e;
