//! Integration test suite for cadence.
//!
//! These tests run whole workflows through `WorkflowManager` and verify
//! that decomposition, scheduling, state and events work together.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full workflow execution tests
//! - `parallel_execution`: Concurrency bound, priority and throttling
//! - `control`: Pause, resume and cancellation
//! - `failure_handling`: Retries, timeouts, panics and store outages
//! - `recovery`: Crash recovery and shared file-backed state
//!
//! # CI Compatibility
//!
//! Executors are in-process closures, so no external tools are needed.


mod failure_handling;
mod parallel_execution;
mod recovery;
mod workflow_e2e;
