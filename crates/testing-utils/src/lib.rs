//! # Jobsched Testing Utils
//!
//! Shared testing utilities for the job execution core.
//! This crate provides test doubles for the domain ports, data builders
//! and small async helpers that can be used across the workspace.
//!
//! ## Features
//!
//! - **Manual Clock**: A controllable `Clock` for lock expiry and freshness tests
//! - **Mock Runner**: A `JobRunner` with configurable delay, failure, panic and concurrency probing
//! - **Recording Doubles**: Notifier and lock repository wrappers that record what happened
//! - **Failure Injection**: An execution repository wrapper that fails selected writes
//! - **Test Data Builders**: Builders for jobs, schedules and executions
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! jobsched-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
