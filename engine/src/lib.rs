//! Deterministic, crash-safe execution of declarative task plans.
//!
//! A plan is a dependency graph of typed tasks stored as JSON under the
//! workspace. The engine orders it, runs one task at a time through a
//! handler table and records every outcome atomically, escalating to a
//! durable issue plus a human attention queue entry when a task cannot
//! proceed. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (ordering, sandbox checks, document types).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (locked files, atomic writes, signatures,
//!   collaborators such as state, cost and secrets).
//!
//! [`plan_runner`] coordinates both through [`executor`] and the built-in
//! [`handlers`].

pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod exit_codes;
pub mod handlers;
pub mod io;
pub mod logging;
pub mod plan_runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
