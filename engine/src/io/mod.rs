//! Side-effecting adapters: locked file access, documents and collaborators.

pub mod atomic;
pub mod cost;
pub mod escalation;
pub mod paths;
pub mod plan_store;
pub mod registry;
pub mod signing;
pub mod state;
pub mod vault;
