//! Shared domain types for the soulgen image-generation pipeline.
//!
//! Holds the job submission model, remote handle and status types,
//! request validation, base-filename synthesis, and the persistence
//! collaborator traits consumed by the orchestrator.

pub mod error;
pub mod ids;
pub mod job;
pub mod store;
pub mod types;
