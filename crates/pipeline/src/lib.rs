//! Resilient remote image-generation pipeline.
//!
//! Submits a text-to-image job through a [`GenerationBackend`], drives it
//! to a terminal state with the [`poller`] state machine (bounded retry
//! bursts plus an overall time budget), and downloads the resulting
//! artifacts with deterministic names via the [`fetcher`].
//!
//! [`GenerationBackend`]: soulgen_dashscope::backend::GenerationBackend

pub mod config;
pub mod error;
pub mod fetcher;
pub mod idempotent;
pub mod orchestrator;
pub mod poller;
pub mod result;
pub mod retry;
