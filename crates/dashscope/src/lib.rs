//! DashScope (Wan text-to-image) REST client library.
//!
//! Provides the [`backend::GenerationBackend`] seam the pipeline polls
//! through, typed wire messages for the asynchronous image-synthesis
//! endpoints, and an HTTP implementation built on [`reqwest`].

pub mod api;
pub mod backend;
pub mod messages;
