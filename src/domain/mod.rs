//! Core domain types for the volley batching system.
//!
//! Pure data with no persistence dependencies:
//! - Batches, options and status views
//! - Operations and their status lifecycle
//! - Typed payloads and results per batch kind

pub mod batch;
pub mod operation;
pub mod payload;
