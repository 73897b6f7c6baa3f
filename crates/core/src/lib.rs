//! Domain layer for ClickUp workout ingestion.
//!
//! Everything here is free of I/O: payload parsing, text sanitizing,
//! attachment classification and normalization, plus the traits the
//! ingestion pipeline uses to reach external collaborators.
pub mod adapter;
pub mod attachments;
pub mod message;
pub mod normalizer;
pub mod payload;
pub mod types;
