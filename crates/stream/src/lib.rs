#![warn(clippy::unwrap_used)]

pub mod processor;

pub use processor::{StagingRecord, StreamProcessor, VALID_SOURCES};
