#![warn(clippy::unwrap_used)]

pub mod consent;
pub mod erasure;

pub use consent::{ConsentManager, ConsentSource, CHANNELS};
pub use erasure::{DeletionReport, ErasureOrchestrator, ErasureTarget, VerificationResult};
