#![warn(clippy::unwrap_used)]

pub mod audit;
pub mod resolver;
pub mod similarity;

pub use audit::{IdentityAuditEntry, IdentityAuditLog};
pub use resolver::{IdentityResolver, CONFIDENCE_AUTO_MERGE};
