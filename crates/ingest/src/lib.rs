#![warn(clippy::unwrap_used)]

pub mod connectors;
pub mod normalizer;
pub mod webhooks;

pub use connectors::{
    ClickstreamExtractor, Connector, CrmExtractor, MobileAppExtractor, SourceExtractor,
};
pub use normalizer::FormatNormalizer;
