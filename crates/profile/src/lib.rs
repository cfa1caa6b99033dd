#![warn(clippy::unwrap_used)]

pub mod builder;
pub mod segments;
pub mod store;

pub use builder::{engagement_score, ProfileBuilder};
pub use segments::{SegmentChange, SegmentEvaluator};
pub use store::{InMemoryProfileStore, ProfileStore};

#[cfg(test)]
mod proptests {
    use super::builder::engagement_score;
    use super::segments::threshold_segments;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_engagement_is_deterministic(total in 0u64..10_000, days in 0i64..730) {
            let now = Utc::now();
            let last = Some(now - Duration::days(days));
            prop_assert_eq!(
                engagement_score(total, last, now),
                engagement_score(total, last, now)
            );
        }

        #[test]
        fn prop_engagement_is_bounded(total in 0u64..10_000, days in 0i64..730) {
            let now = Utc::now();
            let score = engagement_score(total, Some(now - Duration::days(days)), now);
            prop_assert!((0.0..=100.0).contains(&score));
        }

        #[test]
        fn prop_threshold_bands_are_disjoint(score in 0.0f64..100.0) {
            // A score below 100 belongs to exactly one band.
            prop_assert_eq!(threshold_segments(score).len(), 1);
        }
    }
}
