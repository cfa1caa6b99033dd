//! Golden-record assembly.
//!
//! `update_profile` folds one canonical event into the stored profile:
//! source-of-truth contact info (CRM is the authority), most-restrictive
//! consent merge, interaction counters, engagement rescoring, segment
//! recomputation, and identifier merge. Writes are optimistic: read at
//! version v, persist predicated on v, retry on conflict.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use cdp_core::error::{CdpError, CdpResult};
use cdp_core::model::{
    CanonicalEvent, ConsentState, EnrollmentStatus, EventSource, Profile,
};

use crate::segments::{threshold_segments, SegmentEvaluator};
use crate::store::ProfileStore;

// Engagement scoring weights.
const RECENCY_WEIGHT: f64 = 0.55;
const FREQUENCY_WEIGHT: f64 = 0.45;
const RECENCY_HALF_LIFE_DAYS: f64 = 14.0;
const POINTS_PER_EVENT: f64 = 2.5;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Engagement as a deterministic function of its inputs: exponential recency
/// decay (14-day half-life) blended with event frequency, rounded to two
/// decimals.
pub fn engagement_score(
    total_events: u64,
    last_interaction_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let recency = match last_interaction_at {
        Some(last) => {
            let days_ago = ((now - last).num_seconds() as f64 / 86_400.0).max(0.0);
            100.0 * (-0.693 * days_ago / RECENCY_HALF_LIFE_DAYS).exp()
        }
        None => 0.0,
    };
    let frequency = (total_events as f64 * POINTS_PER_EVENT).min(100.0);
    let score = RECENCY_WEIGHT * recency + FREQUENCY_WEIGHT * frequency;
    (score * 100.0).round() / 100.0
}

/// Assembles and maintains unified profiles.
pub struct ProfileBuilder {
    store: Arc<dyn ProfileStore>,
    evaluator: Arc<SegmentEvaluator>,
    max_retries: u32,
}

impl ProfileBuilder {
    pub fn new(store: Arc<dyn ProfileStore>, evaluator: Arc<SegmentEvaluator>) -> Self {
        Self {
            store,
            evaluator,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Fold `event` into the profile, retrying on version conflicts.
    pub async fn update_profile(
        &self,
        profile_id: Uuid,
        event: &CanonicalEvent,
    ) -> CdpResult<Profile> {
        for attempt in 1..=self.max_retries {
            let profile = self
                .store
                .get(profile_id)
                .await?
                .ok_or_else(|| CdpError::ProfileNotFound(profile_id.to_string()))?;
            let expected_version = profile.version;

            let candidate = self.apply_event(profile, event);

            match self.store.update_if_version(candidate, expected_version).await? {
                Some(persisted) => {
                    debug!(
                        profile_id = %profile_id,
                        version = persisted.version,
                        "profile updated"
                    );
                    return Ok(persisted);
                }
                None => {
                    warn!(
                        profile_id = %profile_id,
                        attempt = attempt,
                        max = self.max_retries,
                        "optimistic lock conflict, re-reading"
                    );
                }
            }
        }
        Err(CdpError::OptimisticLock {
            profile_id: profile_id.to_string(),
            attempts: self.max_retries,
        })
    }

    fn apply_event(&self, mut profile: Profile, event: &CanonicalEvent) -> Profile {
        self.apply_contact_info(&mut profile, event);
        self.apply_enrollment_status(&mut profile, event);
        self.update_interaction_summary(&mut profile, event);
        self.update_scores(&mut profile);
        self.update_segments(&mut profile);
        self.merge_identifiers(&mut profile, event);
        profile
    }

    /// CRM is the source of truth for contact info; consent is always
    /// merged most-restrictive regardless of source.
    fn apply_contact_info(&self, profile: &mut Profile, event: &CanonicalEvent) {
        if event.source == EventSource::Crm && !event.personal_info.is_empty() {
            let incoming = &event.personal_info;
            if incoming.name.is_some() {
                profile.personal_info.name = incoming.name.clone();
            }
            if incoming.email.is_some() {
                profile.personal_info.email = incoming.email.clone();
            }
            if incoming.phone.is_some() {
                profile.personal_info.phone = incoming.phone.clone();
            }
        }

        let now = Utc::now();
        for (channel, incoming) in &event.consent {
            let merged = profile
                .channel_consent
                .get(channel)
                .map(|state| state.consented && *incoming)
                .unwrap_or(*incoming);
            let entry = profile
                .channel_consent
                .entry(channel.clone())
                .or_insert_with(|| ConsentState {
                    consented: merged,
                    legal_basis: "consent".to_string(),
                    terms_version: "v1.0".to_string(),
                    updated_at: now,
                });
            if entry.consented != merged {
                entry.consented = merged;
                entry.updated_at = now;
            }
        }
    }

    /// CRM-provided status wins; otherwise the first identified event moves
    /// an anonymous profile to inquiry.
    fn apply_enrollment_status(&self, profile: &mut Profile, event: &CanonicalEvent) {
        if event.source == EventSource::Crm {
            if let Some(status) = event
                .normalized_data
                .get("enrollment_status")
                .and_then(|v| v.as_str())
                .and_then(parse_enrollment_status)
            {
                profile.enrollment_status = status;
                return;
            }
        }
        if profile.enrollment_status == EnrollmentStatus::Anonymous
            && (!event.identifiers.is_empty() || event.student_id.is_some())
        {
            profile.enrollment_status = EnrollmentStatus::Inquiry;
        }
    }

    fn update_interaction_summary(&self, profile: &mut Profile, event: &CanonicalEvent) {
        let summary = &mut profile.interaction_summary;
        summary.total_events += 1;
        *summary
            .per_source_count
            .entry(event.source.as_str().to_string())
            .or_insert(0) += 1;
        summary.last_interaction_at = Some(event.timestamp);
    }

    fn update_scores(&self, profile: &mut Profile) {
        profile.scores.engagement = engagement_score(
            profile.interaction_summary.total_events,
            profile.interaction_summary.last_interaction_at,
            Utc::now(),
        );
    }

    fn update_segments(&self, profile: &mut Profile) {
        let mut segments = threshold_segments(profile.scores.engagement);
        segments.extend(self.evaluator.evaluate(profile));
        profile.set_segments(segments);
    }

    /// Add incoming identifiers whose type the profile does not yet carry.
    fn merge_identifiers(&self, profile: &mut Profile, event: &CanonicalEvent) {
        for identifier in &event.identifiers {
            if identifier.value.is_empty() {
                continue;
            }
            if !profile.has_identifier_type(identifier.id_type) {
                profile.identifiers.push(identifier.clone());
            }
        }
    }
}

fn parse_enrollment_status(raw: &str) -> Option<EnrollmentStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "anonymous" => Some(EnrollmentStatus::Anonymous),
        "inquiry" => Some(EnrollmentStatus::Inquiry),
        "application" => Some(EnrollmentStatus::Application),
        "enrollment" => Some(EnrollmentStatus::Enrollment),
        "active" => Some(EnrollmentStatus::Active),
        "alumni" => Some(EnrollmentStatus::Alumni),
        "churned" => Some(EnrollmentStatus::Churned),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryProfileStore;
    use cdp_core::model::{Identifier, IdentifierType, PersonalInfo};
    use chrono::Duration;
    use serde_json::json;

    fn builder(store: Arc<InMemoryProfileStore>) -> ProfileBuilder {
        ProfileBuilder::new(store, Arc::new(SegmentEvaluator::new()))
    }

    async fn seeded_profile(store: &Arc<InMemoryProfileStore>) -> Uuid {
        let profile = Profile::new();
        let id = profile.profile_id;
        store.insert(profile).await.unwrap();
        id
    }

    fn event(source: EventSource) -> CanonicalEvent {
        CanonicalEvent::new("page_view", source, Utc::now())
    }

    #[test]
    fn test_engagement_math() {
        // 4 events, last interaction exactly one half-life ago:
        // recency = 100 * e^-0.693 = 50.00, frequency = 10,
        // engagement = 0.55*50.00 + 0.45*10 = 32.00 -> at_risk.
        let now = Utc::now();
        let score = engagement_score(4, Some(now - Duration::days(14)), now);
        assert!((score - 32.0).abs() < 0.01, "score was {score}");
        assert_eq!(threshold_segments(score), vec!["at_risk"]);
    }

    #[test]
    fn test_engagement_is_deterministic() {
        let now = Utc::now();
        let last = Some(now - Duration::days(3));
        assert_eq!(engagement_score(7, last, now), engagement_score(7, last, now));
    }

    #[test]
    fn test_engagement_no_interactions() {
        assert_eq!(engagement_score(0, None, Utc::now()), 0.0);
    }

    #[test]
    fn test_frequency_caps_at_100() {
        let now = Utc::now();
        // 50 events * 2.5 = 125, capped at 100: 0.55*100 + 0.45*100 = 100.
        let score = engagement_score(50, Some(now), now);
        assert!((score - 100.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_update_increments_counters_and_version() {
        let store = InMemoryProfileStore::new();
        let builder = builder(store.clone());
        let id = seeded_profile(&store).await;

        let updated = builder
            .update_profile(id, &event(EventSource::Website))
            .await
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.interaction_summary.total_events, 1);
        assert_eq!(updated.interaction_summary.per_source_count["website"], 1);

        let updated = builder
            .update_profile(id, &event(EventSource::Whatsapp))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.interaction_summary.total_events, 2);
        assert_eq!(updated.interaction_summary.per_source_count["whatsapp"], 1);
    }

    #[tokio::test]
    async fn test_crm_owns_contact_info() {
        let store = InMemoryProfileStore::new();
        let builder = builder(store.clone());
        let id = seeded_profile(&store).await;

        let mut web = event(EventSource::Website);
        web.personal_info = PersonalInfo {
            name: Some("Web Name".into()),
            email: None,
            phone: None,
        };
        let updated = builder.update_profile(id, &web).await.unwrap();
        assert!(updated.personal_info.name.is_none());

        let mut crm = event(EventSource::Crm);
        crm.personal_info = PersonalInfo {
            name: Some("Alice Brown".into()),
            email: Some("alice@uni.edu".into()),
            phone: None,
        };
        let updated = builder.update_profile(id, &crm).await.unwrap();
        assert_eq!(updated.personal_info.name.as_deref(), Some("Alice Brown"));
        assert_eq!(updated.personal_info.email.as_deref(), Some("alice@uni.edu"));
    }

    #[tokio::test]
    async fn test_consent_merge_is_most_restrictive() {
        let store = InMemoryProfileStore::new();
        let builder = builder(store.clone());
        let id = seeded_profile(&store).await;

        let mut grant = event(EventSource::Website);
        grant.consent.insert("email".into(), true);
        let updated = builder.update_profile(id, &grant).await.unwrap();
        assert!(updated.channel_consent["email"].consented);

        let mut revoke = event(EventSource::Website);
        revoke.consent.insert("email".into(), false);
        let updated = builder.update_profile(id, &revoke).await.unwrap();
        assert!(!updated.channel_consent["email"].consented);

        // Once false, a later true cannot resurrect it.
        let updated = builder.update_profile(id, &grant).await.unwrap();
        assert!(!updated.channel_consent["email"].consented);
    }

    #[tokio::test]
    async fn test_identifier_merge_keeps_first_per_type() {
        let store = InMemoryProfileStore::new();
        let builder = builder(store.clone());
        let id = seeded_profile(&store).await;

        let mut first = event(EventSource::App);
        first
            .identifiers
            .push(Identifier::new(IdentifierType::DeviceId, "D1").unwrap());
        builder.update_profile(id, &first).await.unwrap();

        let mut second = event(EventSource::App);
        second
            .identifiers
            .push(Identifier::new(IdentifierType::DeviceId, "D2").unwrap());
        second
            .identifiers
            .push(Identifier::new(IdentifierType::Email, "s@x.edu").unwrap());
        let updated = builder.update_profile(id, &second).await.unwrap();

        let devices: Vec<_> = updated
            .identifiers
            .iter()
            .filter(|i| i.id_type == IdentifierType::DeviceId)
            .collect();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].value, "D1");
        assert!(updated.has_identifier_type(IdentifierType::Email));
    }

    #[tokio::test]
    async fn test_identified_event_moves_anonymous_to_inquiry() {
        let store = InMemoryProfileStore::new();
        let builder = builder(store.clone());
        let id = seeded_profile(&store).await;

        let mut e = event(EventSource::Website);
        e.identifiers
            .push(Identifier::new(IdentifierType::Email, "s@x.edu").unwrap());
        let updated = builder.update_profile(id, &e).await.unwrap();
        assert_eq!(updated.enrollment_status, EnrollmentStatus::Inquiry);
    }

    #[tokio::test]
    async fn test_crm_status_wins() {
        let store = InMemoryProfileStore::new();
        let builder = builder(store.clone());
        let id = seeded_profile(&store).await;

        let mut e = event(EventSource::Crm);
        e.normalized_data
            .insert("enrollment_status".into(), json!("active"));
        let updated = builder.update_profile(id, &e).await.unwrap();
        assert_eq!(updated.enrollment_status, EnrollmentStatus::Active);
    }

    #[tokio::test]
    async fn test_concurrent_writers_both_land() {
        let store = InMemoryProfileStore::new();
        let id = seeded_profile(&store).await;
        // Interleave: both builders read v, writes race; the retry loop
        // resolves the conflict and both events are counted.
        let b1 = builder(store.clone());
        let b2 = builder(store.clone());
        let e1 = event(EventSource::Website);
        let e2 = event(EventSource::App);

        let (r1, r2) = tokio::join!(b1.update_profile(id, &e1), b2.update_profile(id, &e2));
        r1.unwrap();
        r2.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.interaction_summary.total_events, 2);
    }

    #[tokio::test]
    async fn test_missing_profile_errors() {
        let store = InMemoryProfileStore::new();
        let builder = builder(store);
        let err = builder
            .update_profile(Uuid::new_v4(), &event(EventSource::Website))
            .await
            .expect_err("unknown profile");
        assert!(matches!(err, CdpError::ProfileNotFound(_)));
    }
}
