//! Identity resolution: map each canonical event to exactly one profile.
//!
//! Deterministic cascade: exact identifier match first (probed in event
//! order), then probabilistic fuzzy match over candidates sharing any
//! identifier value, then profile creation. Mid-confidence matches are
//! flagged for operator review instead of auto-merged.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cdp_core::error::{CdpError, CdpResult};
use cdp_core::model::{CanonicalEvent, ConsentState, Profile};
use cdp_profile::store::ProfileStore;

use crate::audit::{IdentityAuditEntry, IdentityAuditLog};
use crate::similarity::{jaccard, ratcliff_obershelp};

/// Minimum confidence for an automatic probabilistic match.
pub const CONFIDENCE_AUTO_MERGE: f64 = 0.85;

const NAME_WEIGHT: f64 = 0.6;
const OVERLAP_WEIGHT: f64 = 0.4;

/// Weighted confidence that `event` and `candidate` describe the same
/// subject: fuzzy name similarity blended with identifier-value overlap.
pub fn match_confidence(event: &CanonicalEvent, candidate: &Profile) -> f64 {
    let event_name = event
        .personal_info
        .name
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let candidate_name = candidate
        .personal_info
        .name
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let name_score = ratcliff_obershelp(&event_name, &candidate_name);

    let event_values = event.identifier_values();
    let candidate_values: Vec<&str> = candidate
        .identifiers
        .iter()
        .map(|i| i.value.as_str())
        .collect();
    let overlap = jaccard(
        event_values.iter().copied(),
        candidate_values.iter().copied(),
    );

    NAME_WEIGHT * name_score + OVERLAP_WEIGHT * overlap
}

/// Resolves an inbound event to a single profile id.
pub struct IdentityResolver {
    store: Arc<dyn ProfileStore>,
    audit: Arc<IdentityAuditLog>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn ProfileStore>, audit: Arc<IdentityAuditLog>) -> Self {
        Self { store, audit }
    }

    /// Resolve to an existing profile or create a new one.
    pub async fn resolve(&self, event: &CanonicalEvent) -> CdpResult<Uuid> {
        if let Some(profile_id) = self.deterministic_match(event).await? {
            debug!(profile_id = %profile_id, "deterministic identity match");
            return Ok(profile_id);
        }

        if let Some((candidate_id, confidence)) = self.probabilistic_match(event).await? {
            if confidence >= CONFIDENCE_AUTO_MERGE {
                info!(
                    profile_id = %candidate_id,
                    confidence = confidence,
                    "probabilistic identity match accepted"
                );
                return Ok(candidate_id);
            }
            warn!(
                candidate_id = %candidate_id,
                confidence = confidence,
                "low-confidence match flagged for review"
            );
            self.audit.record(IdentityAuditEntry::ReviewFlag {
                candidate_id,
                confidence,
                event_snapshot: serde_json::to_value(event)?,
                timestamp: Utc::now(),
            });
        }

        self.create_profile(event).await
    }

    /// Probe event identifiers in order; first exact `(type, value)` hit
    /// wins.
    async fn deterministic_match(&self, event: &CanonicalEvent) -> CdpResult<Option<Uuid>> {
        for identifier in &event.identifiers {
            if identifier.value.is_empty() {
                continue;
            }
            if let Some(profile) = self
                .store
                .find_by_identifier(identifier.id_type, &identifier.value)
                .await?
            {
                return Ok(Some(profile.profile_id));
            }
        }
        Ok(None)
    }

    /// Fuzzy match over candidates sharing ANY identifier value (not
    /// type-constrained). Requires a name and at least one identifier.
    async fn probabilistic_match(
        &self,
        event: &CanonicalEvent,
    ) -> CdpResult<Option<(Uuid, f64)>> {
        let has_name = event
            .personal_info
            .name
            .as_deref()
            .map(|n| !n.is_empty())
            .unwrap_or(false);
        let values = event.identifier_values();
        if !has_name || values.is_empty() {
            return Ok(None);
        }

        let candidates = self.store.find_by_any_value(&values).await?;
        let mut best: Option<(Uuid, f64)> = None;
        for candidate in &candidates {
            let confidence = match_confidence(event, candidate);
            if best.map(|(_, c)| confidence > c).unwrap_or(true) {
                best = Some((candidate.profile_id, confidence));
            }
        }
        Ok(best)
    }

    /// Seed a new profile from the event and audit the creation.
    async fn create_profile(&self, event: &CanonicalEvent) -> CdpResult<Uuid> {
        let now = Utc::now();
        let mut profile = Profile::new();
        profile.personal_info = event.personal_info.clone();
        profile.identifiers = event
            .identifiers
            .iter()
            .filter(|i| !i.value.is_empty())
            .cloned()
            .collect();
        for (channel, consented) in &event.consent {
            profile.channel_consent.insert(
                channel.clone(),
                ConsentState {
                    consented: *consented,
                    legal_basis: "consent".to_string(),
                    terms_version: "v1.0".to_string(),
                    updated_at: now,
                },
            );
        }

        let profile_id = profile.profile_id;
        if let Err(insert_err) = self.store.insert(profile).await {
            // A concurrent writer claimed one of the identifier pairs
            // between the probe and the insert; defer to the winner.
            if let Some(existing) = self.deterministic_match(event).await? {
                debug!(profile_id = %existing, "create raced, deferring to existing profile");
                return Ok(existing);
            }
            return Err(insert_err);
        }
        self.audit.record(IdentityAuditEntry::Create {
            profile_id,
            timestamp: now,
        });
        info!(profile_id = %profile_id, "profile created");
        Ok(profile_id)
    }

    /// Merge `secondary` into `primary` (e.g. after review approval):
    /// identifier union, most-restrictive consent, secondary deleted.
    pub async fn merge(&self, primary_id: Uuid, secondary_id: Uuid) -> CdpResult<()> {
        let primary = self
            .store
            .get(primary_id)
            .await?
            .ok_or_else(|| CdpError::ProfileNotFound(primary_id.to_string()))?;
        let secondary = self
            .store
            .get(secondary_id)
            .await?
            .ok_or_else(|| CdpError::ProfileNotFound(secondary_id.to_string()))?;

        // Release the secondary's identifier index entries before the
        // primary claims the union.
        self.store.delete(secondary_id).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut current = self
                .store
                .get(primary_id)
                .await?
                .ok_or_else(|| CdpError::ProfileNotFound(primary_id.to_string()))?;
            let expected_version = current.version;

            for identifier in &secondary.identifiers {
                if !current.identifiers.contains(identifier) {
                    current.identifiers.push(identifier.clone());
                }
            }

            // Most restrictive wins: a channel consents only if both did.
            let channels: Vec<String> = primary
                .channel_consent
                .keys()
                .chain(secondary.channel_consent.keys())
                .cloned()
                .collect();
            let now = Utc::now();
            for channel in channels {
                let p = primary
                    .channel_consent
                    .get(&channel)
                    .map(|s| s.consented)
                    .unwrap_or(false);
                let s = secondary
                    .channel_consent
                    .get(&channel)
                    .map(|s| s.consented)
                    .unwrap_or(false);
                let merged = p && s;
                let template = primary
                    .channel_consent
                    .get(&channel)
                    .or_else(|| secondary.channel_consent.get(&channel));
                current.channel_consent.insert(
                    channel.clone(),
                    ConsentState {
                        consented: merged,
                        legal_basis: template
                            .map(|t| t.legal_basis.clone())
                            .unwrap_or_else(|| "consent".to_string()),
                        terms_version: template
                            .map(|t| t.terms_version.clone())
                            .unwrap_or_else(|| "v1.0".to_string()),
                        updated_at: now,
                    },
                );
            }

            match self.store.update_if_version(current, expected_version).await? {
                Some(_) => break,
                None if attempt < 3 => continue,
                None => {
                    return Err(CdpError::OptimisticLock {
                        profile_id: primary_id.to_string(),
                        attempts: attempt,
                    })
                }
            }
        }

        self.audit.record(IdentityAuditEntry::Merge {
            primary_id,
            secondary_id,
            timestamp: Utc::now(),
        });
        info!(primary = %primary_id, secondary = %secondary_id, "profiles merged");
        Ok(())
    }
}
