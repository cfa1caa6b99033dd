//! Profile persistence behind a trait so pipeline stages can suspend on any
//! storage backend. The in-memory implementation keeps an exact-match
//! identifier index for deterministic resolution and enforces the
//! compare-and-set versioning contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use cdp_core::error::{CdpError, CdpResult};
use cdp_core::model::{Identifier, IdentifierType, Profile};

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, profile_id: Uuid) -> CdpResult<Option<Profile>>;

    /// Exact `(type, value)` lookup; the deterministic-match path.
    async fn find_by_identifier(
        &self,
        id_type: IdentifierType,
        value: &str,
    ) -> CdpResult<Option<Profile>>;

    /// Profiles sharing ANY of the given identifier values, regardless of
    /// type; the probabilistic candidate set.
    async fn find_by_any_value(&self, values: &[&str]) -> CdpResult<Vec<Profile>>;

    /// Insert a new profile. Fails if any identifier pair is already owned
    /// by another profile (a missed merge).
    async fn insert(&self, profile: Profile) -> CdpResult<()>;

    /// Compare-and-set write: persists only if the stored version equals
    /// `expected_version`, atomically bumping to `expected_version + 1` and
    /// stamping `updated_at`. Returns the persisted profile, or `None` on a
    /// version conflict.
    async fn update_if_version(
        &self,
        profile: Profile,
        expected_version: u64,
    ) -> CdpResult<Option<Profile>>;

    async fn delete(&self, profile_id: Uuid) -> CdpResult<bool>;

    /// Hard-delete everything attached to a subject key (profile id or any
    /// identifier value). Returns the number of profiles removed.
    async fn delete_subject(&self, subject: &str) -> CdpResult<u64>;

    /// Number of profiles still referencing the subject.
    async fn residual_count(&self, subject: &str) -> CdpResult<u64>;

    async fn find_by_segment(&self, segment: &str, limit: usize) -> CdpResult<Vec<Profile>>;

    async fn count(&self) -> CdpResult<u64>;
}

/// In-memory store: profiles by id plus an identifier index keyed
/// `type:value`.
pub struct InMemoryProfileStore {
    profiles: DashMap<Uuid, Profile>,
    identifier_index: DashMap<String, Uuid>,
    identifier_lookups: AtomicU64,
}

impl InMemoryProfileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            profiles: DashMap::new(),
            identifier_index: DashMap::new(),
            identifier_lookups: AtomicU64::new(0),
        })
    }

    /// How many exact identifier lookups have been served (test hook).
    pub fn identifier_lookup_count(&self) -> u64 {
        self.identifier_lookups.load(Ordering::Relaxed)
    }

    fn reindex(&self, profile_id: Uuid, old: &[Identifier], new: &[Identifier]) {
        for id in old {
            if !new.contains(id) {
                self.identifier_index.remove(&id.index_key());
            }
        }
        for id in new {
            self.identifier_index.insert(id.index_key(), profile_id);
        }
    }

    fn check_identifier_ownership(&self, profile_id: Uuid, identifiers: &[Identifier]) -> CdpResult<()> {
        for id in identifiers {
            if let Some(owner) = self.identifier_index.get(&id.index_key()) {
                if *owner != profile_id {
                    return Err(CdpError::Validation(format!(
                        "identifier {} already linked to another profile",
                        id.index_key()
                    )));
                }
            }
        }
        Ok(())
    }

    fn matches_subject(profile: &Profile, subject: &str) -> bool {
        profile.profile_id.to_string() == subject
            || profile.identifiers.iter().any(|i| i.value == subject)
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(&self, profile_id: Uuid) -> CdpResult<Option<Profile>> {
        Ok(self.profiles.get(&profile_id).map(|p| p.clone()))
    }

    async fn find_by_identifier(
        &self,
        id_type: IdentifierType,
        value: &str,
    ) -> CdpResult<Option<Profile>> {
        self.identifier_lookups.fetch_add(1, Ordering::Relaxed);
        let key = format!("{}:{}", id_type.as_str(), value);
        let Some(profile_id) = self.identifier_index.get(&key).map(|e| *e) else {
            return Ok(None);
        };
        Ok(self.profiles.get(&profile_id).map(|p| p.clone()))
    }

    async fn find_by_any_value(&self, values: &[&str]) -> CdpResult<Vec<Profile>> {
        Ok(self
            .profiles
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .identifiers
                    .iter()
                    .any(|i| values.contains(&i.value.as_str()))
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn insert(&self, profile: Profile) -> CdpResult<()> {
        self.check_identifier_ownership(profile.profile_id, &profile.identifiers)?;
        self.reindex(profile.profile_id, &[], &profile.identifiers);
        debug!(profile_id = %profile.profile_id, "profile inserted");
        self.profiles.insert(profile.profile_id, profile);
        Ok(())
    }

    async fn update_if_version(
        &self,
        mut profile: Profile,
        expected_version: u64,
    ) -> CdpResult<Option<Profile>> {
        self.check_identifier_ownership(profile.profile_id, &profile.identifiers)?;
        let Some(mut entry) = self.profiles.get_mut(&profile.profile_id) else {
            return Err(CdpError::ProfileNotFound(profile.profile_id.to_string()));
        };
        if entry.version != expected_version {
            return Ok(None);
        }
        profile.version = expected_version + 1;
        profile.updated_at = Utc::now();
        let old_identifiers = entry.identifiers.clone();
        *entry = profile.clone();
        drop(entry);
        self.reindex(profile.profile_id, &old_identifiers, &profile.identifiers);
        Ok(Some(profile))
    }

    async fn delete(&self, profile_id: Uuid) -> CdpResult<bool> {
        let Some((_, profile)) = self.profiles.remove(&profile_id) else {
            return Ok(false);
        };
        for id in &profile.identifiers {
            self.identifier_index.remove(&id.index_key());
        }
        info!(profile_id = %profile_id, "profile deleted");
        Ok(true)
    }

    async fn delete_subject(&self, subject: &str) -> CdpResult<u64> {
        let targets: Vec<Uuid> = self
            .profiles
            .iter()
            .filter(|e| Self::matches_subject(e.value(), subject))
            .map(|e| *e.key())
            .collect();
        let mut removed = 0;
        for profile_id in targets {
            if self.delete(profile_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn residual_count(&self, subject: &str) -> CdpResult<u64> {
        Ok(self
            .profiles
            .iter()
            .filter(|e| Self::matches_subject(e.value(), subject))
            .count() as u64)
    }

    async fn find_by_segment(&self, segment: &str, limit: usize) -> CdpResult<Vec<Profile>> {
        Ok(self
            .profiles
            .iter()
            .filter(|e| e.value().segments.iter().any(|s| s == segment))
            .take(limit)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn count(&self) -> CdpResult<u64> {
        Ok(self.profiles.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_core::model::IdentifierType;

    fn profile_with_email(email: &str) -> Profile {
        let mut p = Profile::new();
        p.identifiers
            .push(Identifier::new(IdentifierType::Email, email).expect("valid identifier"));
        p
    }

    #[tokio::test]
    async fn test_insert_and_find_by_identifier() {
        let store = InMemoryProfileStore::new();
        let p = profile_with_email("s@x.edu");
        let id = p.profile_id;
        store.insert(p).await.unwrap();

        let found = store
            .find_by_identifier(IdentifierType::Email, "s@x.edu")
            .await
            .unwrap()
            .expect("profile present");
        assert_eq!(found.profile_id, id);
        assert_eq!(store.identifier_lookup_count(), 1);

        let missing = store
            .find_by_identifier(IdentifierType::Email, "other@x.edu")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_identifier_uniqueness_enforced() {
        let store = InMemoryProfileStore::new();
        store.insert(profile_with_email("s@x.edu")).await.unwrap();
        let dup = profile_with_email("s@x.edu");
        assert!(store.insert(dup).await.is_err());
    }

    #[tokio::test]
    async fn test_cas_conflict_returns_none() {
        let store = InMemoryProfileStore::new();
        let p = profile_with_email("s@x.edu");
        let id = p.profile_id;
        store.insert(p).await.unwrap();

        let read = store.get(id).await.unwrap().expect("present");
        assert_eq!(read.version, 0);

        // First writer wins.
        let winner = store
            .update_if_version(read.clone(), 0)
            .await
            .unwrap()
            .expect("first write succeeds");
        assert_eq!(winner.version, 1);

        // Second writer with the stale version loses.
        let loser = store.update_if_version(read, 0).await.unwrap();
        assert!(loser.is_none());
    }

    #[tokio::test]
    async fn test_update_reindexes_new_identifiers() {
        let store = InMemoryProfileStore::new();
        let p = profile_with_email("s@x.edu");
        let id = p.profile_id;
        store.insert(p).await.unwrap();

        let mut read = store.get(id).await.unwrap().expect("present");
        read.identifiers
            .push(Identifier::new(IdentifierType::Phone, "+49123456789").expect("valid"));
        store.update_if_version(read, 0).await.unwrap().expect("cas ok");

        let by_phone = store
            .find_by_identifier(IdentifierType::Phone, "+49123456789")
            .await
            .unwrap();
        assert!(by_phone.is_some());
    }

    #[tokio::test]
    async fn test_delete_subject_by_identifier_value() {
        let store = InMemoryProfileStore::new();
        store.insert(profile_with_email("s@x.edu")).await.unwrap();
        store.insert(profile_with_email("other@x.edu")).await.unwrap();

        assert_eq!(store.delete_subject("s@x.edu").await.unwrap(), 1);
        assert_eq!(store.residual_count("s@x.edu").await.unwrap(), 0);
        assert_eq!(store.count().await.unwrap(), 1);
        // Index entries are gone too.
        assert!(store
            .find_by_identifier(IdentifierType::Email, "s@x.edu")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_by_any_value_ignores_type() {
        let store = InMemoryProfileStore::new();
        let mut p = Profile::new();
        p.identifiers
            .push(Identifier::new(IdentifierType::Phone, "D1").expect("valid"));
        store.insert(p).await.unwrap();

        // Same value, different type in the query set.
        let candidates = store.find_by_any_value(&["D1"]).await.unwrap();
        assert_eq!(candidates.len(), 1);
    }
}
