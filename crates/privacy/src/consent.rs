//! Per-channel consent with a full audit trail.
//!
//! Every mutation appends an audit entry before the new state becomes
//! visible; a mutation without its audit entry never happens. Merging two
//! subjects' consent is most-restrictive: a channel stays consented only if
//! both sides consented.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use cdp_core::config::ConsentConfig;
use cdp_core::error::{CdpError, CdpResult};
use cdp_core::model::ConsentState;

/// The communication channels consent is tracked for.
pub const CHANNELS: [&str; 6] = ["email", "whatsapp", "push", "sms", "analytics", "profiling"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentSource {
    StudentPortal,
    Api,
    Import,
}

/// Aggregate consent state for one student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub student_id: String,
    pub channels: BTreeMap<String, ConsentState>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl ConsentRecord {
    fn empty(student_id: &str) -> Self {
        let now = Utc::now();
        Self {
            student_id: student_id.to_string(),
            channels: BTreeMap::new(),
            created_at: now,
            last_modified: now,
        }
    }
}

/// One audited consent transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentAuditEntry {
    pub student_id: String,
    pub channel: String,
    pub old_value: Option<bool>,
    pub new_value: bool,
    pub legal_basis: String,
    pub terms_version: String,
    pub source: ConsentSource,
    pub timestamp: DateTime<Utc>,
}

/// Consent store + append-only audit log.
pub struct ConsentManager {
    records: DashMap<String, ConsentRecord>,
    audit: RwLock<Vec<ConsentAuditEntry>>,
    terms_version: String,
}

impl ConsentManager {
    pub fn new(config: &ConsentConfig) -> Self {
        Self {
            records: DashMap::new(),
            audit: RwLock::new(Vec::new()),
            terms_version: config.terms_version.clone(),
        }
    }

    /// Full per-channel record; empty if the student is unknown.
    pub fn get_consent(&self, student_id: &str) -> ConsentRecord {
        self.records
            .get(student_id)
            .map(|r| r.clone())
            .unwrap_or_else(|| ConsentRecord::empty(student_id))
    }

    /// Update one channel and log the transition. Idempotent updates still
    /// produce an audit entry.
    pub fn update_consent(
        &self,
        student_id: &str,
        channel: &str,
        consented: bool,
        legal_basis: &str,
        source: ConsentSource,
    ) -> CdpResult<()> {
        if !CHANNELS.contains(&channel) {
            return Err(CdpError::Validation(format!(
                "unknown consent channel: {channel}"
            )));
        }

        let now = Utc::now();
        let old_value = self
            .records
            .get(student_id)
            .and_then(|r| r.channels.get(channel).map(|s| s.consented));

        // Audit first: the mutation is durable only once the trail has it.
        self.audit.write().push(ConsentAuditEntry {
            student_id: student_id.to_string(),
            channel: channel.to_string(),
            old_value,
            new_value: consented,
            legal_basis: legal_basis.to_string(),
            terms_version: self.terms_version.clone(),
            source,
            timestamp: now,
        });

        let mut record = self
            .records
            .entry(student_id.to_string())
            .or_insert_with(|| ConsentRecord::empty(student_id));
        record.channels.insert(
            channel.to_string(),
            ConsentState {
                consented,
                legal_basis: legal_basis.to_string(),
                terms_version: self.terms_version.clone(),
                updated_at: now,
            },
        );
        record.last_modified = now;
        drop(record);

        info!(
            student_id = student_id,
            channel = channel,
            consented = consented,
            "consent updated"
        );
        Ok(())
    }

    /// Boolean gate for pre-action checks; false when no record exists.
    pub fn check_consent(&self, student_id: &str, channel: &str) -> bool {
        self.records
            .get(student_id)
            .and_then(|r| r.channels.get(channel).map(|s| s.consented))
            .unwrap_or(false)
    }

    /// Merge `secondary` into `primary` with the most-restrictive rule,
    /// then delete the secondary record.
    pub fn merge_consent(&self, primary_id: &str, secondary_id: &str) -> CdpResult<()> {
        let primary = self.get_consent(primary_id);
        let secondary = self.get_consent(secondary_id);

        for channel in CHANNELS {
            let p_entry = primary.channels.get(channel);
            let p = p_entry.map(|s| s.consented).unwrap_or(false);
            let s = secondary
                .channels
                .get(channel)
                .map(|s| s.consented)
                .unwrap_or(false);
            let merged = p && s;
            if p_entry.map(|e| e.consented != merged).unwrap_or(true) {
                self.update_consent(
                    primary_id,
                    channel,
                    merged,
                    "legitimate_interest",
                    ConsentSource::Api,
                )?;
            }
        }

        self.records.remove(secondary_id);
        info!(
            primary = primary_id,
            secondary = secondary_id,
            "consent records merged"
        );
        Ok(())
    }

    /// Batch gate for campaign pre-flight.
    pub fn bulk_check(&self, student_ids: &[String], channel: &str) -> BTreeMap<String, bool> {
        student_ids
            .iter()
            .map(|id| (id.clone(), self.check_consent(id, channel)))
            .collect()
    }

    /// Complete audit trail for one student, oldest first.
    pub fn audit_log(&self, student_id: &str) -> Vec<ConsentAuditEntry> {
        self.audit
            .read()
            .iter()
            .filter(|e| e.student_id == student_id)
            .cloned()
            .collect()
    }

    /// Hard-delete the subject's consent record and audit entries
    /// (right-to-erasure). Returns records removed.
    pub fn erase_subject(&self, student_id: &str) -> u64 {
        let mut removed = 0;
        if self.records.remove(student_id).is_some() {
            removed += 1;
        }
        let mut audit = self.audit.write();
        let before = audit.len();
        audit.retain(|e| e.student_id != student_id);
        removed + (before - audit.len()) as u64
    }

    /// Records still referencing the subject.
    pub fn residual_count(&self, student_id: &str) -> u64 {
        let record = u64::from(self.records.contains_key(student_id));
        let audit = self
            .audit
            .read()
            .iter()
            .filter(|e| e.student_id == student_id)
            .count() as u64;
        record + audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_core::config::ConsentConfig;

    fn manager() -> ConsentManager {
        ConsentManager::new(&ConsentConfig::default())
    }

    #[test]
    fn test_unknown_student_has_empty_record() {
        let m = manager();
        let record = m.get_consent("s-1");
        assert!(record.channels.is_empty());
        assert!(!m.check_consent("s-1", "email"));
    }

    #[test]
    fn test_update_writes_audit_entry() {
        let m = manager();
        m.update_consent("s-1", "email", true, "explicit_consent", ConsentSource::StudentPortal)
            .unwrap();
        assert!(m.check_consent("s-1", "email"));

        let log = m.audit_log("s-1");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].old_value, None);
        assert!(log[0].new_value);
        assert_eq!(log[0].terms_version, "v2.1");
        assert_eq!(log[0].source, ConsentSource::StudentPortal);
    }

    #[test]
    fn test_idempotent_update_still_audited() {
        let m = manager();
        m.update_consent("s-1", "email", true, "consent", ConsentSource::Api)
            .unwrap();
        m.update_consent("s-1", "email", true, "consent", ConsentSource::Api)
            .unwrap();
        let log = m.audit_log("s-1");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].old_value, Some(true));
    }

    #[test]
    fn test_invalid_channel_rejected_without_audit() {
        let m = manager();
        assert!(m
            .update_consent("s-1", "telepathy", true, "consent", ConsentSource::Api)
            .is_err());
        assert!(m.audit_log("s-1").is_empty());
    }

    #[test]
    fn test_restrictive_merge() {
        let m = manager();
        m.update_consent("primary", "email", true, "consent", ConsentSource::Api)
            .unwrap();
        m.update_consent("primary", "whatsapp", true, "consent", ConsentSource::Api)
            .unwrap();
        m.update_consent("secondary", "email", false, "consent", ConsentSource::Api)
            .unwrap();
        m.update_consent("secondary", "whatsapp", true, "consent", ConsentSource::Api)
            .unwrap();

        m.merge_consent("primary", "secondary").unwrap();

        assert!(!m.check_consent("primary", "email"));
        assert!(m.check_consent("primary", "whatsapp"));
        // Secondary record is gone.
        assert!(m.get_consent("secondary").channels.is_empty());
    }

    #[test]
    fn test_merge_is_commutative() {
        let seed = |m: &ConsentManager, a: &str, b: &str| {
            m.update_consent(a, "email", true, "consent", ConsentSource::Api).unwrap();
            m.update_consent(a, "whatsapp", true, "consent", ConsentSource::Api).unwrap();
            m.update_consent(a, "sms", false, "consent", ConsentSource::Api).unwrap();
            m.update_consent(b, "email", false, "consent", ConsentSource::Api).unwrap();
            m.update_consent(b, "whatsapp", true, "consent", ConsentSource::Api).unwrap();
            m.update_consent(b, "push", true, "consent", ConsentSource::Api).unwrap();
        };

        let forward = manager();
        seed(&forward, "a", "b");
        forward.merge_consent("a", "b").unwrap();

        let backward = manager();
        seed(&backward, "a", "b");
        backward.merge_consent("b", "a").unwrap();

        for channel in CHANNELS {
            assert_eq!(
                forward.check_consent("a", channel),
                backward.check_consent("b", channel),
                "channel {channel} diverged"
            );
        }
    }

    #[test]
    fn test_merged_channels_use_legitimate_interest_basis() {
        let m = manager();
        m.update_consent("a", "email", true, "explicit_consent", ConsentSource::StudentPortal)
            .unwrap();
        m.update_consent("b", "email", true, "explicit_consent", ConsentSource::StudentPortal)
            .unwrap();
        m.merge_consent("a", "b").unwrap();

        // Unchanged value (true && true) writes no new entry.
        let record = m.get_consent("a");
        assert_eq!(record.channels["email"].legal_basis, "explicit_consent");

        // A changed channel is re-stamped under legitimate_interest.
        let m2 = manager();
        m2.update_consent("a", "email", true, "explicit_consent", ConsentSource::StudentPortal)
            .unwrap();
        m2.merge_consent("a", "b").unwrap();
        let record = m2.get_consent("a");
        assert_eq!(record.channels["email"].legal_basis, "legitimate_interest");
        assert!(!record.channels["email"].consented);
    }

    #[test]
    fn test_bulk_check() {
        let m = manager();
        m.update_consent("s-1", "email", true, "consent", ConsentSource::Api)
            .unwrap();
        let result = m.bulk_check(
            &["s-1".to_string(), "s-2".to_string()],
            "email",
        );
        assert!(result["s-1"]);
        assert!(!result["s-2"]);
    }

    #[test]
    fn test_erase_subject_removes_record_and_audit() {
        let m = manager();
        m.update_consent("s-1", "email", true, "consent", ConsentSource::Api)
            .unwrap();
        m.update_consent("s-2", "email", true, "consent", ConsentSource::Api)
            .unwrap();

        let removed = m.erase_subject("s-1");
        assert_eq!(removed, 2);
        assert_eq!(m.residual_count("s-1"), 0);
        // Other subjects untouched.
        assert_eq!(m.residual_count("s-2"), 2);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use cdp_core::config::ConsentConfig;
    use proptest::prelude::*;

    proptest! {
        /// merge(A,B) and merge(B,A) agree on every channel.
        #[test]
        fn prop_merge_commutative(states in proptest::collection::vec((any::<bool>(), any::<bool>()), 6)) {
            let seed = |m: &ConsentManager| {
                for (i, (a, b)) in states.iter().enumerate() {
                    let channel = CHANNELS[i];
                    m.update_consent("a", channel, *a, "consent", ConsentSource::Api).unwrap();
                    m.update_consent("b", channel, *b, "consent", ConsentSource::Api).unwrap();
                }
            };

            let forward = ConsentManager::new(&ConsentConfig::default());
            seed(&forward);
            forward.merge_consent("a", "b").unwrap();

            let backward = ConsentManager::new(&ConsentConfig::default());
            seed(&backward);
            backward.merge_consent("b", "a").unwrap();

            for channel in CHANNELS {
                prop_assert_eq!(
                    forward.check_consent("a", channel),
                    backward.check_consent("b", channel)
                );
            }
        }
    }
}
