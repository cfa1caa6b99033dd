//! Append-only audit trail for identity decisions: profile creation,
//! merges, and review flags for mid-confidence matches awaiting operator
//! review.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IdentityAuditEntry {
    Create {
        profile_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Merge {
        primary_id: Uuid,
        secondary_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ReviewFlag {
        candidate_id: Uuid,
        confidence: f64,
        event_snapshot: Value,
        timestamp: DateTime<Utc>,
    },
}

impl IdentityAuditEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            IdentityAuditEntry::Create { timestamp, .. }
            | IdentityAuditEntry::Merge { timestamp, .. }
            | IdentityAuditEntry::ReviewFlag { timestamp, .. } => *timestamp,
        }
    }
}

/// Append-only, in insertion order.
#[derive(Default)]
pub struct IdentityAuditLog {
    entries: RwLock<Vec<IdentityAuditEntry>>,
}

impl IdentityAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: IdentityAuditEntry) {
        self.entries.write().push(entry);
    }

    pub fn entries(&self) -> Vec<IdentityAuditEntry> {
        self.entries.read().clone()
    }

    /// Pending review flags, oldest first.
    pub fn review_flags(&self) -> Vec<IdentityAuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| matches!(e, IdentityAuditEntry::ReviewFlag { .. }))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_filter() {
        let log = IdentityAuditLog::new();
        log.record(IdentityAuditEntry::Create {
            profile_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        });
        log.record(IdentityAuditEntry::ReviewFlag {
            candidate_id: Uuid::new_v4(),
            confidence: 0.8,
            event_snapshot: serde_json::json!({}),
            timestamp: Utc::now(),
        });
        assert_eq!(log.len(), 2);
        assert_eq!(log.review_flags().len(), 1);
    }

    #[test]
    fn test_serializes_with_action_tag() {
        let entry = IdentityAuditEntry::Merge {
            primary_id: Uuid::new_v4(),
            secondary_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&entry).expect("serializable");
        assert_eq!(json["action"], "merge");
    }
}
