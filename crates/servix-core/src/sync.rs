//! Record and metadata types consumed by offline reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Bookkeeping kept 1:1 with every syncable record.
///
/// `deleted_at` marks a tombstone: the record is gone but the fact that it
/// was deleted is kept so peers can converge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub uid: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SyncMetadata {
    /// Metadata for a record created at `at`.
    pub fn created(uid: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            uid: uid.into(),
            created_at: at,
            updated_at: None,
            deleted_at: None,
        }
    }

    /// Latest known modification: `updated_at`, falling back to `created_at`.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A data record identified by a stable uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub uid: String,
    pub payload: Value,
}

impl SyncRecord {
    pub fn new(uid: impl Into<String>, payload: Value) -> Self {
        Self {
            uid: uid.into(),
            payload,
        }
    }
}

/// The slice of data a reconciliation covers: a model plus an equality
/// filter on top-level payload fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncScope {
    pub model: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub filter: Map<String, Value>,
}

impl SyncScope {
    /// Scope covering every record of `model`.
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            filter: Map::new(),
        }
    }

    /// Adds an equality constraint.
    #[must_use]
    pub fn with_filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter.insert(field.into(), value);
        self
    }

    /// Returns true if `payload` satisfies every filter constraint.
    pub fn matches(&self, payload: &Value) -> bool {
        self.filter
            .iter()
            .all(|(field, expected)| payload.get(field) == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_last_modified_falls_back_to_created() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut meta = SyncMetadata::created("a", created);
        assert_eq!(meta.last_modified(), created);

        let updated = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        meta.updated_at = Some(updated);
        assert_eq!(meta.last_modified(), updated);
    }

    #[test]
    fn test_scope_filter_matching() {
        let scope = SyncScope::model("Post").with_filter("author", json!(1));
        assert!(scope.matches(&json!({"author": 1, "title": "x"})));
        assert!(!scope.matches(&json!({"author": 2})));
        assert!(!scope.matches(&json!({"title": "no author"})));
        assert!(SyncScope::model("Post").matches(&json!({})));
    }

    #[test]
    fn test_metadata_omits_absent_timestamps() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let json = serde_json::to_value(SyncMetadata::created("a", created)).unwrap();
        assert!(json.get("updated_at").is_none());
        assert!(json.get("deleted_at").is_none());
    }
}
