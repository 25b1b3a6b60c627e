//! Field-level merge of synced data into existing records.
//!
//! The external source is authoritative for the fields it sends, except
//! on records the user has taken over by hand.

use crate::models::InvestmentRecord;
use crate::sync::traits::NormalizedRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    UsedSyncedValue,
    KeptManualOverride,
}

impl ConflictResolution {
    pub fn describe(&self) -> &'static str {
        match self {
            ConflictResolution::UsedSyncedValue => "used synced value",
            ConflictResolution::KeptManualOverride => "kept manual override",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub record_key: String,
    /// `None` when the whole record was kept.
    pub field: Option<String>,
    pub old: Option<serde_json::Value>,
    pub new: Option<serde_json::Value>,
    pub resolution: ConflictResolution,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub conflicts: Vec<FieldConflict>,
    /// Whether `fields` differs from what was stored.
    pub changed: bool,
}

pub fn merge_fields(
    record_key: &str,
    existing: &serde_json::Map<String, serde_json::Value>,
    manual_override: bool,
    synced: &serde_json::Map<String, serde_json::Value>,
) -> MergeOutcome {
    if manual_override {
        return MergeOutcome {
            fields: existing.clone(),
            conflicts: vec![FieldConflict {
                record_key: record_key.to_string(),
                field: None,
                old: None,
                new: None,
                resolution: ConflictResolution::KeptManualOverride,
            }],
            changed: false,
        };
    }

    let mut fields = existing.clone();
    let mut conflicts = Vec::new();
    let mut changed = false;
    for (name, new_value) in synced {
        match fields.get(name) {
            Some(old) if old == new_value => {}
            Some(old) => {
                conflicts.push(FieldConflict {
                    record_key: record_key.to_string(),
                    field: Some(name.clone()),
                    old: Some(old.clone()),
                    new: Some(new_value.clone()),
                    resolution: ConflictResolution::UsedSyncedValue,
                });
                fields.insert(name.clone(), new_value.clone());
                changed = true;
            }
            None => {
                fields.insert(name.clone(), new_value.clone());
                changed = true;
            }
        }
    }
    MergeOutcome {
        fields,
        conflicts,
        changed,
    }
}

pub fn merge_record(existing: &InvestmentRecord, synced: &NormalizedRecord) -> MergeOutcome {
    merge_fields(
        &existing.key,
        &existing.fields,
        existing.manual_override,
        &synced.fields,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn synced_values_win_and_unknown_fields_survive() {
        let out = merge_fields("k", &map(json!({"a": 1, "b": 2})), false, &map(json!({"a": 9, "c": 3})));
        assert_eq!(serde_json::Value::Object(out.fields), json!({"a": 9, "b": 2, "c": 3}));
        assert_eq!(out.conflicts.len(), 1);
        let c = &out.conflicts[0];
        assert_eq!(c.field.as_deref(), Some("a"));
        assert_eq!(c.old, Some(json!(1)));
        assert_eq!(c.new, Some(json!(9)));
        assert_eq!(c.resolution, ConflictResolution::UsedSyncedValue);
        assert!(out.changed);
    }

    #[test]
    fn manual_override_keeps_existing_verbatim() {
        let existing = map(json!({"a": 1, "b": 2, "note": "mine"}));
        let out = merge_fields("k", &existing, true, &map(json!({"a": 9, "c": 3})));
        assert_eq!(out.fields, existing);
        assert!(!out.changed);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(
            out.conflicts[0].resolution.describe(),
            "kept manual override"
        );
    }

    #[test]
    fn identical_values_are_not_conflicts() {
        let out = merge_fields("k", &map(json!({"a": 1})), false, &map(json!({"a": 1})));
        assert!(out.conflicts.is_empty());
        assert!(!out.changed);
    }
}
