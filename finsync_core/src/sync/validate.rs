//! Per-field constraints on fetched records.
//!
//! Each investment type has an identifier format and a set of numeric
//! fields with bounds. A record that breaks any rule is dropped from the
//! apply set and reported; the rest of the batch is unaffected.

use crate::models::InvestmentType;
use crate::recovery::classify::{SyncError, SyncErrorKind};
use crate::sync::traits::{json_type_name, RawRecord};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: &'static str,
    pub required: bool,
    pub min: f64,
    pub max: f64,
}

const fn amount(field: &'static str, required: bool, max: f64) -> FieldRule {
    FieldRule {
        field,
        required,
        min: 0.0,
        max,
    }
}

const fn rate(field: &'static str) -> FieldRule {
    FieldRule {
        field,
        required: false,
        min: 0.0,
        max: 100.0,
    }
}

#[derive(Debug)]
pub struct RecordRules {
    pub identifier: Regex,
    pub identifier_hint: &'static str,
    pub fields: Vec<FieldRule>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub valid: Vec<RawRecord>,
    pub errors: Vec<SyncError>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

fn build_rules() -> HashMap<InvestmentType, RecordRules> {
    let rules = |pattern: &str, hint: &'static str, fields: Vec<FieldRule>| RecordRules {
        identifier: Regex::new(pattern).expect("static identifier pattern"),
        identifier_hint: hint,
        fields,
    };

    HashMap::from([
        (
            InvestmentType::MutualFund,
            rules(
                r"^[A-Z]{2}[A-Z0-9]{9}[0-9]$",
                "a 12-character ISIN",
                vec![
                    amount("nav", true, 1_000_000.0),
                    amount("units", false, 1e12),
                    amount("current_value", false, 1e12),
                ],
            ),
        ),
        (
            InvestmentType::ProvidentFund,
            rules(
                r"^[0-9]{12}$",
                "a 12-digit account number",
                vec![
                    amount("balance", true, 1e12),
                    amount("employee_contribution", false, 1e12),
                    amount("employer_contribution", false, 1e12),
                    rate("interest_rate"),
                ],
            ),
        ),
        (
            InvestmentType::Stock,
            rules(
                r"^[A-Z0-9][A-Z0-9.&-]{0,19}$",
                "an exchange ticker",
                vec![
                    amount("price", true, 1e9),
                    amount("quantity", false, 1e12),
                ],
            ),
        ),
        (
            InvestmentType::FixedDeposit,
            rules(
                r"^[A-Za-z0-9-]{4,32}$",
                "a 4-32 character deposit number",
                vec![
                    amount("principal", true, 1e12),
                    amount("maturity_amount", false, 1e12),
                    rate("interest_rate"),
                ],
            ),
        ),
        (
            InvestmentType::Sip,
            rules(
                r"^[A-Za-z0-9-]{4,32}$",
                "a 4-32 character plan reference",
                vec![
                    amount("amount", true, 1e9),
                    amount("nav", false, 1_000_000.0),
                ],
            ),
        ),
    ])
}

pub fn rules_for(investment_type: InvestmentType) -> Option<&'static RecordRules> {
    static RULES: OnceLock<HashMap<InvestmentType, RecordRules>> = OnceLock::new();
    RULES.get_or_init(build_rules).get(&investment_type)
}

fn numeric(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Check one record. Returns the first broken rule.
pub fn validate_record(rules: &RecordRules, record: &RawRecord) -> Result<(), String> {
    if !rules.identifier.is_match(&record.key) {
        return Err(format!(
            "identifier '{}' is not {}",
            record.key, rules.identifier_hint
        ));
    }
    let obj = record.payload.as_object().ok_or_else(|| {
        format!(
            "payload must be an object, got {}",
            json_type_name(&record.payload)
        )
    })?;

    for rule in &rules.fields {
        let value = match obj.get(rule.field) {
            None | Some(serde_json::Value::Null) if rule.required => {
                return Err(format!("missing required field '{}'", rule.field));
            }
            None | Some(serde_json::Value::Null) => continue,
            Some(v) => v,
        };
        let n = numeric(value)
            .filter(|n| n.is_finite())
            .ok_or_else(|| format!("field '{}' must be a number", rule.field))?;
        if n < rule.min {
            return Err(format!(
                "field '{}' must be >= {}, got {n}",
                rule.field, rule.min
            ));
        }
        if n > rule.max {
            return Err(format!(
                "field '{}' must be <= {}, got {n}",
                rule.field, rule.max
            ));
        }
    }
    Ok(())
}

/// Split a batch into records that pass and `data_validation_failed` errors.
pub fn validate_records(investment_type: InvestmentType, records: &[RawRecord]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(rules) = rules_for(investment_type) else {
        report.valid = records.to_vec();
        return report;
    };
    for record in records {
        match validate_record(rules, record) {
            Ok(()) => report.valid.push(record.clone()),
            Err(reason) => {
                tracing::debug!(key = %record.key, %reason, "record failed validation");
                report.errors.push(
                    SyncError::new(SyncErrorKind::DataValidationFailed, reason)
                        .for_record(record.key.clone()),
                );
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bad_record_does_not_abort_batch() {
        let records = vec![
            RawRecord::new("100200300400", json!({"balance": 1500.0})),
            RawRecord::new("12345", json!({"balance": 10.0})),
            RawRecord::new("100200300401", json!({"balance": -3})),
            RawRecord::new("100200300402", json!({"balance": "2500.50"})),
        ];
        let report = validate_records(InvestmentType::ProvidentFund, &records);

        let valid: Vec<&str> = report.valid.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(valid, vec!["100200300400", "100200300402"]);
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .all(|e| e.kind == SyncErrorKind::DataValidationFailed));
        assert_eq!(report.errors[0].record_key.as_deref(), Some("12345"));
        assert!(report.errors[0].message.contains("12-digit"));
        assert!(report.errors[1].message.contains(">= 0"));
    }

    #[test]
    fn required_and_maximum_bounds() {
        let rules = rules_for(InvestmentType::MutualFund).unwrap();
        assert!(validate_record(rules, &RawRecord::new("INF209K01YN0", json!({"nav": 45.2}))).is_ok());
        let missing = validate_record(rules, &RawRecord::new("INF209K01YN0", json!({"units": 1})));
        assert!(missing.unwrap_err().contains("missing required field 'nav'"));
        let too_big =
            validate_record(rules, &RawRecord::new("INF209K01YN0", json!({"nav": 5e6})));
        assert!(too_big.unwrap_err().contains("<="));
        let not_number =
            validate_record(rules, &RawRecord::new("INF209K01YN0", json!({"nav": "abc"})));
        assert!(not_number.unwrap_err().contains("must be a number"));
    }

    #[test]
    fn every_type_has_rules() {
        for t in InvestmentType::ALL {
            assert!(rules_for(t).is_some(), "{t}");
        }
    }
}
