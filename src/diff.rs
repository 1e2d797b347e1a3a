// 🔀 Batch Diff Engine - Staged rows vs. the authoritative directory
//
// preview() never writes. It matches every staged row to a directory record
// (employee code first, fallback id second), diffs the tracked fields,
// classifies each row by risk and collects anomalies for the apply gate.
//
// Per-row problems are accumulated, never fatal: one bad row does not stop
// the rest of the batch from being previewed.

use crate::config::DiffConfig;
use crate::db::{EmployeeRecord, Status, TrackedField};
use crate::entities::vendor::VendorCanonicalizer;
use crate::fields::{
    lookup, lookup_non_empty, normalize_code, Row, EMPLOYEE_CODE_KEYS, END_DATE_KEYS,
    FALLBACK_ID_KEYS, HIRE_DATE_KEYS, JOB_NUMBER_KEYS, NAME_KEYS, PAY_RATE_KEYS, PAY_TYPE_KEYS,
    PHONE_KEYS, PROJECT_KEYS, STATUS_KEYS, VENDOR_KEYS, WORK_GROUP_KEYS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Staged key aliases for every tracked field
const STAGED_FIELD_KEYS: &[(TrackedField, &[&str])] = &[
    (TrackedField::Name, NAME_KEYS),
    (TrackedField::Status, STATUS_KEYS),
    (TrackedField::WorkGroup, WORK_GROUP_KEYS),
    (TrackedField::Project, PROJECT_KEYS),
    (TrackedField::JobNumber, JOB_NUMBER_KEYS),
    (TrackedField::Vendor, VENDOR_KEYS),
    (TrackedField::PayRate, PAY_RATE_KEYS),
    (TrackedField::PayType, PAY_TYPE_KEYS),
    (TrackedField::Phone, PHONE_KEYS),
    (TrackedField::HireDate, HIRE_DATE_KEYS),
    (TrackedField::EndDate, END_DATE_KEYS),
];

// ============================================================================
// CHANGE ROWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchedVia {
    Code,
    Fallback,
}

/// Row classification, highest risk first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Terminated,
    Deactivated,
    Reactivated,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: TrackedField,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRow {
    /// Matched employee code
    pub key: String,

    /// Position of the staged row within its batch
    pub row_index: usize,

    /// Secondary id the row was matched on, when matched by fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_id: Option<String>,

    pub before: EmployeeRecord,
    pub after: EmployeeRecord,
    pub field_diffs: Vec<FieldDiff>,
    pub status_before: Status,
    pub status_after: Status,
    pub wage_before: String,
    pub wage_after: String,
    pub wage_decrease: bool,
    pub reason: ChangeKind,
    pub matched_via: MatchedVia,
}

impl ChangeRow {
    pub fn changes_field(&self, field: TrackedField) -> bool {
        self.field_diffs.iter().any(|d| d.field == field)
    }
}

// ============================================================================
// CLASSIFICATION (ordered rules, first match wins)
// ============================================================================

type ClassificationCheck = fn(&ChangeRow) -> bool;

pub const CLASSIFICATION_RULES: &[(ChangeKind, ClassificationCheck)] = &[
    (ChangeKind::Terminated, is_termination),
    (ChangeKind::Deactivated, is_deactivation),
    (ChangeKind::Reactivated, is_reactivation),
    (ChangeKind::Updated, has_field_changes),
];

fn is_termination(row: &ChangeRow) -> bool {
    row.status_after == Status::Terminated && row.status_before != Status::Terminated
}

fn is_deactivation(row: &ChangeRow) -> bool {
    row.status_before == Status::Active && row.status_after == Status::Inactive
}

fn is_reactivation(row: &ChangeRow) -> bool {
    row.status_before == Status::Inactive && row.status_after == Status::Active
}

fn has_field_changes(row: &ChangeRow) -> bool {
    !row.field_diffs.is_empty()
}

pub fn classify(row: &ChangeRow) -> ChangeKind {
    CLASSIFICATION_RULES
        .iter()
        .find(|(_, check)| check(row))
        .map(|(kind, _)| *kind)
        .unwrap_or(ChangeKind::Unchanged)
}

// ============================================================================
// WAGES
// ============================================================================

/// Parse a currency-formatted wage; anything unreadable is NaN
///
/// Every character except digits, '.' and '-' is stripped first, so
/// "$1,250.00/hr" reads as 1250.0.
pub fn parse_wage(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    cleaned.parse::<f64>().unwrap_or(f64::NAN)
}

/// Both sides finite and the new wage strictly lower
pub fn is_wage_decrease(before: &str, after: &str) -> bool {
    let (b, a) = (parse_wage(before), parse_wage(after));
    b.is_finite() && a.is_finite() && a < b
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub staged: usize,
    pub matched: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub unmatched: usize,
    pub terminated: usize,
    pub deactivated: usize,
    pub reactivated: usize,
    pub updated: usize,
    pub fallback_matches: usize,
    pub duplicate_keys: usize,
    pub wage_decreases: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub row_index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomalies {
    /// Employee codes matched by more than one staged row
    pub duplicate_codes: Vec<String>,
    /// Secondary ids used in place of a missing employee code
    pub fallback_keys: Vec<String>,
    /// Codes / ids that matched no directory record
    pub unmatched_keys: Vec<String>,
    pub row_errors: Vec<RowError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewReport {
    pub totals: Totals,
    pub changes: Vec<ChangeRow>,
    pub anomalies: Anomalies,
    /// SHA-256 of the serialized change-set
    pub digest: String,
    pub generated_at: DateTime<Utc>,
}

impl PreviewReport {
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.reason == kind).count()
    }

    pub fn has_duplicates(&self) -> bool {
        !self.anomalies.duplicate_codes.is_empty()
    }

    pub fn summary(&self) -> String {
        let t = &self.totals;
        format!(
            "{} staged, {} matched, {} changed ({} terminated, {} deactivated, {} reactivated, {} updated), {} unchanged, {} unmatched, {} errors",
            t.staged,
            t.matched,
            t.changed,
            t.terminated,
            t.deactivated,
            t.reactivated,
            t.updated,
            t.unchanged,
            t.unmatched,
            t.errors
        )
    }
}

/// Hex SHA-256 of the serialized change-set
pub fn digest_changes(changes: &[ChangeRow]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(changes).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// DIFF ENGINE
// ============================================================================

enum RowOutcome {
    Matched(Box<ChangeRow>),
    Unmatched(String),
    Failed(String),
}

pub struct DiffEngine {
    canonicalizer: Arc<VendorCanonicalizer>,
    config: DiffConfig,
}

impl DiffEngine {
    pub fn new(canonicalizer: Arc<VendorCanonicalizer>, config: DiffConfig) -> Self {
        DiffEngine {
            canonicalizer,
            config,
        }
    }

    /// Diff a staging batch against the canonical directory
    pub fn preview(&self, staging: &[Row], canonical: &[EmployeeRecord]) -> PreviewReport {
        let by_code: HashMap<String, &EmployeeRecord> = canonical
            .iter()
            .map(|r| (normalize_code(&r.code), r))
            .collect();
        // Several records may share one secondary id; such ids never match
        let mut by_alt_id: HashMap<String, Vec<&EmployeeRecord>> = HashMap::new();
        for record in canonical.iter().filter(|r| !r.alt_id.trim().is_empty()) {
            by_alt_id
                .entry(normalize_code(&record.alt_id))
                .or_default()
                .push(record);
        }

        let mut totals = Totals {
            staged: staging.len(),
            ..Default::default()
        };
        let mut anomalies = Anomalies::default();
        let mut changes = Vec::new();
        let mut seen_codes: BTreeMap<String, usize> = BTreeMap::new();

        for (row_index, row) in staging.iter().enumerate() {
            match self.diff_row(row_index, row, &by_code, &by_alt_id) {
                RowOutcome::Matched(change) => {
                    totals.matched += 1;
                    if let Some(fallback_id) = &change.fallback_id {
                        totals.fallback_matches += 1;
                        anomalies.fallback_keys.push(fallback_id.clone());
                    }

                    let counts_for_duplicates =
                        change.reason != ChangeKind::Unchanged || self.config.duplicates_include_unchanged;
                    if counts_for_duplicates {
                        *seen_codes.entry(change.key.clone()).or_insert(0) += 1;
                    }

                    match change.reason {
                        ChangeKind::Unchanged => totals.unchanged += 1,
                        ChangeKind::Terminated => totals.terminated += 1,
                        ChangeKind::Deactivated => totals.deactivated += 1,
                        ChangeKind::Reactivated => totals.reactivated += 1,
                        ChangeKind::Updated => totals.updated += 1,
                    }
                    if change.reason != ChangeKind::Unchanged {
                        if change.wage_decrease {
                            totals.wage_decreases += 1;
                        }
                        changes.push(*change);
                    }
                }
                RowOutcome::Unmatched(key) => {
                    totals.unmatched += 1;
                    anomalies.unmatched_keys.push(key);
                }
                RowOutcome::Failed(message) => {
                    tracing::debug!(row_index, %message, "staged row rejected");
                    anomalies.row_errors.push(RowError { row_index, message });
                }
            }
        }

        anomalies.duplicate_codes = seen_codes
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(code, _)| code)
            .collect();

        totals.changed = changes.len();
        totals.duplicate_keys = anomalies.duplicate_codes.len();
        totals.errors = anomalies.row_errors.len();

        let digest = digest_changes(&changes);

        tracing::info!(
            staged = totals.staged,
            changes = totals.changed,
            unmatched = totals.unmatched,
            errors = totals.errors,
            duplicates = totals.duplicate_keys,
            "preview computed"
        );

        PreviewReport {
            totals,
            changes,
            anomalies,
            digest,
            generated_at: Utc::now(),
        }
    }

    fn diff_row(
        &self,
        row_index: usize,
        row: &Row,
        by_code: &HashMap<String, &EmployeeRecord>,
        by_alt_id: &HashMap<String, Vec<&EmployeeRecord>>,
    ) -> RowOutcome {
        let (before, matched_via, fallback_id) =
            match lookup_non_empty(row, EMPLOYEE_CODE_KEYS).map(|c| normalize_code(&c)) {
                Some(code) => match by_code.get(&code) {
                    Some(record) => (*record, MatchedVia::Code, None),
                    None => return RowOutcome::Unmatched(code),
                },
                None => match lookup_non_empty(row, FALLBACK_ID_KEYS).map(|c| normalize_code(&c)) {
                    Some(alt_id) => match by_alt_id.get(&alt_id).map(Vec::as_slice) {
                        Some([record]) => (*record, MatchedVia::Fallback, Some(alt_id)),
                        Some(shared) if shared.len() > 1 => {
                            return RowOutcome::Failed(format!(
                                "Fallback id {} is shared by {} directory records",
                                alt_id,
                                shared.len()
                            ))
                        }
                        _ => return RowOutcome::Unmatched(alt_id),
                    },
                    None => {
                        return RowOutcome::Failed(
                            "Row has neither an employee code nor a fallback id".to_string(),
                        )
                    }
                },
            };

        let after = match self.staged_after(before, row) {
            Ok(after) => after,
            Err(message) => return RowOutcome::Failed(format!("{}: {}", before.code, message)),
        };

        let field_diffs = self.field_diffs(before, &after);
        let mut change = ChangeRow {
            key: normalize_code(&before.code),
            row_index,
            fallback_id,
            status_before: before.effective_status(),
            status_after: after.effective_status(),
            wage_before: before.pay_rate.clone(),
            wage_after: after.pay_rate.clone(),
            wage_decrease: is_wage_decrease(&before.pay_rate, &after.pay_rate),
            before: before.clone(),
            after,
            field_diffs,
            reason: ChangeKind::Unchanged,
            matched_via,
        };
        change.reason = classify(&change);

        RowOutcome::Matched(Box::new(change))
    }

    /// The record as it would look with the staged values written onto it
    fn staged_after(&self, before: &EmployeeRecord, row: &Row) -> Result<EmployeeRecord, String> {
        let mut after = before.clone();

        for (field, aliases) in STAGED_FIELD_KEYS {
            // An absent key means "not supplied"
            let Some(value) = lookup(row, aliases) else {
                continue;
            };

            match field {
                TrackedField::Name if value.trim().is_empty() => {
                    return Err("name cannot be cleared".to_string());
                }
                TrackedField::Vendor => {
                    after.vendor = self.canonicalizer.normalize(&value);
                }
                _ => after.set_field(*field, &value),
            }
        }

        after.status = after.effective_status();
        Ok(after)
    }

    fn field_diffs(&self, before: &EmployeeRecord, after: &EmployeeRecord) -> Vec<FieldDiff> {
        TrackedField::ALL
            .iter()
            .filter(|field| {
                let (b, a) = match field {
                    TrackedField::Status => (
                        before.effective_status().as_str().to_string(),
                        after.effective_status().as_str().to_string(),
                    ),
                    TrackedField::Vendor => (
                        self.canonicalizer.normalize(&before.vendor),
                        self.canonicalizer.normalize(&after.vendor),
                    ),
                    _ => (before.field(**field), after.field(**field)),
                };
                b.trim() != a.trim()
            })
            .map(|field| FieldDiff {
                field: *field,
                before: before.field(*field),
                after: after.field(*field),
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
