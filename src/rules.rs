// 🚦 Apply Gate - Rules as Data
// Decides whether a computed preview may be committed to the directory.
//
// Checks run in a fixed order and the first failing one wins. The scope only
// filters what is displayed; gating always looks at the full change-set.

use crate::diff::{ChangeKind, ChangeRow, MatchedVia, PreviewReport};
use serde::{Deserialize, Serialize};

// ============================================================================
// RULES & SCOPE
// ============================================================================

/// Operator acknowledgements. Everything defaults to "not acknowledged".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRules {
    #[serde(default)]
    pub allow_fallback_match: bool,
    #[serde(default)]
    pub ack_deactivations: bool,
    #[serde(default)]
    pub ack_terminations: bool,
    #[serde(default)]
    pub ack_wage_decreases: bool,
    #[serde(default)]
    pub ack_mapping: bool,
}

impl ApplyRules {
    /// Every acknowledgement given
    pub fn all_acknowledged() -> Self {
        ApplyRules {
            allow_fallback_match: true,
            ack_deactivations: true,
            ack_terminations: true,
            ack_wage_decreases: true,
            ack_mapping: true,
        }
    }
}

/// Which kinds of change rows are selected for display / writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyScope {
    #[serde(default = "default_true")]
    pub deactivations: bool,
    #[serde(default = "default_true")]
    pub terminations: bool,
    #[serde(default = "default_true")]
    pub reactivations: bool,
    #[serde(default = "default_true")]
    pub other_updates: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ApplyScope {
    fn default() -> Self {
        ApplyScope {
            deactivations: true,
            terminations: true,
            reactivations: true,
            other_updates: true,
        }
    }
}

impl ApplyScope {
    pub fn includes(&self, change: &ChangeRow) -> bool {
        match change.reason {
            ChangeKind::Deactivated => self.deactivations,
            ChangeKind::Terminated => self.terminations,
            ChangeKind::Reactivated => self.reactivations,
            ChangeKind::Updated => self.other_updates,
            ChangeKind::Unchanged => false,
        }
    }

    pub fn filter<'a>(&self, changes: &'a [ChangeRow]) -> Vec<&'a ChangeRow> {
        changes.iter().filter(|c| self.includes(c)).collect()
    }
}

// ============================================================================
// GATE DECISION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Rows the scope selects; display only
    pub in_scope: usize,
}

impl GateDecision {
    fn blocked(reason: String, in_scope: usize) -> Self {
        GateDecision {
            allowed: false,
            reason: Some(reason),
            in_scope,
        }
    }
}

// ============================================================================
// GATE CHECKS (ordered, first failure wins)
// ============================================================================

/// A check returns the blocking reason when it fails
type GateCheck = fn(&PreviewReport, &ApplyRules) -> Option<String>;

/// Whether a check only matters when there is something to write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckScope {
    Always,
    WithChanges,
}

pub const NO_PREVIEW_REASON: &str = "No preview loaded.";
pub const IN_FLIGHT_REASON: &str = "Another preview or apply is in progress.";

const GATE_CHECKS: &[(&str, CheckScope, GateCheck)] = &[
    ("errors", CheckScope::Always, check_errors),
    ("duplicates", CheckScope::Always, check_duplicates),
    ("fallback", CheckScope::WithChanges, check_fallback),
    ("deactivations", CheckScope::WithChanges, check_deactivations),
    ("terminations", CheckScope::WithChanges, check_terminations),
    ("wage_decreases", CheckScope::WithChanges, check_wage_decreases),
    ("mapping", CheckScope::WithChanges, check_mapping),
];

fn check_errors(preview: &PreviewReport, _: &ApplyRules) -> Option<String> {
    (preview.totals.errors > 0).then(|| "Resolve preview errors first.".to_string())
}

fn check_duplicates(preview: &PreviewReport, _: &ApplyRules) -> Option<String> {
    preview.has_duplicates().then(|| {
        format!(
            "Duplicate employee codes in batch: {}.",
            preview.anomalies.duplicate_codes.join(", ")
        )
    })
}

fn check_fallback(preview: &PreviewReport, rules: &ApplyRules) -> Option<String> {
    let present = preview
        .changes
        .iter()
        .any(|c| c.matched_via == MatchedVia::Fallback);
    (present && !rules.allow_fallback_match)
        .then(|| "Rows matched by fallback id need approval.".to_string())
}

fn check_deactivations(preview: &PreviewReport, rules: &ApplyRules) -> Option<String> {
    (preview.count(ChangeKind::Deactivated) > 0 && !rules.ack_deactivations)
        .then(|| "Acknowledge deactivations.".to_string())
}

fn check_terminations(preview: &PreviewReport, rules: &ApplyRules) -> Option<String> {
    (preview.count(ChangeKind::Terminated) > 0 && !rules.ack_terminations)
        .then(|| "Acknowledge terminations.".to_string())
}

fn check_wage_decreases(preview: &PreviewReport, rules: &ApplyRules) -> Option<String> {
    let present = preview.changes.iter().any(|c| c.wage_decrease);
    (present && !rules.ack_wage_decreases).then(|| "Acknowledge wage decreases.".to_string())
}

fn check_mapping(_: &PreviewReport, rules: &ApplyRules) -> Option<String> {
    (!rules.ack_mapping).then(|| "Confirm the column mapping.".to_string())
}

// ============================================================================
// APPLY GATE
// ============================================================================

pub struct ApplyGate;

impl ApplyGate {
    /// Evaluate whether `preview` may be applied
    ///
    /// Errors and duplicates block any preview. An empty change-set needs no
    /// acknowledgements (applying it is a no-op), and an outstanding
    /// preview/apply still blocks everything.
    pub fn can_apply(
        preview: Option<&PreviewReport>,
        rules: &ApplyRules,
        scope: &ApplyScope,
        in_flight: bool,
    ) -> GateDecision {
        let Some(preview) = preview else {
            return GateDecision::blocked(NO_PREVIEW_REASON.to_string(), 0);
        };

        let in_scope = scope.filter(&preview.changes).len();

        let has_changes = !preview.changes.is_empty();
        for (name, when, check) in GATE_CHECKS {
            if *when == CheckScope::WithChanges && !has_changes {
                continue;
            }
            if let Some(reason) = check(preview, rules) {
                tracing::debug!(check = *name, %reason, "apply blocked");
                return GateDecision::blocked(reason, in_scope);
            }
        }

        if in_flight {
            return GateDecision::blocked(IN_FLIGHT_REASON.to_string(), in_scope);
        }

        GateDecision {
            allowed: true,
            reason: None,
            in_scope,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
