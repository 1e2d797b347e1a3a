// 🧭 Reconcile Service - preview / apply / resolve behind one front door
//
// Holds the directory store, the shared vendor canonicalizer and the last
// computed preview. Preview and apply are single-flight: while one is
// outstanding every other preview/apply is refused with InFlight.

use crate::assignment::{AssignmentRecord, AssignmentResolver};
use crate::config::EngineConfig;
use crate::db::{DirectoryStore, StagingStore};
use crate::diff::{DiffEngine, PreviewReport};
use crate::entities::vendor::VendorCanonicalizer;
use crate::error::{ReconcileError, ReconcileResult};
use crate::fields::Row;
use crate::rules::{ApplyGate, ApplyRules, ApplyScope, GateDecision};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// SINGLE-FLIGHT CONTROL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightKind {
    Preview,
    Apply,
}

impl FlightKind {
    pub fn label(&self) -> &'static str {
        match self {
            FlightKind::Preview => "Preview",
            FlightKind::Apply => "Apply",
        }
    }
}

#[derive(Debug, Default)]
pub struct FlightControl {
    slot: Mutex<Option<FlightKind>>,
}

/// Releases the flight slot when dropped
#[derive(Debug)]
pub struct FlightGuard<'a> {
    control: &'a FlightControl,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.control.lock_slot() = None;
    }
}

impl FlightControl {
    fn lock_slot(&self) -> MutexGuard<'_, Option<FlightKind>> {
        // A panic mid-operation must not wedge the service forever
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_begin(&self, kind: FlightKind) -> ReconcileResult<FlightGuard<'_>> {
        let mut slot = self.lock_slot();
        if let Some(current) = *slot {
            return Err(ReconcileError::InFlight(current.label()));
        }
        *slot = Some(kind);
        Ok(FlightGuard { control: self })
    }

    pub fn try_preview(&self) -> ReconcileResult<FlightGuard<'_>> {
        self.try_begin(FlightKind::Preview)
    }

    pub fn try_apply(&self) -> ReconcileResult<FlightGuard<'_>> {
        self.try_begin(FlightKind::Apply)
    }

    pub fn current(&self) -> Option<FlightKind> {
        *self.lock_slot()
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }
}

// ============================================================================
// APPLY REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFailure {
    pub key: String,
    pub row_index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub allowed: bool,
    pub reason: Option<String>,
    /// In-scope rows we tried to write
    pub attempted: usize,
    pub written: usize,
    pub skipped_out_of_scope: usize,
    pub failed: usize,
    pub failures: Vec<ApplyFailure>,
    pub digest: Option<String>,
}

impl ApplyReport {
    fn blocked(decision: GateDecision) -> Self {
        ApplyReport {
            allowed: false,
            reason: decision.reason,
            ..Default::default()
        }
    }
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct ReconcileService<S: DirectoryStore> {
    store: Mutex<S>,
    canonicalizer: Arc<VendorCanonicalizer>,
    engine: DiffEngine,
    resolver: AssignmentResolver,
    flights: FlightControl,
    last_preview: Mutex<Option<PreviewReport>>,
}

impl<S: DirectoryStore> ReconcileService<S> {
    pub fn new(store: S, config: &EngineConfig) -> ReconcileResult<Self> {
        config
            .validate()
            .map_err(|e| ReconcileError::Config(format!("{:#}", e)))?;
        let canonicalizer = Arc::new(
            config
                .build_canonicalizer()
                .map_err(|e| ReconcileError::Config(format!("{:#}", e)))?,
        );

        Ok(ReconcileService {
            store: Mutex::new(store),
            engine: DiffEngine::new(Arc::clone(&canonicalizer), config.diff.clone()),
            canonicalizer,
            resolver: AssignmentResolver::new(),
            flights: FlightControl::default(),
            last_preview: Mutex::new(None),
        })
    }

    pub fn with_resolver(mut self, resolver: AssignmentResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn flights(&self) -> &FlightControl {
        &self.flights
    }

    pub fn canonicalizer(&self) -> &VendorCanonicalizer {
        &self.canonicalizer
    }

    fn last_preview_slot(&self) -> MutexGuard<'_, Option<PreviewReport>> {
        self.last_preview
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn last_preview(&self) -> Option<PreviewReport> {
        self.last_preview_slot().clone()
    }

    /// Diff staged rows against the current directory and remember the result
    pub fn preview(&self, staging: &[Row]) -> ReconcileResult<PreviewReport> {
        let _flight = self.flights.try_preview()?;

        let canonical = self.store().all()?;
        let report = self.engine.preview(staging, &canonical);

        *self.last_preview_slot() = Some(report.clone());
        Ok(report)
    }

    /// Gate decision for the remembered preview
    pub fn can_apply(&self, rules: &ApplyRules, scope: &ApplyScope) -> GateDecision {
        let preview = self.last_preview_slot();
        ApplyGate::can_apply(preview.as_ref(), rules, scope, self.flights.is_busy())
    }

    /// Apply the remembered preview; consumes it when the gate allows
    pub fn apply(&self, rules: &ApplyRules, scope: &ApplyScope) -> ReconcileResult<ApplyReport> {
        let _flight = self.flights.try_apply()?;

        let preview = self.last_preview();
        let report = self.write_changes(preview.as_ref(), rules, scope)?;
        if report.allowed {
            *self.last_preview_slot() = None;
        }
        Ok(report)
    }

    /// Apply an explicit change-set (e.g. one a caller kept from an earlier preview)
    pub fn apply_preview(
        &self,
        preview: Option<&PreviewReport>,
        rules: &ApplyRules,
        scope: &ApplyScope,
    ) -> ReconcileResult<ApplyReport> {
        let _flight = self.flights.try_apply()?;
        self.write_changes(preview, rules, scope)
    }

    fn write_changes(
        &self,
        preview: Option<&PreviewReport>,
        rules: &ApplyRules,
        scope: &ApplyScope,
    ) -> ReconcileResult<ApplyReport> {
        // We hold the flight slot ourselves, so nothing else is in flight
        let decision = ApplyGate::can_apply(preview, rules, scope, false);
        let Some(preview) = preview.filter(|_| decision.allowed) else {
            tracing::info!(reason = ?decision.reason, "apply blocked");
            return Ok(ApplyReport::blocked(decision));
        };

        let selected = scope.filter(&preview.changes);
        let mut report = ApplyReport {
            allowed: true,
            reason: None,
            attempted: selected.len(),
            skipped_out_of_scope: preview.changes.len() - selected.len(),
            digest: Some(preview.digest.clone()),
            ..Default::default()
        };

        let mut store = self.store();
        for change in selected {
            match store.apply_change(change, &preview.digest) {
                Ok(()) => report.written += 1,
                Err(e) => {
                    tracing::warn!(key = %change.key, error = %e, "change not written");
                    report.failed += 1;
                    report.failures.push(ApplyFailure {
                        key: change.key.clone(),
                        row_index: change.row_index,
                        message: format!("{:#}", e),
                    });
                }
            }
        }

        tracing::info!(
            attempted = report.attempted,
            written = report.written,
            failed = report.failed,
            skipped = report.skipped_out_of_scope,
            digest = %preview.digest,
            "apply finished"
        );

        Ok(report)
    }

    pub fn resolve_assignment(&self, employee_code: &str) -> Option<AssignmentRecord> {
        self.resolver.resolve_assignment(employee_code)
    }

    pub fn canonicalize_vendor(&self, raw: Option<&str>) -> String {
        self.canonicalizer.normalize_opt(raw)
    }
}

impl<S: DirectoryStore + StagingStore> ReconcileService<S> {
    /// Preview a staging batch previously stored under `batch_id`
    pub fn preview_batch(&self, batch_id: &str) -> ReconcileResult<PreviewReport> {
        let rows = self.store().load_batch(batch_id)?;
        self.preview(&rows)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{Feed, StaticSource};
    use crate::db::{get_events_for_entity, insert_staging_batch, upsert_employees, EmployeeRecord, SqliteStore, Status};
    use crate::diff::ChangeRow;
    use anyhow::anyhow;
    use serde_json::json;

    fn seeded_service() -> ReconcileService<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut a1 = EmployeeRecord::new("A1", "Ana Diaz", Status::Active);
        a1.pay_rate = "$20.00".to_string();
        a1.vendor = "ABC Staffing".to_string();
        let a2 = EmployeeRecord::new("A2", "Ben Ode", Status::Active);
        upsert_employees(store.connection(), &[a1, a2]).unwrap();

        ReconcileService::new(store, &EngineConfig::default()).unwrap()
    }

    fn rows(values: Vec<serde_json::Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect()
    }

    #[test]
    fn test_preview_then_apply_writes_directory() {
        let service = seeded_service();
        let report = service
            .preview(&rows(vec![json!({"emp_code": "A1", "project": "Tunnel"})]))
            .unwrap();
        assert_eq!(report.totals.changed, 1);

        let applied = service
            .apply(&ApplyRules::all_acknowledged(), &ApplyScope::default())
            .unwrap();
        assert!(applied.allowed);
        assert_eq!(applied.written, 1);
        assert_eq!(applied.digest.as_deref(), Some(report.digest.as_str()));

        let store = service.store();
        assert_eq!(store.get("A1").unwrap().unwrap().project, "Tunnel");
        let events = get_events_for_entity(store.connection(), "employee", "A1").unwrap();
        assert_eq!(events.len(), 1);
        drop(store);

        // The preview was consumed
        assert!(service.last_preview().is_none());
    }

    #[test]
    fn test_apply_writes_lowercase_directory_codes() {
        let store = SqliteStore::open_in_memory().unwrap();
        upsert_employees(
            store.connection(),
            &[EmployeeRecord::new("a1", "Ana Diaz", Status::Active)],
        )
        .unwrap();
        let service = ReconcileService::new(store, &EngineConfig::default()).unwrap();

        service
            .preview(&rows(vec![json!({"emp_code": "a1", "project": "Tunnel"})]))
            .unwrap();
        let applied = service
            .apply(&ApplyRules::all_acknowledged(), &ApplyScope::default())
            .unwrap();

        assert_eq!(applied.written, 1);
        assert_eq!(applied.failed, 0);
        assert_eq!(service.store().get("a1").unwrap().unwrap().project, "Tunnel");
    }

    #[test]
    fn test_apply_without_preview_is_blocked() {
        let service = seeded_service();
        let report = service
            .apply(&ApplyRules::all_acknowledged(), &ApplyScope::default())
            .unwrap();
        assert!(!report.allowed);
        assert_eq!(report.reason.as_deref(), Some("No preview loaded."));
        assert_eq!(report.written, 0);
    }

    #[test]
    fn test_empty_change_set_is_a_noop() {
        let service = seeded_service();
        let report = service
            .preview(&rows(vec![json!({"emp_code": "A1", "status": "active"})]))
            .unwrap();
        assert!(report.changes.is_empty());

        let applied = service
            .apply(&ApplyRules::default(), &ApplyScope::default())
            .unwrap();
        assert!(applied.allowed);
        assert_eq!(applied.attempted, 0);
        assert_eq!(applied.written, 0);
        assert_eq!(service.store().get("A1").unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_duplicates_block_even_with_every_ack() {
        let service = seeded_service();
        service
            .preview(&rows(vec![
                json!({"emp_code": "A1", "project": "X"}),
                json!({"emp_code": "A1", "project": "Y"}),
            ]))
            .unwrap();

        let decision = service.can_apply(&ApplyRules::all_acknowledged(), &ApplyScope::default());
        assert!(!decision.allowed);

        let applied = service
            .apply(&ApplyRules::all_acknowledged(), &ApplyScope::default())
            .unwrap();
        assert!(!applied.allowed);
        assert_eq!(service.store().get("A1").unwrap().unwrap().project, "");
    }

    #[test]
    fn test_wage_decrease_needs_ack() {
        let service = seeded_service();
        service
            .preview(&rows(vec![json!({"empCode": "A1", "wage": "$18.50"})]))
            .unwrap();

        let mut rules = ApplyRules::all_acknowledged();
        rules.ack_wage_decreases = false;
        let blocked = service.apply(&rules, &ApplyScope::default()).unwrap();
        assert!(!blocked.allowed);
        assert!(service.last_preview().is_some());

        rules.ack_wage_decreases = true;
        let applied = service.apply(&rules, &ApplyScope::default()).unwrap();
        assert_eq!(applied.written, 1);
        assert_eq!(service.store().get("A1").unwrap().unwrap().pay_rate, "$18.50");
    }

    #[test]
    fn test_scope_limits_writes() {
        let service = seeded_service();
        service
            .preview(&rows(vec![
                json!({"emp_code": "A1", "status": "terminated"}),
                json!({"emp_code": "A2", "project": "Dam"}),
            ]))
            .unwrap();

        let scope = ApplyScope {
            terminations: false,
            ..Default::default()
        };
        let applied = service.apply(&ApplyRules::all_acknowledged(), &scope).unwrap();
        assert_eq!(applied.attempted, 1);
        assert_eq!(applied.skipped_out_of_scope, 1);
        assert_eq!(applied.written, 1);

        let store = service.store();
        assert_eq!(store.get("A1").unwrap().unwrap().status, Status::Active);
        assert_eq!(store.get("A2").unwrap().unwrap().project, "Dam");
    }

    #[test]
    fn test_in_flight_refuses_second_operation() {
        let service = seeded_service();
        let guard = service.flights().try_apply().unwrap();

        let err = service.preview(&rows(vec![])).unwrap_err();
        assert!(matches!(err, ReconcileError::InFlight("Apply")));
        assert!(service
            .apply(&ApplyRules::all_acknowledged(), &ApplyScope::default())
            .is_err());
        assert!(!service
            .can_apply(&ApplyRules::all_acknowledged(), &ApplyScope::default())
            .allowed);

        drop(guard);
        assert!(!service.flights().is_busy());
        assert!(service.preview(&rows(vec![])).is_ok());
    }

    struct FlakyStore {
        records: Vec<EmployeeRecord>,
        written: Vec<String>,
    }

    impl DirectoryStore for FlakyStore {
        fn all(&self) -> anyhow::Result<Vec<EmployeeRecord>> {
            Ok(self.records.clone())
        }

        fn get(&self, code: &str) -> anyhow::Result<Option<EmployeeRecord>> {
            Ok(self.records.iter().find(|r| r.code == code).cloned())
        }

        fn apply_change(&mut self, change: &ChangeRow, _digest: &str) -> anyhow::Result<()> {
            if change.key == "A2" {
                return Err(anyhow!("disk full"));
            }
            self.written.push(change.key.clone());
            Ok(())
        }
    }

    #[test]
    fn test_partial_failures_are_reported() {
        let store = FlakyStore {
            records: vec![
                EmployeeRecord::new("A1", "Ana", Status::Active),
                EmployeeRecord::new("A2", "Ben", Status::Active),
                EmployeeRecord::new("A3", "Cy", Status::Active),
            ],
            written: vec![],
        };
        let service = ReconcileService::new(store, &EngineConfig::default()).unwrap();
        service
            .preview(&rows(vec![
                json!({"emp_code": "A1", "project": "X"}),
                json!({"emp_code": "A2", "project": "X"}),
                json!({"emp_code": "A3", "project": "X"}),
            ]))
            .unwrap();

        let applied = service
            .apply(&ApplyRules::all_acknowledged(), &ApplyScope::default())
            .unwrap();
        assert_eq!(applied.attempted, 3);
        assert_eq!(applied.written, 2);
        assert_eq!(applied.failed, 1);
        assert_eq!(applied.failures[0].key, "A2");
        assert!(applied.failures[0].message.contains("disk full"));
        assert_eq!(service.store().written, vec!["A1".to_string(), "A3".to_string()]);
    }

    #[test]
    fn test_preview_batch_from_staging() {
        let service = seeded_service();
        let batch_id = {
            let store = service.store();
            insert_staging_batch(
                store.connection(),
                &rows(vec![json!({"emp_code": "A2", "status": "inactive"})]),
            )
            .unwrap()
        };

        let report = service.preview_batch(&batch_id).unwrap();
        assert_eq!(report.totals.deactivated, 1);
    }

    #[test]
    fn test_resolve_and_canonicalize() {
        let feeds = vec![
            Feed::new("a", vec![serde_json::from_value(json!({"emp_code": "E7", "crew": "North", "date": "2024-01-01"})).unwrap()]),
            Feed::new("b", vec![serde_json::from_value(json!({"emp_code": "E7", "crew": "South", "date": "2024-01-05"})).unwrap()]),
        ];
        let resolver = AssignmentResolver::new().with_layer(Box::new(StaticSource::new("feeds", feeds)), None);
        let service = seeded_service().with_resolver(resolver);

        let record = service.resolve_assignment("E7").unwrap();
        assert_eq!(record.work_group.as_deref(), Some("South"));

        assert_eq!(service.canonicalize_vendor(None), "");
        assert_eq!(service.canonicalize_vendor(Some("")), "");
        assert_eq!(
            service.canonicalize_vendor(Some("ABC Staffing, LLC")),
            service.canonicalize_vendor(Some("abc staffing llc"))
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.canonicalizer.exact_threshold = 1.5;
        let store = SqliteStore::open_in_memory().unwrap();

        let err = ReconcileService::new(store, &config).err().unwrap();
        assert!(matches!(err, ReconcileError::Config(_)));
    }
}
