// Roster Reconcile - Core Library
// Exposes all modules for use in the operator CLI, embedding apps, and tests

pub mod config;
pub mod error;
pub mod fields;      // Row type + alternate key lookup
pub mod temporal;    // Tolerant timestamps / last-seen discovery
pub mod entities;    // Vendor canonical table + canonicalizer
pub mod assignment;  // Layered latest-wins assignment resolver
pub mod db;          // Directory + staging stores (SQLite), audit events
pub mod diff;        // Batch diff engine
pub mod rules;       // Apply gate
pub mod service;     // Single-flight preview / apply front door

// Re-export commonly used types
pub use config::{CanonicalizerConfig, DiffConfig, EngineConfig, ResolverConfig};
pub use error::{ReconcileError, ReconcileResult};
pub use fields::Row;
pub use entities::{MatchThresholds, PatchRule, VendorCanonicalEntry, VendorCanonicalizer, VendorTable};
pub use assignment::{
    resolve, resolve_all, AssignmentRecord, AssignmentResolver, AssignmentSource, Feed,
    LookupRequest, ResolverLayer, StaticSource,
};
pub use db::{
    EmployeeRecord, Status, TrackedField, Event,
    DirectoryStore, StagingStore, SqliteStore,
    setup_database, upsert_employees, get_all_employees, get_employee,
    insert_staging_batch, load_staging_batch,
    verify_count, insert_event, get_events_for_entity,
};
pub use diff::{
    Anomalies, ChangeKind, ChangeRow, DiffEngine, FieldDiff, MatchedVia, PreviewReport,
    RowError, Totals,
};
pub use rules::{ApplyGate, ApplyRules, ApplyScope, GateDecision};
pub use service::{ApplyFailure, ApplyReport, FlightControl, FlightGuard, FlightKind, ReconcileService};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
