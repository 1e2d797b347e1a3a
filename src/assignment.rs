// 📍 Assignment Resolver - Latest-wins "current work" per employee
//
// Several upstream feeds (time clock punches, crew sheets, allocation
// exports...) each claim to know where an employee is working. None of them
// agree on key names. For every code we pick the row with the newest
// timestamp across all feeds, earlier feed winning on exact ties.
//
// Sources are queried as a chain: the first layer that yields anything wins,
// a failing layer is logged and treated as empty.

use crate::config::ResolverConfig;
use crate::fields::{
    lookup_non_empty, lookup_project, normalize_code, Row, EMPLOYEE_CODE_KEYS, JOB_NUMBER_KEYS,
    WORK_GROUP_KEYS,
};
use crate::temporal::last_seen;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ============================================================================
// RECORDS & FEEDS
// ============================================================================

/// Resolved assignment. Derived on every request, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRecord {
    pub employee_code: String,
    pub work_group: Option<String>,
    pub project: Option<String>,
    pub job_number: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Feed the winning row came from
    pub source: String,
}

/// One upstream feed of loosely-keyed rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl Feed {
    pub fn new(name: &str, rows: Vec<Row>) -> Self {
        Feed {
            name: name.to_string(),
            rows,
        }
    }
}

fn candidate(code: String, row: &Row, feed: &Feed) -> Option<AssignmentRecord> {
    let work_group = lookup_non_empty(row, WORK_GROUP_KEYS);
    let project = lookup_project(row);
    let job_number = lookup_non_empty(row, JOB_NUMBER_KEYS);

    if work_group.is_none() && project.is_none() && job_number.is_none() {
        return None;
    }

    Some(AssignmentRecord {
        employee_code: code,
        work_group,
        project,
        job_number,
        last_seen_at: last_seen(row),
        source: feed.name.clone(),
    })
}

/// Strictly newer. A timestamp beats no timestamp; ties keep the incumbent.
fn is_newer(candidate: &AssignmentRecord, incumbent: &AssignmentRecord) -> bool {
    match (candidate.last_seen_at, incumbent.last_seen_at) {
        (Some(c), Some(i)) => c > i,
        (Some(_), None) => true,
        _ => false,
    }
}

fn resolve_codes(feeds: &[Feed], wanted: Option<&HashSet<String>>) -> HashMap<String, AssignmentRecord> {
    let mut resolved: HashMap<String, AssignmentRecord> = HashMap::new();

    for feed in feeds {
        for row in &feed.rows {
            let Some(code) = lookup_non_empty(row, EMPLOYEE_CODE_KEYS).map(|c| normalize_code(&c)) else {
                continue;
            };
            if wanted.is_some_and(|w| !w.contains(&code)) {
                continue;
            }
            let Some(record) = candidate(code.clone(), row, feed) else {
                continue;
            };

            match resolved.get(&code) {
                Some(incumbent) if !is_newer(&record, incumbent) => {}
                _ => {
                    resolved.insert(code, record);
                }
            }
        }
    }

    resolved
}

/// Latest-wins assignment for one employee across `feeds` (priority order)
pub fn resolve(employee_code: &str, feeds: &[Feed]) -> Option<AssignmentRecord> {
    let code = normalize_code(employee_code);
    if code.is_empty() {
        return None;
    }
    let wanted = HashSet::from([code.clone()]);
    resolve_codes(feeds, Some(&wanted)).remove(&code)
}

/// Latest-wins assignment for every code present in `feeds`
pub fn resolve_all(feeds: &[Feed]) -> HashMap<String, AssignmentRecord> {
    resolve_codes(feeds, None)
}

// ============================================================================
// SOURCES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub codes: Vec<String>,
    /// Day window the source should honor, when it is a bounded lookup
    pub window_days: Option<i64>,
}

/// Anything that can hand back assignment feeds for a set of codes
pub trait AssignmentSource: Send + Sync {
    fn name(&self) -> &str;

    fn fetch(&self, request: &LookupRequest) -> Result<Vec<Feed>>;
}

/// In-memory feeds
pub struct StaticSource {
    name: String,
    feeds: Vec<Feed>,
}

impl StaticSource {
    pub fn new(name: &str, feeds: Vec<Feed>) -> Self {
        StaticSource {
            name: name.to_string(),
            feeds,
        }
    }
}

impl AssignmentSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, _request: &LookupRequest) -> Result<Vec<Feed>> {
        Ok(self.feeds.clone())
    }
}

// ============================================================================
// LAYERED RESOLVER
// ============================================================================

pub struct ResolverLayer {
    pub source: Box<dyn AssignmentSource>,
    /// Rows older than this many days (or without a timestamp) are ignored
    pub window_days: Option<i64>,
}

#[derive(Default)]
pub struct AssignmentResolver {
    layers: Vec<ResolverLayer>,
}

impl AssignmentResolver {
    pub fn new() -> Self {
        AssignmentResolver { layers: Vec::new() }
    }

    /// Primary fast path, then secondary, then the windowed org-wide lookup
    pub fn layered(
        primary: Box<dyn AssignmentSource>,
        secondary: Box<dyn AssignmentSource>,
        organization: Box<dyn AssignmentSource>,
        config: &ResolverConfig,
    ) -> Self {
        AssignmentResolver::new()
            .with_layer(primary, None)
            .with_layer(secondary, None)
            .with_layer(organization, Some(config.org_window_days))
    }

    pub fn with_layer(mut self, source: Box<dyn AssignmentSource>, window_days: Option<i64>) -> Self {
        self.layers.push(ResolverLayer {
            source,
            window_days,
        });
        self
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn resolve_many(&self, codes: &[String]) -> HashMap<String, AssignmentRecord> {
        self.resolve_many_at(codes, Utc::now())
    }

    /// Walk the layers in order; later layers are asked only for codes the
    /// earlier ones left unresolved
    pub fn resolve_many_at(&self, codes: &[String], now: DateTime<Utc>) -> HashMap<String, AssignmentRecord> {
        let mut wanted: HashSet<String> = codes
            .iter()
            .map(|c| normalize_code(c))
            .filter(|c| !c.is_empty())
            .collect();
        let mut found = HashMap::new();

        for layer in &self.layers {
            if wanted.is_empty() {
                break;
            }

            let mut request_codes: Vec<String> = wanted.iter().cloned().collect();
            request_codes.sort();
            let request = LookupRequest {
                codes: request_codes,
                window_days: layer.window_days,
            };

            let feeds = match layer.source.fetch(&request) {
                Ok(feeds) => feeds,
                Err(e) => {
                    tracing::warn!(source = layer.source.name(), error = %e, "assignment lookup failed");
                    continue;
                }
            };

            let mut resolved = resolve_codes(&feeds, Some(&wanted));

            if let Some(days) = layer.window_days {
                // A window too wide to subtract from `now` has no lower bound
                let cutoff = Duration::try_days(days).and_then(|d| now.checked_sub_signed(d));
                resolved.retain(|_, record| {
                    record
                        .last_seen_at
                        .is_some_and(|seen| cutoff.map_or(true, |cutoff| seen >= cutoff))
                });
            }

            if !resolved.is_empty() {
                tracing::debug!(
                    source = layer.source.name(),
                    resolved = resolved.len(),
                    "assignments resolved"
                );
                for code in resolved.keys() {
                    wanted.remove(code);
                }
                found.extend(resolved);
            }
        }

        found
    }

    pub fn resolve_assignment(&self, employee_code: &str) -> Option<AssignmentRecord> {
        let code = normalize_code(employee_code);
        self.resolve_many(std::slice::from_ref(&code)).remove(&code)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    struct FailingSource;

    impl AssignmentSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        fn fetch(&self, _request: &LookupRequest) -> Result<Vec<Feed>> {
            Err(anyhow!("connection refused"))
        }
    }

    #[test]
    fn test_latest_feed_wins() {
        let feed_a = Feed::new(
            "A",
            vec![row(json!({"emp_code": "E7", "crew": "North", "last_seen": "2024-01-01"}))],
        );
        let feed_b = Feed::new(
            "B",
            vec![row(json!({"Employee Code": "e7", "Team": "South", "Updated At": "2024-01-05"}))],
        );

        let record = resolve("E7", &[feed_a, feed_b]).unwrap();
        assert_eq!(record.work_group.as_deref(), Some("South"));
        assert_eq!(record.source, "B");
        assert_eq!(record.employee_code, "E7");
    }

    #[test]
    fn test_ties_keep_earlier_feed() {
        let stamp = "2024-02-01T08:00:00Z";
        let first = Feed::new("first", vec![row(json!({"emp_code": "E1", "crew": "One", "clock_in": stamp}))]);
        let second = Feed::new("second", vec![row(json!({"emp_code": "E1", "crew": "Two", "clock_in": stamp}))]);

        let record = resolve("E1", &[first, second]).unwrap();
        assert_eq!(record.source, "first");
        assert_eq!(record.work_group.as_deref(), Some("One"));
    }

    #[test]
    fn test_timestamped_row_beats_untimestamped() {
        let feed = Feed::new(
            "crew",
            vec![
                row(json!({"emp_code": "E1", "crew": "Undated"})),
                row(json!({"emp_code": "E1", "crew": "Dated", "punch_time": "2024-01-02 07:30"})),
            ],
        );

        let record = resolve("E1", &[feed]).unwrap();
        assert_eq!(record.work_group.as_deref(), Some("Dated"));
        assert!(record.last_seen_at.is_some());
    }

    #[test]
    fn test_last_seen_is_max_of_row_timestamps() {
        let feed = Feed::new(
            "clock",
            vec![row(json!({
                "emp_code": "E1",
                "job": "J-9",
                "clock_in": "2024-03-01T07:00:00Z",
                "clock_out": "2024-03-01T15:00:00Z",
                "created": "garbage"
            }))],
        );

        let record = resolve("E1", &[feed]).unwrap();
        assert_eq!(
            record.last_seen_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_project_precedence() {
        let feed = Feed::new(
            "alloc",
            vec![row(json!({
                "emp_code": "E1",
                "job_description": "Pour slab",
                "project": "Bridge",
                "job_number": "J-100",
                "allocation_code": ""
            }))],
        );

        let record = resolve("E1", &[feed]).unwrap();
        assert_eq!(record.project.as_deref(), Some("J-100"));
        assert_eq!(record.job_number.as_deref(), Some("J-100"));
    }

    #[test]
    fn test_unknown_or_empty_rows_resolve_to_none() {
        let feed = Feed::new("x", vec![row(json!({"emp_code": "E1", "note": "hello"}))]);
        assert!(resolve("E1", &[feed.clone()]).is_none());
        assert!(resolve("E2", &[feed.clone()]).is_none());
        assert!(resolve("  ", &[feed]).is_none());
    }

    #[test]
    fn test_failing_layer_falls_through() {
        let org = StaticSource::new(
            "org",
            vec![Feed::new(
                "org",
                vec![row(json!({"emp_code": "E1", "crew": "Org", "seen_at": "2024-06-01T00:00:00Z"}))],
            )],
        );
        let resolver = AssignmentResolver::new()
            .with_layer(Box::new(FailingSource), None)
            .with_layer(Box::new(StaticSource::new("empty", vec![])), None)
            .with_layer(Box::new(org), Some(45));

        let now = Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap();
        let resolved = resolver.resolve_many_at(&["e1".to_string()], now);
        assert_eq!(resolved["E1"].work_group.as_deref(), Some("Org"));
    }

    #[test]
    fn test_earlier_layer_wins_per_code() {
        let primary = StaticSource::new(
            "primary",
            vec![Feed::new("p", vec![row(json!({"emp_code": "E1", "crew": "Fast"}))])],
        );
        let secondary = StaticSource::new(
            "secondary",
            vec![Feed::new(
                "s",
                vec![row(json!({"emp_code": "E1", "crew": "Slow", "date": "2030-01-01"}))],
            )],
        );
        let resolver = AssignmentResolver::layered(
            Box::new(primary),
            Box::new(secondary),
            Box::new(StaticSource::new("org", vec![])),
            &ResolverConfig::default(),
        );

        assert_eq!(resolver.layer_count(), 3);
        let record = resolver.resolve_assignment("E1").unwrap();
        assert_eq!(record.work_group.as_deref(), Some("Fast"));
    }

    /// Records the codes each fetch asked for
    struct RecordingSource {
        inner: StaticSource,
        asked: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl AssignmentSource for RecordingSource {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn fetch(&self, request: &LookupRequest) -> Result<Vec<Feed>> {
            self.asked.lock().unwrap().push(request.codes.clone());
            self.inner.fetch(request)
        }
    }

    #[test]
    fn test_partial_layers_are_merged() {
        let primary = StaticSource::new(
            "primary",
            vec![Feed::new("p", vec![row(json!({"emp_code": "E1", "crew": "Fast"}))])],
        );
        let asked = Arc::new(Mutex::new(Vec::new()));
        let secondary = RecordingSource {
            inner: StaticSource::new(
                "secondary",
                vec![Feed::new(
                    "s",
                    vec![
                        row(json!({"emp_code": "E1", "crew": "Stale"})),
                        row(json!({"emp_code": "E2", "crew": "Slow"})),
                    ],
                )],
            ),
            asked: Arc::clone(&asked),
        };
        let resolver = AssignmentResolver::new()
            .with_layer(Box::new(primary), None)
            .with_layer(Box::new(secondary), None);

        let resolved = resolver.resolve_many(&["E1".to_string(), "E2".to_string()]);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["E1"].work_group.as_deref(), Some("Fast"));
        assert_eq!(resolved["E2"].work_group.as_deref(), Some("Slow"));
        assert_eq!(*asked.lock().unwrap(), vec![vec!["E2".to_string()]]);
    }

    #[test]
    fn test_huge_window_keeps_dated_rows() {
        let org = StaticSource::new(
            "org",
            vec![Feed::new(
                "org",
                vec![
                    row(json!({"emp_code": "E1", "crew": "Ancient", "seen_at": "1990-01-01T00:00:00Z"})),
                    row(json!({"emp_code": "E2", "crew": "Undated"})),
                ],
            )],
        );
        let resolver = AssignmentResolver::new().with_layer(Box::new(org), Some(i64::MAX));

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let resolved = resolver.resolve_many_at(&["E1".to_string(), "E2".to_string()], now);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["E1"].work_group.as_deref(), Some("Ancient"));
    }

    #[test]
    fn test_window_drops_stale_rows() {
        let org = StaticSource::new(
            "org",
            vec![Feed::new(
                "org",
                vec![
                    row(json!({"emp_code": "E1", "crew": "Old", "seen_at": "2024-01-01T00:00:00Z"})),
                    row(json!({"emp_code": "E2", "crew": "Undated"})),
                ],
            )],
        );
        let resolver = AssignmentResolver::new().with_layer(Box::new(org), Some(45));

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let resolved = resolver.resolve_many_at(&["E1".to_string(), "E2".to_string()], now);
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_all_layers_failing_is_empty_not_error() {
        let resolver = AssignmentResolver::new()
            .with_layer(Box::new(FailingSource), None)
            .with_layer(Box::new(FailingSource), Some(45));

        assert!(resolver.resolve_many(&["E1".to_string()]).is_empty());
        assert!(resolver.resolve_assignment("E1").is_none());
    }
}
