// 🔑 Field Lookup - Tolerate arbitrary upstream key spellings
//
// Staged rows and assignment feeds arrive as loose key/value maps.
// Every logical field has an ordered list of alternate key names; the first
// key present on the row wins. Keys are folded before comparison so
// "Emp Code", "emp_code" and "EMPCODE" all hit the same alias.

use serde_json::Value;
use std::collections::HashMap;

/// Loosely-typed row as it arrives from a staging batch or a feed
pub type Row = HashMap<String, Value>;

// ============================================================================
// ALTERNATE KEY TABLES
// ============================================================================

pub const EMPLOYEE_CODE_KEYS: &[&str] = &[
    "employee_code",
    "emp_code",
    "empcode",
    "employee_id",
    "employee_number",
    "emp_no",
    "code",
];

/// Secondary identifiers used when the employee code is missing
pub const FALLBACK_ID_KEYS: &[&str] = &["alt_id", "badge", "badge_id", "badge_number", "payroll_id"];

pub const NAME_KEYS: &[&str] = &["name", "employee_name", "full_name", "worker_name"];
pub const STATUS_KEYS: &[&str] = &["status", "employee_status", "emp_status", "employment_status"];
pub const WORK_GROUP_KEYS: &[&str] = &[
    "work_group",
    "workgroup",
    "group",
    "crew",
    "department",
    "dept",
    "team",
];
pub const JOB_NUMBER_KEYS: &[&str] = &["job_number", "job_no", "job_num", "job", "jobnumber"];
pub const VENDOR_KEYS: &[&str] = &["vendor", "employer", "agency", "vendor_name", "company"];
pub const PAY_RATE_KEYS: &[&str] = &["pay_rate", "rate", "wage", "hourly_rate", "payrate"];
pub const PAY_TYPE_KEYS: &[&str] = &["pay_type", "paytype", "rate_type", "wage_type"];
pub const PHONE_KEYS: &[&str] = &["phone", "phone_number", "mobile", "cell"];
pub const HIRE_DATE_KEYS: &[&str] = &["hire_date", "start_date", "date_hired"];
pub const END_DATE_KEYS: &[&str] = &["end_date", "term_date", "termination_date", "separation_date"];

/// Project candidates in precedence order:
/// allocation/job code > job number > project name > job description
pub const PROJECT_KEY_GROUPS: &[&[&str]] = &[
    &["allocation_code", "allocation", "job_code", "jobcode", "cost_code"],
    JOB_NUMBER_KEYS,
    &["project", "project_name", "projectname"],
    &["job_description", "job_desc", "description"],
];

/// Staged project field (explicit project column only)
pub const PROJECT_KEYS: &[&str] = &["project", "project_name", "projectname"];

// ============================================================================
// LOOKUP
// ============================================================================

/// Fold a key for comparison: lowercase, drop spaces, underscores and dashes
pub fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-' | '.'))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Render a JSON value as the string form used for comparison
///
/// Null becomes an empty string; numbers and booleans use their display form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Find the raw value for the first alias present on the row
///
/// When several row keys fold to the same alias, an exact spelling wins,
/// then the lexicographically smallest key.
pub fn lookup_value<'a>(row: &'a Row, aliases: &[&str]) -> Option<&'a Value> {
    for alias in aliases {
        if let Some(value) = row.get(*alias) {
            return Some(value);
        }
        let folded = fold_key(alias);
        let matched = row
            .iter()
            .filter(|(k, _)| fold_key(k) == folded)
            .min_by(|(a, _), (b, _)| a.cmp(b));
        if let Some((_, value)) = matched {
            return Some(value);
        }
    }
    None
}

/// First alias present on the row, as a string. `None` means the key is absent.
pub fn lookup(row: &Row, aliases: &[&str]) -> Option<String> {
    lookup_value(row, aliases).map(value_to_string)
}

/// First alias present on the row whose trimmed value is non-empty
pub fn lookup_non_empty(row: &Row, aliases: &[&str]) -> Option<String> {
    for alias in aliases {
        if let Some(value) = lookup(row, std::slice::from_ref(alias)) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Project value following the candidate-group precedence, first non-empty wins
pub fn lookup_project(row: &Row) -> Option<String> {
    PROJECT_KEY_GROUPS
        .iter()
        .find_map(|group| lookup_non_empty(row, group))
}

/// Employee code normalization: trim + uppercase
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_colliding_keys_resolve_deterministically() {
        let r = row(&[("EmpCode", json!("X9")), ("emp_code", json!("A1"))]);
        assert_eq!(lookup(&r, EMPLOYEE_CODE_KEYS), Some("A1".to_string()));

        let r = row(&[("Emp-Code", json!("B2")), ("EmpCode", json!("X9")), ("EMP CODE", json!("C3"))]);
        for _ in 0..16 {
            assert_eq!(lookup(&r, EMPLOYEE_CODE_KEYS), Some("C3".to_string()));
        }
    }

    #[test]
    fn test_lookup_tolerates_key_spelling() {
        let r = row(&[("Emp Code", json!(" a1 "))]);
        assert_eq!(lookup(&r, EMPLOYEE_CODE_KEYS), Some(" a1 ".to_string()));

        let r = row(&[("EMPLOYEE-ID", json!(42))]);
        assert_eq!(lookup(&r, EMPLOYEE_CODE_KEYS), Some("42".to_string()));
    }

    #[test]
    fn test_lookup_absent_vs_empty() {
        let r = row(&[("phone", Value::Null)]);
        assert_eq!(lookup(&r, PHONE_KEYS), Some(String::new()));
        assert_eq!(lookup(&r, NAME_KEYS), None);
    }

    #[test]
    fn test_lookup_alias_order_wins() {
        let r = row(&[("crew", json!("B")), ("work_group", json!("A"))]);
        assert_eq!(lookup(&r, WORK_GROUP_KEYS), Some("A".to_string()));
    }

    #[test]
    fn test_project_precedence() {
        let r = row(&[
            ("project", json!("Bridge Retrofit")),
            ("job_number", json!("J-100")),
            ("job_description", json!("Deck work")),
        ]);
        assert_eq!(lookup_project(&r), Some("J-100".to_string()));

        let r = row(&[
            ("allocation_code", json!("  ")),
            ("project", json!("Bridge Retrofit")),
            ("job_description", json!("Deck work")),
        ]);
        assert_eq!(lookup_project(&r), Some("Bridge Retrofit".to_string()));

        let r = row(&[("job_code", json!("AL-7")), ("job_no", json!("J-100"))]);
        assert_eq!(lookup_project(&r), Some("AL-7".to_string()));
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  e7 "), "E7");
    }
}
