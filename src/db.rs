use crate::diff::ChangeRow;
use crate::fields::Row;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

const ACTOR: &str = "roster_reconcile";

// ============================================================================
// EMPLOYEE STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Inactive,
    Terminated,
    #[default]
    Other,
}

impl Status {
    /// Parse loosely-spelled status text
    pub fn parse(raw: &str) -> Status {
        match raw.trim().to_lowercase().as_str() {
            "active" | "a" | "act" | "current" => Status::Active,
            "inactive" | "i" | "leave" | "on leave" | "loa" | "suspended" => Status::Inactive,
            "terminated" | "term" | "termed" | "t" | "separated" => Status::Terminated,
            _ => Status::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Inactive => "inactive",
            Status::Terminated => "terminated",
            Status::Other => "other",
        }
    }
}

// ============================================================================
// TRACKED FIELDS
// ============================================================================

/// Fields the batch diff compares. Everything else on a staged row is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Name,
    Status,
    WorkGroup,
    Project,
    JobNumber,
    Vendor,
    PayRate,
    PayType,
    Phone,
    HireDate,
    EndDate,
}

impl TrackedField {
    pub const ALL: [TrackedField; 11] = [
        TrackedField::Name,
        TrackedField::Status,
        TrackedField::WorkGroup,
        TrackedField::Project,
        TrackedField::JobNumber,
        TrackedField::Vendor,
        TrackedField::PayRate,
        TrackedField::PayType,
        TrackedField::Phone,
        TrackedField::HireDate,
        TrackedField::EndDate,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            TrackedField::Name => "name",
            TrackedField::Status => "status",
            TrackedField::WorkGroup => "work_group",
            TrackedField::Project => "project",
            TrackedField::JobNumber => "job_number",
            TrackedField::Vendor => "vendor",
            TrackedField::PayRate => "pay_rate",
            TrackedField::PayType => "pay_type",
            TrackedField::Phone => "phone",
            TrackedField::HireDate => "hire_date",
            TrackedField::EndDate => "end_date",
        }
    }
}

// ============================================================================
// EMPLOYEE RECORD
// ============================================================================

/// Authoritative directory record, keyed by a unique employee code
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeRecord {
    pub code: String,

    /// Secondary identifier (badge / payroll id) for fallback matching
    #[serde(default)]
    pub alt_id: String,

    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub work_group: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub job_number: String,
    #[serde(default)]
    pub vendor: String,

    /// Pay rate as imported, e.g. "$20.00"
    #[serde(default)]
    pub pay_rate: String,
    #[serde(default)]
    pub pay_type: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub hire_date: String,
    #[serde(default)]
    pub end_date: String,

    #[serde(default)]
    pub version: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EmployeeRecord {
    pub fn new(code: &str, name: &str, status: Status) -> Self {
        EmployeeRecord {
            code: code.to_string(),
            name: name.to_string(),
            status,
            ..Default::default()
        }
    }

    /// Status with the sticky-terminated rule applied: an end date wins
    pub fn effective_status(&self) -> Status {
        if self.end_date.trim().is_empty() {
            self.status
        } else {
            Status::Terminated
        }
    }

    pub fn field(&self, field: TrackedField) -> String {
        match field {
            TrackedField::Name => self.name.clone(),
            TrackedField::Status => self.status.as_str().to_string(),
            TrackedField::WorkGroup => self.work_group.clone(),
            TrackedField::Project => self.project.clone(),
            TrackedField::JobNumber => self.job_number.clone(),
            TrackedField::Vendor => self.vendor.clone(),
            TrackedField::PayRate => self.pay_rate.clone(),
            TrackedField::PayType => self.pay_type.clone(),
            TrackedField::Phone => self.phone.clone(),
            TrackedField::HireDate => self.hire_date.clone(),
            TrackedField::EndDate => self.end_date.clone(),
        }
    }

    pub fn set_field(&mut self, field: TrackedField, value: &str) {
        let value = value.trim().to_string();
        match field {
            TrackedField::Name => self.name = value,
            TrackedField::Status => self.status = Status::parse(&value),
            TrackedField::WorkGroup => self.work_group = value,
            TrackedField::Project => self.project = value,
            TrackedField::JobNumber => self.job_number = value,
            TrackedField::Vendor => self.vendor = value,
            TrackedField::PayRate => self.pay_rate = value,
            TrackedField::PayType => self.pay_type = value,
            TrackedField::Phone => self.phone = value,
            TrackedField::HireDate => self.hire_date = value,
            TrackedField::EndDate => self.end_date = value,
        }
    }
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Audit trail entry: every directory write is recorded
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// STORE TRAITS
// ============================================================================

/// Authoritative employee directory
pub trait DirectoryStore {
    fn all(&self) -> Result<Vec<EmployeeRecord>>;

    fn get(&self, code: &str) -> Result<Option<EmployeeRecord>>;

    /// Write the field updates of one change row
    fn apply_change(&mut self, change: &ChangeRow, digest: &str) -> Result<()>;
}

/// Previously-imported staging batches
pub trait StagingStore {
    fn load_batch(&self, batch_id: &str) -> Result<Vec<Row>>;
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (in-memory databases stay "memory")
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS employees (
            code TEXT PRIMARY KEY NOT NULL,
            alt_id TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'other',
            work_group TEXT NOT NULL DEFAULT '',
            project TEXT NOT NULL DEFAULT '',
            job_number TEXT NOT NULL DEFAULT '',
            vendor TEXT NOT NULL DEFAULT '',
            pay_rate TEXT NOT NULL DEFAULT '',
            pay_type TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT '',
            hire_date TEXT NOT NULL DEFAULT '',
            end_date TEXT NOT NULL DEFAULT '',
            version INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staging_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            data TEXT NOT NULL,
            imported_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_employees_alt_id ON employees(alt_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staging_batch ON staging_rows(batch_id, row_index)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Insert or replace directory records (seeding / administrative loads)
pub fn upsert_employees(conn: &Connection, employees: &[EmployeeRecord]) -> Result<usize> {
    let mut written = 0;

    for emp in employees {
        conn.execute(
            "INSERT INTO employees (
                code, alt_id, name, status, work_group, project, job_number, vendor,
                pay_rate, pay_type, phone, hire_date, end_date, version, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(code) DO UPDATE SET
                alt_id = excluded.alt_id, name = excluded.name, status = excluded.status,
                work_group = excluded.work_group, project = excluded.project,
                job_number = excluded.job_number, vendor = excluded.vendor,
                pay_rate = excluded.pay_rate, pay_type = excluded.pay_type,
                phone = excluded.phone, hire_date = excluded.hire_date,
                end_date = excluded.end_date, version = employees.version + 1,
                updated_at = excluded.updated_at",
            params![
                emp.code.trim(),
                emp.alt_id,
                emp.name,
                emp.effective_status().as_str(),
                emp.work_group,
                emp.project,
                emp.job_number,
                emp.vendor,
                emp.pay_rate,
                emp.pay_type,
                emp.phone,
                emp.hire_date,
                emp.end_date,
                emp.version.max(1),
                Utc::now().to_rfc3339(),
            ],
        )?;
        written += 1;
    }

    Ok(written)
}

const EMPLOYEE_COLUMNS: &str = "code, alt_id, name, status, work_group, project, job_number, vendor,
     pay_rate, pay_type, phone, hire_date, end_date, version, updated_at";

fn employee_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmployeeRecord> {
    let status: String = row.get(3)?;
    let updated_at: Option<String> = row.get(14)?;

    Ok(EmployeeRecord {
        code: row.get(0)?,
        alt_id: row.get(1)?,
        name: row.get(2)?,
        status: Status::parse(&status),
        work_group: row.get(4)?,
        project: row.get(5)?,
        job_number: row.get(6)?,
        vendor: row.get(7)?,
        pay_rate: row.get(8)?,
        pay_type: row.get(9)?,
        phone: row.get(10)?,
        hire_date: row.get(11)?,
        end_date: row.get(12)?,
        version: row.get(13)?,
        updated_at: updated_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

pub fn get_all_employees(conn: &Connection) -> Result<Vec<EmployeeRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM employees ORDER BY code",
        EMPLOYEE_COLUMNS
    ))?;

    let employees = stmt
        .query_map([], employee_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(employees)
}

pub fn get_employee(conn: &Connection, code: &str) -> Result<Option<EmployeeRecord>> {
    let employee = conn
        .query_row(
            &format!("SELECT {} FROM employees WHERE code = ?1", EMPLOYEE_COLUMNS),
            [code],
            employee_from_row,
        )
        .optional()?;

    Ok(employee)
}

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM employees", [], |row| row.get(0))?;

    Ok(count)
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, timestamp, event_type, entity_type, entity_id, data, actor)| {
            Ok(Event {
                event_id,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .with_context(|| format!("Bad event timestamp: {}", timestamp))?
                    .with_timezone(&Utc),
                event_type,
                entity_type,
                entity_id,
                data: serde_json::from_str(&data).context("Bad event payload")?,
                actor,
            })
        })
        .collect()
}

/// Store a staging batch of key/value rows; returns the new batch id
pub fn insert_staging_batch(conn: &Connection, rows: &[Row]) -> Result<String> {
    let batch_id = uuid::Uuid::new_v4().to_string();
    let imported_at = Utc::now().to_rfc3339();

    for (index, row) in rows.iter().enumerate() {
        conn.execute(
            "INSERT INTO staging_rows (batch_id, row_index, data, imported_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![batch_id, index as i64, serde_json::to_string(row)?, imported_at],
        )?;
    }

    Ok(batch_id)
}

pub fn load_staging_batch(conn: &Connection, batch_id: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(
        "SELECT data FROM staging_rows WHERE batch_id = ?1 ORDER BY row_index",
    )?;

    let payloads = stmt
        .query_map([batch_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    payloads
        .iter()
        .map(|json| serde_json::from_str(json).context("Bad staging row payload"))
        .collect()
}

/// SQLite-backed directory + staging store
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {:?}", path))?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl DirectoryStore for SqliteStore {
    fn all(&self) -> Result<Vec<EmployeeRecord>> {
        get_all_employees(&self.conn)
    }

    fn get(&self, code: &str) -> Result<Option<EmployeeRecord>> {
        get_employee(&self.conn, code)
    }

    fn apply_change(&mut self, change: &ChangeRow, digest: &str) -> Result<()> {
        let tx = self.conn.transaction()?;

        // The change key is normalized; the directory keeps codes as stored
        let mut record = get_employee(&tx, &change.before.code)?
            .ok_or_else(|| anyhow!("Employee {} no longer exists", change.key))?;

        for diff in &change.field_diffs {
            record.set_field(diff.field, &diff.after);
        }
        // Sticky terminated: an end date overrides whatever status was staged
        record.status = record.effective_status();

        let updated = tx.execute(
            "UPDATE employees SET
                name = ?2, status = ?3, work_group = ?4, project = ?5, job_number = ?6,
                vendor = ?7, pay_rate = ?8, pay_type = ?9, phone = ?10, hire_date = ?11,
                end_date = ?12, version = version + 1, updated_at = ?13
             WHERE code = ?1",
            params![
                record.code,
                record.name,
                record.status.as_str(),
                record.work_group,
                record.project,
                record.job_number,
                record.vendor,
                record.pay_rate,
                record.pay_type,
                record.phone,
                record.hire_date,
                record.end_date,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated != 1 {
            return Err(anyhow!("Employee {} was not updated", change.key));
        }

        let event = Event::new(
            "employee_updated",
            "employee",
            &record.code,
            serde_json::json!({
                "reason": change.reason,
                "matched_via": change.matched_via,
                "fields": change.field_diffs,
                "preview_digest": digest,
            }),
            ACTOR,
        );
        insert_event(&tx, &event)?;

        tx.commit()?;
        Ok(())
    }
}

impl StagingStore for SqliteStore {
    fn load_batch(&self, batch_id: &str) -> Result<Vec<Row>> {
        load_staging_batch(&self.conn, batch_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================
