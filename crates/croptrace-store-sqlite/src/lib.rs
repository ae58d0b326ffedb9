use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use croptrace_core::{
    ChainStatus, HarvestRecord, LabRecord, ManufacturingRecord, PublicationPath, RecordId, Stage,
    StageEntry, TraceError, TrackingCode, TrackingRecord,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS harvest_records (
  harvest_id TEXT PRIMARY KEY,
  species TEXT NOT NULL,
  weight_kg REAL NOT NULL CHECK (weight_kg > 0),
  season TEXT NOT NULL,
  location TEXT NOT NULL,
  farmer TEXT NOT NULL,
  proof_uri TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS manufacturing_records (
  record_id TEXT PRIMARY KEY,
  harvest_id TEXT NOT NULL,
  manufacturer TEXT NOT NULL,
  batch_id TEXT NOT NULL,
  product_name TEXT,
  process_description TEXT,
  started_at TEXT,
  completed_at TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lab_records (
  record_id TEXT PRIMARY KEY,
  harvest_id TEXT NOT NULL,
  lab TEXT NOT NULL,
  test_type TEXT NOT NULL,
  result TEXT NOT NULL,
  report_uri TEXT,
  tested_at TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tracking_records (
  tracking_code TEXT PRIMARY KEY,
  harvest_id TEXT NOT NULL UNIQUE,
  status TEXT NOT NULL CHECK (status IN ('initialized','manufacturing','testing','completed','public')),
  is_public INTEGER NOT NULL CHECK (is_public IN (0, 1)),
  published_by TEXT CHECK (published_by IN ('automatic','administrative')),
  product_name TEXT,
  batch_id TEXT,
  verification_url TEXT NOT NULL,
  stages_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (harvest_id) REFERENCES harvest_records(harvest_id)
);

CREATE INDEX IF NOT EXISTS idx_manufacturing_records_harvest
  ON manufacturing_records(harvest_id, created_at, record_id);
CREATE INDEX IF NOT EXISTS idx_lab_records_harvest
  ON lab_records(harvest_id, created_at, record_id);
";

/// SQLite-backed store for the tracking core.
///
/// Upstream record tables (harvest, manufacturing, lab) are append-only
/// from this store's perspective; the tracking table is the only one
/// mutated in place, always inside a single IMMEDIATE transaction so
/// read-merge-write is atomic per record.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_status: SchemaStatus,
}

/// Outcome of a create-if-absent attempt on the tracking table.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerCreate {
    Created(TrackingRecord),
    /// A record for this harvest lineage already exists; returned unchanged.
    Existing(TrackingRecord),
    /// The generated tracking code collided with an existing record.
    /// Callers regenerate and retry.
    CodeConflict,
}

impl SqliteStore {
    /// Open the store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self
                .conn
                .transaction()
                .context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .context("failed to record migration v1")?;
            tx.commit().context("failed to commit migration v1")?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run quick-check and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;
        let schema_status = self.schema_status()?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            schema_status,
        })
    }

    /// Persist one farmer harvest submission.
    ///
    /// # Errors
    /// Returns an error when the lineage key already exists or the write fails.
    pub fn insert_harvest(&mut self, record: &HarvestRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO harvest_records(
                    harvest_id, species, weight_kg, season, location, farmer, proof_uri, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.harvest_id,
                    record.species,
                    record.weight_kg,
                    record.season,
                    record.location,
                    record.farmer,
                    record.proof_uri,
                    rfc3339(record.created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert harvest record {}", record.harvest_id))?;
        Ok(())
    }

    /// Resolve a harvest record by its lineage key.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_harvest(&self, harvest_id: &str) -> Result<Option<HarvestRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT harvest_id, species, weight_kg, season, location, farmer, proof_uri, created_at
             FROM harvest_records WHERE harvest_id = ?1",
        )?;
        let row = stmt
            .query_row(params![harvest_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .optional()?;

        match row {
            Some((harvest_id, species, weight_kg, season, location, farmer, proof_uri, created_at)) => {
                Ok(Some(HarvestRecord {
                    harvest_id,
                    species,
                    weight_kg,
                    season,
                    location,
                    farmer,
                    proof_uri,
                    created_at: parse_rfc3339(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Persist one manufacturer submission.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn insert_manufacturing(&mut self, record: &ManufacturingRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO manufacturing_records(
                    record_id, harvest_id, manufacturer, batch_id, product_name,
                    process_description, started_at, completed_at, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.record_id.to_string(),
                    record.harvest_id,
                    record.manufacturer,
                    record.batch_id,
                    record.product_name,
                    record.process_description,
                    optional_rfc3339(record.started_at)?,
                    optional_rfc3339(record.completed_at)?,
                    rfc3339(record.created_at)?,
                ],
            )
            .with_context(|| {
                format!("failed to insert manufacturing record for harvest {}", record.harvest_id)
            })?;
        Ok(())
    }

    /// Return the first manufacturing record for a harvest lineage, in
    /// insertion order. Multiple submissions may reference one harvest;
    /// only the first match is surfaced.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_first_manufacturing(&self, harvest_id: &str) -> Result<Option<ManufacturingRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, harvest_id, manufacturer, batch_id, product_name,
                    process_description, started_at, completed_at, created_at
             FROM manufacturing_records
             WHERE harvest_id = ?1
             ORDER BY created_at ASC, record_id ASC
             LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![harvest_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .optional()?;

        match row {
            Some((
                record_id,
                harvest_id,
                manufacturer,
                batch_id,
                product_name,
                process_description,
                started_at,
                completed_at,
                created_at,
            )) => Ok(Some(ManufacturingRecord {
                record_id: parse_record_id(&record_id)?,
                harvest_id,
                manufacturer,
                batch_id,
                product_name,
                process_description,
                started_at: parse_optional_rfc3339(started_at.as_deref())?,
                completed_at: parse_optional_rfc3339(completed_at.as_deref())?,
                created_at: parse_rfc3339(&created_at)?,
            })),
            None => Ok(None),
        }
    }

    /// Persist one laboratory submission.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn insert_lab(&mut self, record: &LabRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO lab_records(
                    record_id, harvest_id, lab, test_type, result, report_uri, tested_at, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.record_id.to_string(),
                    record.harvest_id,
                    record.lab,
                    record.test_type,
                    record.result,
                    record.report_uri,
                    optional_rfc3339(record.tested_at)?,
                    rfc3339(record.created_at)?,
                ],
            )
            .with_context(|| {
                format!("failed to insert lab record for harvest {}", record.harvest_id)
            })?;
        Ok(())
    }

    /// Return the first lab record for a harvest lineage, in insertion order.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_first_lab(&self, harvest_id: &str) -> Result<Option<LabRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, harvest_id, lab, test_type, result, report_uri, tested_at, created_at
             FROM lab_records
             WHERE harvest_id = ?1
             ORDER BY created_at ASC, record_id ASC
             LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![harvest_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .optional()?;

        match row {
            Some((record_id, harvest_id, lab, test_type, result, report_uri, tested_at, created_at)) => {
                Ok(Some(LabRecord {
                    record_id: parse_record_id(&record_id)?,
                    harvest_id,
                    lab,
                    test_type,
                    result,
                    report_uri,
                    tested_at: parse_optional_rfc3339(tested_at.as_deref())?,
                    created_at: parse_rfc3339(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Insert a tracking record unless one already exists for the same
    /// harvest lineage. The lineage check and the insert share one
    /// IMMEDIATE transaction, so once the lineage is confirmed absent a
    /// uniqueness failure can only come from the tracking code.
    ///
    /// # Errors
    /// Returns an error when the transaction or writes fail.
    pub fn create_tracker_if_absent(&mut self, record: &TrackingRecord) -> Result<TrackerCreate> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start create transaction")?;

        if let Some(existing) = query_tracker(&tx, "harvest_id", &record.harvest_id)? {
            tx.commit().context("failed to commit create transaction")?;
            return Ok(TrackerCreate::Existing(existing));
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO tracking_records(
                tracking_code, harvest_id, status, is_public, published_by,
                product_name, batch_id, verification_url, stages_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.tracking_code.as_str(),
                record.harvest_id,
                record.status.as_str(),
                i64::from(record.is_public),
                record.published_by.map(PublicationPath::as_str),
                record.product_name,
                record.batch_id,
                record.verification_url,
                stages_to_json(&record.stages)?,
                rfc3339(record.created_at)?,
                rfc3339(record.updated_at)?,
            ],
        )
        .context("failed to insert tracking record")?;

        tx.commit().context("failed to commit create transaction")?;

        if inserted == 0 {
            return Ok(TrackerCreate::CodeConflict);
        }
        Ok(TrackerCreate::Created(record.clone()))
    }

    /// Resolve a tracking record by its public code.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_tracker_by_code(&self, code: &TrackingCode) -> Result<Option<TrackingRecord>> {
        query_tracker(&self.conn, "tracking_code", code.as_str())
    }

    /// Resolve a tracking record by its harvest lineage key.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_tracker_by_harvest(&self, harvest_id: &str) -> Result<Option<TrackingRecord>> {
        query_tracker(&self.conn, "harvest_id", harvest_id)
    }

    /// Read-merge-write one tracking record by lineage key inside a
    /// single IMMEDIATE transaction. Returns the updated record, or
    /// `None` when no record exists for the key.
    ///
    /// # Errors
    /// Returns the merge function's error verbatim (downcastable to
    /// [`TraceError`]), or a wrapped error when the transaction fails.
    pub fn merge_tracker_by_harvest<F>(
        &mut self,
        harvest_id: &str,
        merge: F,
    ) -> Result<Option<TrackingRecord>>
    where
        F: FnOnce(&mut TrackingRecord) -> std::result::Result<(), TraceError>,
    {
        self.merge_tracker("harvest_id", harvest_id, merge)
    }

    /// Read-merge-write one tracking record by public code. See
    /// [`Self::merge_tracker_by_harvest`].
    ///
    /// # Errors
    /// Returns the merge function's error verbatim, or a wrapped error
    /// when the transaction fails.
    pub fn merge_tracker_by_code<F>(
        &mut self,
        code: &TrackingCode,
        merge: F,
    ) -> Result<Option<TrackingRecord>>
    where
        F: FnOnce(&mut TrackingRecord) -> std::result::Result<(), TraceError>,
    {
        self.merge_tracker("tracking_code", code.as_str(), merge)
    }

    fn merge_tracker<F>(&mut self, key_column: &str, key: &str, merge: F) -> Result<Option<TrackingRecord>>
    where
        F: FnOnce(&mut TrackingRecord) -> std::result::Result<(), TraceError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start merge transaction")?;

        let Some(mut record) = query_tracker(&tx, key_column, key)? else {
            tx.commit().context("failed to commit empty merge transaction")?;
            return Ok(None);
        };

        merge(&mut record).map_err(anyhow::Error::new)?;

        tx.execute(
            "UPDATE tracking_records SET
                status = ?1, is_public = ?2, published_by = ?3, product_name = ?4,
                batch_id = ?5, verification_url = ?6, stages_json = ?7, updated_at = ?8
             WHERE tracking_code = ?9",
            params![
                record.status.as_str(),
                i64::from(record.is_public),
                record.published_by.map(PublicationPath::as_str),
                record.product_name,
                record.batch_id,
                record.verification_url,
                stages_to_json(&record.stages)?,
                rfc3339(record.updated_at)?,
                record.tracking_code.as_str(),
            ],
        )
        .context("failed to update tracking record")?;
        tx.commit().context("failed to commit merge transaction")?;

        Ok(Some(record))
    }

    /// Delete the tracking record for a harvest lineage. Used by the
    /// recovery-only regenerate path; invalidates the distributed code.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_tracker(&mut self, harvest_id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM tracking_records WHERE harvest_id = ?1", params![harvest_id])
            .context("failed to delete tracking record")?;
        Ok(deleted > 0)
    }

    /// Count tracking records referencing one harvest lineage. The
    /// uniqueness invariant holds when this never exceeds one.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_trackers_for_harvest(&self, harvest_id: &str) -> Result<i64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM tracking_records WHERE harvest_id = ?1",
                params![harvest_id],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count tracking records")?;
        Ok(count)
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn query_tracker(
    conn: &Connection,
    key_column: &str,
    key: &str,
) -> Result<Option<TrackingRecord>> {
    let query = format!(
        "SELECT tracking_code, harvest_id, status, is_public, published_by, product_name,
                batch_id, verification_url, stages_json, created_at, updated_at
         FROM tracking_records WHERE {key_column} = ?1"
    );
    let mut stmt = conn.prepare(&query)?;
    let row = stmt
        .query_row(params![key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })
        .optional()?;

    let Some((
        tracking_code,
        harvest_id,
        status,
        is_public,
        published_by,
        product_name,
        batch_id,
        verification_url,
        stages_json,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    let tracking_code = TrackingCode::parse(&tracking_code)
        .ok_or_else(|| anyhow!("invalid tracking code in store: {tracking_code}"))?;
    let status = ChainStatus::parse(&status)
        .ok_or_else(|| anyhow!("invalid tracking status in store: {status}"))?;
    let published_by = published_by
        .map(|raw| {
            PublicationPath::parse(&raw)
                .ok_or_else(|| anyhow!("invalid publication path in store: {raw}"))
        })
        .transpose()?;

    Ok(Some(TrackingRecord {
        tracking_code,
        harvest_id,
        status,
        is_public: is_public != 0,
        published_by,
        product_name,
        batch_id,
        verification_url,
        stages: stages_from_json(&stages_json)?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    }))
}

fn stages_to_json(stages: &BTreeMap<Stage, StageEntry>) -> Result<String> {
    serde_json::to_string(stages).context("failed to serialize stage map")
}

fn stages_from_json(raw: &str) -> Result<BTreeMap<Stage, StageEntry>> {
    serde_json::from_str(raw).context("failed to deserialize stored stage map")
}

fn parse_record_id(raw: &str) -> Result<RecordId> {
    let parsed = ulid_from_str(raw)?;
    Ok(RecordId(parsed))
}

fn ulid_from_str(raw: &str) -> Result<ulid::Ulid> {
    raw.parse::<ulid::Ulid>().map_err(|_| anyhow!("invalid ULID in store: {raw}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value.format(&Rfc3339).context("failed to format RFC 3339 timestamp")
}

fn optional_rfc3339(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(rfc3339).transpose()
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("failed to parse RFC 3339 timestamp: {raw}"))
}

fn parse_optional_rfc3339(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(parse_rfc3339).transpose()
}
