use std::collections::BTreeMap;
use std::path::PathBuf;

use croptrace_core::{
    DocumentRenderer, HarvestRecord, LabRecord, ManufacturingRecord, ProvenanceSnapshot,
    PublicationPath, RecordId, Stage, StageSubmission, TraceError, TrackingCode, TrackingRecord,
};
use croptrace_store_sqlite::{SchemaStatus, SqliteStore, TrackerCreate};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Bound on tracking-code regeneration after a uniqueness conflict.
/// Expected never to be reached in practice.
const CODE_GENERATION_ATTEMPTS: u32 = 5;

pub type ApiResult<T> = Result<T, TraceError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Farmer submission: creates the harvest record and initializes its
/// tracking record in one call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarvestSubmission {
    pub harvest_id: String,
    pub species: String,
    pub weight_kg: f64,
    pub season: String,
    pub location: String,
    pub farmer: String,
    pub proof_uri: Option<String>,
}

/// Manufacturer submission: persists the manufacturing record and
/// advances the `manufacturing` stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManufacturingSubmission {
    pub harvest_id: String,
    pub manufacturer: String,
    pub batch_id: String,
    pub product_name: Option<String>,
    pub process_description: Option<String>,
    pub location: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Laboratory submission: persists the lab record and advances the
/// `lab_testing` stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabSubmission {
    pub harvest_id: String,
    pub lab: String,
    pub test_type: String,
    pub result: String,
    pub report_uri: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub tested_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Operations facade over the tracking state machine, the report
/// aggregator, and the underlying store. Holds no open connection:
/// the store is opened per call against the configured path.
#[derive(Debug, Clone)]
pub struct CropTraceApi {
    db_path: PathBuf,
    base_url: String,
}

impl CropTraceApi {
    #[must_use]
    pub fn new(db_path: PathBuf, base_url: impl Into<String>) -> Self {
        Self { db_path, base_url: base_url.into() }
    }

    fn open_store(&self) -> ApiResult<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path).map_err(store_error)?;
        store.migrate().map_err(store_error)?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns [`TraceError::Store`] when the database cannot be opened
    /// or queried.
    pub fn schema_status(&self) -> ApiResult<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path).map_err(store_error)?;
        store.schema_status().map_err(store_error)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns [`TraceError::Store`] when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> ApiResult<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path).map_err(store_error)?;
        let before = store.schema_status().map_err(store_error)?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate().map_err(store_error)?;
        let after = store.schema_status().map_err(store_error)?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Persist a farmer's harvest submission and initialize its tracker.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when the lineage key is already
    /// taken, or a store/initialization error.
    pub fn record_harvest(&self, submission: HarvestSubmission) -> ApiResult<TrackingRecord> {
        if submission.harvest_id.trim().is_empty() {
            return Err(TraceError::Validation("harvest_id MUST be non-empty".to_string()));
        }
        if submission.weight_kg <= 0.0 {
            return Err(TraceError::Validation("weight_kg MUST be positive".to_string()));
        }

        let mut store = self.open_store()?;
        if store.find_harvest(&submission.harvest_id).map_err(store_error)?.is_some() {
            return Err(TraceError::Validation(format!(
                "harvest {} is already recorded",
                submission.harvest_id
            )));
        }

        let record = HarvestRecord {
            harvest_id: submission.harvest_id,
            species: submission.species,
            weight_kg: submission.weight_kg,
            season: submission.season,
            location: submission.location,
            farmer: submission.farmer,
            proof_uri: submission.proof_uri,
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_harvest(&record).map_err(store_error)?;
        tracing::info!(harvest_id = %record.harvest_id, "harvest recorded");
        self.initialize_in(&mut store, &record.harvest_id)
    }

    /// Create the tracking record for a harvest lineage, or return the
    /// existing one unchanged. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns [`TraceError::UpstreamNotFound`] when the harvest does not
    /// resolve, or [`TraceError::AlreadyExists`] when code generation
    /// keeps colliding.
    pub fn initialize(&self, harvest_id: &str) -> ApiResult<TrackingRecord> {
        let mut store = self.open_store()?;
        self.initialize_in(&mut store, harvest_id)
    }

    fn initialize_in(&self, store: &mut SqliteStore, harvest_id: &str) -> ApiResult<TrackingRecord> {
        let harvest = store
            .find_harvest(harvest_id)
            .map_err(store_error)?
            .ok_or_else(|| TraceError::UpstreamNotFound(harvest_id.to_string()))?;

        for _ in 0..CODE_GENERATION_ATTEMPTS {
            let candidate = TrackingRecord::initialize(
                TrackingCode::generate(),
                &harvest,
                &self.base_url,
                OffsetDateTime::now_utc(),
            );
            match store.create_tracker_if_absent(&candidate).map_err(store_error)? {
                TrackerCreate::Created(record) => {
                    tracing::info!(
                        harvest_id = %record.harvest_id,
                        tracking_code = %record.tracking_code,
                        "tracking record initialized"
                    );
                    return Ok(record);
                }
                TrackerCreate::Existing(record) => return Ok(record),
                TrackerCreate::CodeConflict => {
                    tracing::warn!(harvest_id, "tracking code collision; regenerating");
                }
            }
        }

        Err(TraceError::AlreadyExists { attempts: CODE_GENERATION_ATTEMPTS })
    }

    /// Merge stage-completion evidence and recompute the derived status
    /// in one atomic store update.
    ///
    /// # Errors
    /// Returns [`TraceError::TrackerNotFound`] when the harvest was never
    /// initialized (required ordering, not a retriable race), or a
    /// validation/store error.
    pub fn advance_stage(
        &self,
        harvest_id: &str,
        stage: Stage,
        submission: StageSubmission,
    ) -> ApiResult<TrackingRecord> {
        let mut store = self.open_store()?;
        self.advance_stage_in(&mut store, harvest_id, stage, submission)
    }

    fn advance_stage_in(
        &self,
        store: &mut SqliteStore,
        harvest_id: &str,
        stage: Stage,
        submission: StageSubmission,
    ) -> ApiResult<TrackingRecord> {
        let now = OffsetDateTime::now_utc();
        let merged = store
            .merge_tracker_by_harvest(harvest_id, |record| record.apply_stage(stage, submission, now))
            .map_err(trace_error)?
            .ok_or_else(|| TraceError::TrackerNotFound(harvest_id.to_string()))?;

        tracing::info!(
            harvest_id,
            stage = stage.as_str(),
            status = merged.status.as_str(),
            is_public = merged.is_public,
            "stage advanced"
        );
        Ok(merged)
    }

    /// Persist a manufacturer submission and advance the manufacturing
    /// stage for its harvest lineage.
    ///
    /// # Errors
    /// Returns [`TraceError::UpstreamNotFound`] when the harvest does not
    /// resolve, [`TraceError::TrackerNotFound`] when it was never
    /// initialized, or a store error.
    pub fn record_manufacturing(
        &self,
        submission: ManufacturingSubmission,
    ) -> ApiResult<(ManufacturingRecord, TrackingRecord)> {
        let mut store = self.open_store()?;
        ensure_lineage(&store, &submission.harvest_id)?;

        let record = ManufacturingRecord {
            record_id: RecordId::new(),
            harvest_id: submission.harvest_id.clone(),
            manufacturer: submission.manufacturer.clone(),
            batch_id: submission.batch_id.clone(),
            product_name: submission.product_name.clone(),
            process_description: submission.process_description.clone(),
            started_at: submission.started_at,
            completed_at: submission.completed_at,
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_manufacturing(&record).map_err(store_error)?;

        let mut metadata = submission.metadata;
        metadata
            .insert("batch_id".to_string(), serde_json::Value::String(submission.batch_id.clone()));
        let stage_submission = StageSubmission {
            performed_by: submission.manufacturer,
            location: submission.location,
            description: submission.process_description,
            metadata,
            product_name: submission.product_name,
            batch_id: Some(submission.batch_id),
        };

        let tracker = self.advance_stage_in(
            &mut store,
            &submission.harvest_id,
            Stage::Manufacturing,
            stage_submission,
        )?;
        Ok((record, tracker))
    }

    /// Persist a laboratory submission and advance the lab-testing stage
    /// for its harvest lineage.
    ///
    /// # Errors
    /// Returns [`TraceError::UpstreamNotFound`] when the harvest does not
    /// resolve, [`TraceError::TrackerNotFound`] when it was never
    /// initialized, or a store error.
    pub fn record_lab(&self, submission: LabSubmission) -> ApiResult<(LabRecord, TrackingRecord)> {
        let mut store = self.open_store()?;
        ensure_lineage(&store, &submission.harvest_id)?;

        let record = LabRecord {
            record_id: RecordId::new(),
            harvest_id: submission.harvest_id.clone(),
            lab: submission.lab.clone(),
            test_type: submission.test_type.clone(),
            result: submission.result.clone(),
            report_uri: submission.report_uri,
            tested_at: submission.tested_at,
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_lab(&record).map_err(store_error)?;

        let mut metadata = submission.metadata;
        metadata
            .insert("test_type".to_string(), serde_json::Value::String(submission.test_type.clone()));
        metadata.insert("result".to_string(), serde_json::Value::String(submission.result.clone()));
        let stage_submission = StageSubmission {
            performed_by: submission.lab,
            location: None,
            description: Some(format!("{}: {}", submission.test_type, submission.result)),
            metadata,
            product_name: None,
            batch_id: None,
        };

        let tracker = self.advance_stage_in(
            &mut store,
            &submission.harvest_id,
            Stage::LabTesting,
            stage_submission,
        )?;
        Ok((record, tracker))
    }

    /// Administrative promotion: publish unconditionally, regardless of
    /// which stages are present.
    ///
    /// # Errors
    /// Returns [`TraceError::NotFound`] when the code does not resolve.
    pub fn promote_to_public(&self, code: &TrackingCode) -> ApiResult<TrackingRecord> {
        let mut store = self.open_store()?;
        let promoted = store
            .merge_tracker_by_code(code, |record| {
                record.promote(PublicationPath::Administrative);
                record.updated_at = OffsetDateTime::now_utc();
                Ok(())
            })
            .map_err(trace_error)?
            .ok_or_else(|| TraceError::NotFound(code.to_string()))?;

        tracing::info!(tracking_code = %code, "tracking record promoted to public");
        Ok(promoted)
    }

    /// Delete and recreate the tracking record for a harvest, yielding a
    /// new code. Recovery-only: any previously distributed code stops
    /// resolving.
    ///
    /// # Errors
    /// Returns [`TraceError::UpstreamNotFound`] when the harvest does not
    /// resolve, or a store error.
    pub fn regenerate(&self, harvest_id: &str) -> ApiResult<TrackingRecord> {
        let mut store = self.open_store()?;
        let deleted = store.delete_tracker(harvest_id).map_err(store_error)?;
        if deleted {
            tracing::warn!(harvest_id, "tracking record deleted for regeneration");
        }
        self.initialize_in(&mut store, harvest_id)
    }

    /// Read path by public code.
    ///
    /// # Errors
    /// Returns [`TraceError::NotFound`] when absent, or
    /// [`TraceError::NotPublicYet`] when `require_public` is set and the
    /// record has not been promoted.
    pub fn lookup_by_code(&self, code: &TrackingCode, require_public: bool) -> ApiResult<TrackingRecord> {
        let store = self.open_store()?;
        let record = store
            .find_tracker_by_code(code)
            .map_err(store_error)?
            .ok_or_else(|| TraceError::NotFound(code.to_string()))?;
        require_visibility(record, require_public)
    }

    /// Read path by harvest lineage key.
    ///
    /// # Errors
    /// Returns [`TraceError::NotFound`] when absent, or
    /// [`TraceError::NotPublicYet`] when `require_public` is set and the
    /// record has not been promoted.
    pub fn lookup_by_harvest(&self, harvest_id: &str, require_public: bool) -> ApiResult<TrackingRecord> {
        let store = self.open_store()?;
        let record = store
            .find_tracker_by_harvest(harvest_id)
            .map_err(store_error)?
            .ok_or_else(|| TraceError::NotFound(harvest_id.to_string()))?;
        require_visibility(record, require_public)
    }

    /// Assemble the point-in-time snapshot for one tracking code: the
    /// tracker, its harvest, and the first matching manufacturing and
    /// lab records. Missing downstream records are not an error; the
    /// corresponding sections stay empty for an in-progress chain.
    ///
    /// # Errors
    /// Returns [`TraceError::NotFound`] when the code does not resolve,
    /// or [`TraceError::Inconsistent`] when the tracker outlived its
    /// harvest.
    pub fn build_snapshot(&self, code: &TrackingCode) -> ApiResult<ProvenanceSnapshot> {
        let store = self.open_store()?;
        self.build_snapshot_in(&store, code)
    }

    fn build_snapshot_in(&self, store: &SqliteStore, code: &TrackingCode) -> ApiResult<ProvenanceSnapshot> {
        let tracker = store
            .find_tracker_by_code(code)
            .map_err(store_error)?
            .ok_or_else(|| TraceError::NotFound(code.to_string()))?;

        let harvest = store
            .find_harvest(&tracker.harvest_id)
            .map_err(store_error)?
            .ok_or_else(|| TraceError::Inconsistent {
                tracking_code: tracker.tracking_code.to_string(),
                harvest_id: tracker.harvest_id.clone(),
            })?;

        let manufacturing =
            store.find_first_manufacturing(&tracker.harvest_id).map_err(store_error)?;
        let lab_testing = store.find_first_lab(&tracker.harvest_id).map_err(store_error)?;

        Ok(ProvenanceSnapshot {
            tracking_code: tracker.tracking_code,
            status: tracker.status,
            is_public: tracker.is_public,
            published_by: tracker.published_by,
            product_name: tracker.product_name,
            batch_id: tracker.batch_id,
            verification_url: tracker.verification_url,
            generated_at: OffsetDateTime::now_utc(),
            harvest,
            manufacturing,
            lab_testing,
            stages: tracker.stages,
        })
    }

    /// Build the snapshot behind the public-visibility gate and hand it
    /// to the renderer. The gate runs before the renderer is touched;
    /// the rendered bytes are returned opaquely.
    ///
    /// # Errors
    /// Returns [`TraceError::NotPublicYet`] for unpromoted records,
    /// snapshot errors, or [`TraceError::RendererFailure`] from the
    /// collaborator (not retried here).
    pub fn generate_document(
        &self,
        code: &TrackingCode,
        renderer: &dyn DocumentRenderer,
    ) -> ApiResult<Vec<u8>> {
        let store = self.open_store()?;
        let tracker = store
            .find_tracker_by_code(code)
            .map_err(store_error)?
            .ok_or_else(|| TraceError::NotFound(code.to_string()))?;
        if !tracker.is_public {
            return Err(TraceError::NotPublicYet(code.to_string()));
        }

        let snapshot = self.build_snapshot_in(&store, code)?;
        let document = renderer.render(&snapshot)?;
        tracing::debug!(tracking_code = %code, bytes = document.len(), "document generated");
        Ok(document)
    }
}

fn ensure_lineage(store: &SqliteStore, harvest_id: &str) -> ApiResult<()> {
    if store.find_harvest(harvest_id).map_err(store_error)?.is_none() {
        return Err(TraceError::UpstreamNotFound(harvest_id.to_string()));
    }
    if store.find_tracker_by_harvest(harvest_id).map_err(store_error)?.is_none() {
        return Err(TraceError::TrackerNotFound(harvest_id.to_string()));
    }
    Ok(())
}

fn require_visibility(record: TrackingRecord, require_public: bool) -> ApiResult<TrackingRecord> {
    if require_public && !record.is_public {
        return Err(TraceError::NotPublicYet(record.tracking_code.to_string()));
    }
    Ok(record)
}

/// Recover the typed error a merge closure raised inside the store,
/// falling back to a wrapped store error.
fn trace_error(err: anyhow::Error) -> TraceError {
    match err.downcast::<TraceError>() {
        Ok(trace) => trace,
        Err(other) => TraceError::Store(format!("{other:#}")),
    }
}

fn store_error(err: anyhow::Error) -> TraceError {
    TraceError::Store(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use croptrace_core::{ChainStatus, HtmlRenderer};

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("croptrace-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_api() -> (CropTraceApi, PathBuf) {
        let db_path = unique_temp_db_path();
        (CropTraceApi::new(db_path.clone(), "https://trace.example.org"), db_path)
    }

    fn harvest_submission(harvest_id: &str) -> HarvestSubmission {
        HarvestSubmission {
            harvest_id: harvest_id.to_string(),
            species: "Ashwagandha".to_string(),
            weight_kg: 10.0,
            season: "winter".to_string(),
            location: "Field 7".to_string(),
            farmer: "farmer-anita".to_string(),
            proof_uri: None,
        }
    }

    fn manufacturing_submission(harvest_id: &str, batch_id: &str) -> ManufacturingSubmission {
        ManufacturingSubmission {
            harvest_id: harvest_id.to_string(),
            manufacturer: "acme-botanicals".to_string(),
            batch_id: batch_id.to_string(),
            product_name: Some("Ashwagandha Extract".to_string()),
            process_description: Some("dried and milled".to_string()),
            location: Some("Plant 2".to_string()),
            started_at: None,
            completed_at: None,
            metadata: BTreeMap::new(),
        }
    }

    fn lab_submission(harvest_id: &str, result: &str) -> LabSubmission {
        LabSubmission {
            harvest_id: harvest_id.to_string(),
            lab: "metro-labs".to_string(),
            test_type: "heavy-metals".to_string(),
            result: result.to_string(),
            report_uri: None,
            tested_at: None,
            metadata: BTreeMap::new(),
        }
    }

    struct FailingRenderer;

    impl DocumentRenderer for FailingRenderer {
        fn render(&self, _snapshot: &ProvenanceSnapshot) -> Result<Vec<u8>, TraceError> {
            Err(TraceError::RendererFailure("out of renderer instances".to_string()))
        }
    }

    #[test]
    fn initialize_is_idempotent_per_lineage() -> ApiResult<()> {
        let (api, db_path) = test_api();
        let first = api.record_harvest(harvest_submission("H-1"))?;
        let second = api.initialize("H-1")?;
        let third = api.initialize("H-1")?;

        assert_eq!(first.tracking_code, second.tracking_code);
        assert_eq!(second.tracking_code, third.tracking_code);
        assert_eq!(third.stages.len(), 1);
        assert_eq!(third.status, ChainStatus::Initialized);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn initialize_fails_for_unknown_lineage() {
        let (api, db_path) = test_api();
        let missing = api.initialize("H-404");
        assert_eq!(missing, Err(TraceError::UpstreamNotFound("H-404".to_string())));
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn advance_without_initialize_fails_with_tracker_not_found() {
        let (api, db_path) = test_api();
        let advanced = api.advance_stage(
            "H-9",
            Stage::Manufacturing,
            StageSubmission {
                performed_by: "acme-botanicals".to_string(),
                ..StageSubmission::default()
            },
        );
        assert_eq!(advanced, Err(TraceError::TrackerNotFound("H-9".to_string())));
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn submission_before_initialize_fails_with_tracker_not_found() -> ApiResult<()> {
        let (api, db_path) = test_api();
        // Manufacturer submits against a missing harvest entirely.
        let missing = api.record_manufacturing(manufacturing_submission("H-404", "B-1"));
        assert_eq!(missing, Err(TraceError::UpstreamNotFound("H-404".to_string())));
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn ordered_scenario_reaches_public_and_renders_the_report() -> ApiResult<()> {
        let (api, db_path) = test_api();
        let tracker = api.record_harvest(harvest_submission("H-1"))?;
        let code = tracker.tracking_code.clone();

        let (_, after_manufacturing) =
            api.record_manufacturing(manufacturing_submission("H-1", "B-9"))?;
        assert_eq!(after_manufacturing.status, ChainStatus::Manufacturing);
        assert!(!after_manufacturing.is_public);

        let (_, after_lab) = api.record_lab(lab_submission("H-1", "PASS"))?;
        assert_eq!(after_lab.status, ChainStatus::Public);
        assert!(after_lab.is_public);
        assert_eq!(after_lab.published_by, Some(PublicationPath::Automatic));
        assert_eq!(after_lab.tracking_code, code);

        let snapshot = api.build_snapshot(&code)?;
        let manufacturing = snapshot
            .manufacturing
            .as_ref()
            .ok_or_else(|| TraceError::Validation("manufacturing section missing".to_string()))?;
        assert_eq!(manufacturing.batch_id, "B-9");
        let lab = snapshot
            .lab_testing
            .as_ref()
            .ok_or_else(|| TraceError::Validation("lab section missing".to_string()))?;
        assert_eq!(lab.result, "PASS");
        assert_eq!(snapshot.harvest.species, "Ashwagandha");

        let document = api.generate_document(&code, &HtmlRenderer)?;
        let html = String::from_utf8_lossy(&document);
        assert!(html.contains("B-9"));
        assert!(html.contains("PASS"));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn lab_first_parks_in_testing_and_stays_gated() -> ApiResult<()> {
        let (api, db_path) = test_api();
        let tracker = api.record_harvest(harvest_submission("H-2"))?;
        let code = tracker.tracking_code.clone();

        let (_, after_lab) = api.record_lab(lab_submission("H-2", "PASS"))?;
        assert_eq!(after_lab.status, ChainStatus::Testing);
        assert!(!after_lab.is_public);

        let gated = api.generate_document(&code, &HtmlRenderer);
        assert_eq!(gated, Err(TraceError::NotPublicYet(code.to_string())));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn administrative_promotion_opens_the_gate_for_incomplete_chains() -> ApiResult<()> {
        let (api, db_path) = test_api();
        let tracker = api.record_harvest(harvest_submission("H-3"))?;
        let code = tracker.tracking_code.clone();

        let gated = api.generate_document(&code, &HtmlRenderer);
        assert_eq!(gated, Err(TraceError::NotPublicYet(code.to_string())));

        let promoted = api.promote_to_public(&code)?;
        assert_eq!(promoted.status, ChainStatus::Public);
        assert_eq!(promoted.published_by, Some(PublicationPath::Administrative));

        // Only the harvest stage is present, yet the report renders.
        let document = api.generate_document(&code, &HtmlRenderer)?;
        assert!(!document.is_empty());

        let snapshot = api.build_snapshot(&code)?;
        assert_eq!(snapshot.manufacturing, None);
        assert_eq!(snapshot.lab_testing, None);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn merge_keeps_both_stage_entries_with_their_own_metadata() -> ApiResult<()> {
        let (api, db_path) = test_api();
        let _ = api.record_harvest(harvest_submission("H-4"))?;
        let (_, _) = api.record_manufacturing(manufacturing_submission("H-4", "B-9"))?;
        let (_, merged) = api.record_lab(lab_submission("H-4", "PASS"))?;

        assert_eq!(merged.stages.len(), 3);
        let manufacturing = merged
            .stages
            .get(&Stage::Manufacturing)
            .ok_or_else(|| TraceError::Validation("manufacturing entry missing".to_string()))?;
        assert_eq!(
            manufacturing.metadata.get("batch_id"),
            Some(&serde_json::Value::String("B-9".to_string()))
        );
        let lab = merged
            .stages
            .get(&Stage::LabTesting)
            .ok_or_else(|| TraceError::Validation("lab entry missing".to_string()))?;
        assert_eq!(lab.metadata.get("result"), Some(&serde_json::Value::String("PASS".to_string())));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn lookup_honors_the_require_public_flag() -> ApiResult<()> {
        let (api, db_path) = test_api();
        let tracker = api.record_harvest(harvest_submission("H-5"))?;
        let code = tracker.tracking_code.clone();

        assert!(api.lookup_by_code(&code, false).is_ok());
        assert_eq!(
            api.lookup_by_code(&code, true),
            Err(TraceError::NotPublicYet(code.to_string()))
        );

        let _ = api.promote_to_public(&code)?;
        assert!(api.lookup_by_code(&code, true).is_ok());
        assert!(api.lookup_by_harvest("H-5", true).is_ok());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn regenerate_invalidates_the_old_code() -> ApiResult<()> {
        let (api, db_path) = test_api();
        let original = api.record_harvest(harvest_submission("H-6"))?;
        let regenerated = api.regenerate("H-6")?;

        assert_ne!(original.tracking_code, regenerated.tracking_code);
        assert_eq!(
            api.lookup_by_code(&original.tracking_code, false),
            Err(TraceError::NotFound(original.tracking_code.to_string()))
        );
        assert!(api.lookup_by_code(&regenerated.tracking_code, false).is_ok());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn renderer_failure_surfaces_untouched() -> ApiResult<()> {
        let (api, db_path) = test_api();
        let tracker = api.record_harvest(harvest_submission("H-7"))?;
        let code = tracker.tracking_code.clone();
        let _ = api.promote_to_public(&code)?;

        let failed = api.generate_document(&code, &FailingRenderer);
        assert_eq!(
            failed,
            Err(TraceError::RendererFailure("out of renderer instances".to_string()))
        );

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn snapshot_for_unknown_code_is_not_found() {
        let (api, db_path) = test_api();
        let code = TrackingCode::generate();
        assert_eq!(api.build_snapshot(&code), Err(TraceError::NotFound(code.to_string())));
        let _ = std::fs::remove_file(&db_path);
    }
}
