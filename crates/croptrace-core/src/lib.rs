use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub const TRACKING_CODE_LEN: usize = 32;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TraceError {
    #[error("harvest record not found for lineage key {0}")]
    UpstreamNotFound(String),
    #[error("no tracking record for lineage key {0}; the harvest must be initialized first")]
    TrackerNotFound(String),
    #[error("tracking record not found: {0}")]
    NotFound(String),
    #[error("tracking code collision persisted after {attempts} generation attempts")]
    AlreadyExists { attempts: u32 },
    #[error("tracking record {0} is not public yet")]
    NotPublicYet(String),
    #[error("document renderer failed: {0}")]
    RendererFailure(String),
    #[error("tracking record {tracking_code} references missing harvest {harvest_id}")]
    Inconsistent { tracking_code: String, harvest_id: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

/// Opaque public identifier embedded in the scannable code and
/// verification URL. Fixed-length lowercase hex, 128 bits of OS entropy.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrackingCode(String);

impl TrackingCode {
    /// Generate a fresh code from the operating system CSPRNG.
    ///
    /// Collision probability is negligible, not zero; callers treat a
    /// uniqueness violation on insert as a signal to generate again.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0_u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parse a candidate code, normalizing case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.len() != TRACKING_CODE_LEN {
            return None;
        }
        if !normalized.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TrackingCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-generated identifier for manufacturing and lab submissions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    HarvestRecorded,
    Manufacturing,
    LabTesting,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HarvestRecorded => "harvest_recorded",
            Self::Manufacturing => "manufacturing",
            Self::LabTesting => "lab_testing",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "harvest_recorded" => Some(Self::HarvestRecorded),
            "manufacturing" => Some(Self::Manufacturing),
            "lab_testing" => Some(Self::LabTesting),
            _ => None,
        }
    }
}

/// Lifecycle status derived from accumulated stage evidence.
///
/// `Completed` is part of the declared lifecycle but is transient on the
/// automatic path: a lab advance with manufacturing evidence present
/// promotes straight to `Public` within the same write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Initialized,
    Manufacturing,
    Testing,
    Completed,
    Public,
}

impl ChainStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Manufacturing => "manufacturing",
            Self::Testing => "testing",
            Self::Completed => "completed",
            Self::Public => "public",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initialized" => Some(Self::Initialized),
            "manufacturing" => Some(Self::Manufacturing),
            "testing" => Some(Self::Testing),
            "completed" => Some(Self::Completed),
            "public" => Some(Self::Public),
            _ => None,
        }
    }
}

/// Which code path granted public visibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PublicationPath {
    Automatic,
    Administrative,
}

impl PublicationPath {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Administrative => "administrative",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "automatic" => Some(Self::Automatic),
            "administrative" => Some(Self::Administrative),
            _ => None,
        }
    }
}

/// Harvest submission recorded by a farmer. Read-only to the tracking
/// core once created; `harvest_id` is the lineage key that threads
/// through every downstream record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarvestRecord {
    pub harvest_id: String,
    pub species: String,
    pub weight_kg: f64,
    pub season: String,
    pub location: String,
    pub farmer: String,
    pub proof_uri: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManufacturingRecord {
    pub record_id: RecordId,
    pub harvest_id: String,
    pub manufacturer: String,
    pub batch_id: String,
    pub product_name: Option<String>,
    pub process_description: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabRecord {
    pub record_id: RecordId,
    pub harvest_id: String,
    pub lab: String,
    pub test_type: String,
    pub result: String,
    pub report_uri: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub tested_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One completion record for one pipeline stage. Entries are merged,
/// never deleted: a stage is either absent or present-and-complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageEntry {
    pub completed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub performed_by: String,
    pub location: Option<String>,
    pub description: Option<String>,
    /// Open key-value extension map; known fields are typed above,
    /// unknown ones pass through opaquely.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StageEntry {
    /// Fold a re-submission into an existing entry. Scalar fields are
    /// replaced when the new submission provides them; metadata keys are
    /// merged with the newer value winning.
    pub fn merge_from(&mut self, other: StageEntry) {
        self.completed = true;
        self.timestamp = other.timestamp;
        self.performed_by = other.performed_by;
        if other.location.is_some() {
            self.location = other.location;
        }
        if other.description.is_some() {
            self.description = other.description;
        }
        for (key, value) in other.metadata {
            self.metadata.insert(key, value);
        }
    }
}

/// Stage-completion evidence as submitted by an actor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageSubmission {
    pub performed_by: String,
    pub location: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Denormalized display fields, refreshed opportunistically.
    pub product_name: Option<String>,
    pub batch_id: Option<String>,
}

impl StageSubmission {
    #[must_use]
    pub fn into_entry(self, timestamp: OffsetDateTime) -> StageEntry {
        StageEntry {
            completed: true,
            timestamp,
            performed_by: self.performed_by,
            location: self.location,
            description: self.description,
            metadata: self.metadata,
        }
    }
}

/// The one persisted structure owned by this core: exactly one per
/// harvest lineage, keyed by both `tracking_code` and `harvest_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingRecord {
    pub tracking_code: TrackingCode,
    pub harvest_id: String,
    pub status: ChainStatus,
    pub is_public: bool,
    pub published_by: Option<PublicationPath>,
    pub product_name: Option<String>,
    pub batch_id: Option<String>,
    pub verification_url: String,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageEntry>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TrackingRecord {
    /// Construct the initial record for a harvest, with the
    /// `harvest_recorded` stage populated from the harvest's own fields.
    #[must_use]
    pub fn initialize(
        tracking_code: TrackingCode,
        harvest: &HarvestRecord,
        base_url: &str,
        now: OffsetDateTime,
    ) -> Self {
        let verification_url = verification_url(base_url, &tracking_code);
        let mut stages = BTreeMap::new();
        stages.insert(Stage::HarvestRecorded, harvest_stage_entry(harvest, now));

        Self {
            tracking_code,
            harvest_id: harvest.harvest_id.clone(),
            status: ChainStatus::Initialized,
            is_public: false,
            published_by: None,
            product_name: None,
            batch_id: None,
            verification_url,
            stages,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge one stage advance and recompute the derived status.
    ///
    /// Status rules: a `manufacturing` advance sets `Manufacturing`
    /// unconditionally (re-submissions and out-of-order arrivals
    /// included, with no regression guard). A `lab_testing` advance sets
    /// `Testing` while manufacturing evidence is absent, and promotes to
    /// `Public` with `is_public = true` in the same update once it is
    /// present.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] for the `harvest_recorded`
    /// stage, which is only written at initialization.
    pub fn apply_stage(
        &mut self,
        stage: Stage,
        submission: StageSubmission,
        now: OffsetDateTime,
    ) -> Result<(), TraceError> {
        if stage == Stage::HarvestRecorded {
            return Err(TraceError::Validation(
                "the harvest_recorded stage is written at initialization".to_string(),
            ));
        }
        if submission.performed_by.trim().is_empty() {
            return Err(TraceError::Validation(
                "performed_by MUST be provided for every stage advance".to_string(),
            ));
        }

        if let Some(product_name) = submission.product_name.clone() {
            self.product_name = Some(product_name);
        }
        if let Some(batch_id) = submission.batch_id.clone() {
            self.batch_id = Some(batch_id);
        }

        let entry = submission.into_entry(now);
        match self.stages.get_mut(&stage) {
            Some(existing) => existing.merge_from(entry),
            None => {
                self.stages.insert(stage, entry);
            }
        }

        match stage {
            Stage::Manufacturing => {
                self.status = ChainStatus::Manufacturing;
            }
            Stage::LabTesting => {
                if self.stages.contains_key(&Stage::Manufacturing) {
                    self.promote(PublicationPath::Automatic);
                } else {
                    self.status = ChainStatus::Testing;
                }
            }
            Stage::HarvestRecorded => {}
        }

        self.updated_at = now;
        Ok(())
    }

    /// Set the public visibility flag and terminal status. The first
    /// granting path is recorded and kept; publishing an incomplete
    /// chain through the administrative path is an intentional escape
    /// hatch, so `is_public` is not a proxy for "all stages complete".
    pub fn promote(&mut self, path: PublicationPath) {
        if self.published_by.is_none() {
            self.published_by = Some(path);
        }
        self.status = ChainStatus::Public;
        self.is_public = true;
    }
}

/// Build the `harvest_recorded` stage entry from the harvest's fields.
#[must_use]
pub fn harvest_stage_entry(harvest: &HarvestRecord, now: OffsetDateTime) -> StageEntry {
    let mut metadata = BTreeMap::new();
    metadata.insert("species".to_string(), serde_json::Value::String(harvest.species.clone()));
    metadata.insert("season".to_string(), serde_json::Value::String(harvest.season.clone()));
    if let Some(weight) = serde_json::Number::from_f64(harvest.weight_kg) {
        metadata.insert("weight_kg".to_string(), serde_json::Value::Number(weight));
    }

    StageEntry {
        completed: true,
        timestamp: now,
        performed_by: harvest.farmer.clone(),
        location: Some(harvest.location.clone()),
        description: Some(format!("harvest of {} recorded", harvest.species)),
        metadata,
    }
}

/// Derive the public verification URL for a tracking code.
///
/// Deterministic in `base_url` and the code alone, so it can be
/// re-derived at any time without consulting mutable tracker state.
#[must_use]
pub fn verification_url(base_url: &str, code: &TrackingCode) -> String {
    format!("{}/t/{code}", base_url.trim_end_matches('/'))
}

/// Fully-resolved, renderer-ready aggregate for one tracking code.
/// The renderer needs no further store access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvenanceSnapshot {
    pub tracking_code: TrackingCode,
    pub status: ChainStatus,
    pub is_public: bool,
    pub published_by: Option<PublicationPath>,
    pub product_name: Option<String>,
    pub batch_id: Option<String>,
    pub verification_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub harvest: HarvestRecord,
    pub manufacturing: Option<ManufacturingRecord>,
    pub lab_testing: Option<LabRecord>,
    pub stages: BTreeMap<Stage, StageEntry>,
}

/// External document-rendering collaborator. Implementations are scoped
/// per call: any working state lives inside `render`, so the resource is
/// released on every exit path.
pub trait DocumentRenderer {
    /// Render one snapshot into an opaque document.
    ///
    /// # Errors
    /// Returns [`TraceError::RendererFailure`] when rendering fails.
    fn render(&self, snapshot: &ProvenanceSnapshot) -> Result<Vec<u8>, TraceError>;
}

/// Built-in HTML renderer used by the CLI and service.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlRenderer;

impl DocumentRenderer for HtmlRenderer {
    fn render(&self, snapshot: &ProvenanceSnapshot) -> Result<Vec<u8>, TraceError> {
        let mut body = String::new();
        body.push_str("<!doctype html>\n<html><head><meta charset=\"utf-8\">");
        body.push_str("<title>Provenance Report</title></head><body>\n");
        body.push_str(&format!(
            "<h1>Provenance Report {}</h1>\n",
            escape_html(snapshot.tracking_code.as_str())
        ));
        body.push_str(&format!("<p>Status: {}</p>\n", snapshot.status.as_str()));
        if let Some(product_name) = &snapshot.product_name {
            body.push_str(&format!("<p>Product: {}</p>\n", escape_html(product_name)));
        }
        if let Some(batch_id) = &snapshot.batch_id {
            body.push_str(&format!("<p>Batch: {}</p>\n", escape_html(batch_id)));
        }

        body.push_str("<h2>Harvest</h2>\n<ul>\n");
        body.push_str(&format!(
            "<li>Species: {}</li>\n<li>Weight: {} kg</li>\n<li>Season: {}</li>\n<li>Farmer: {}</li>\n<li>Location: {}</li>\n",
            escape_html(&snapshot.harvest.species),
            snapshot.harvest.weight_kg,
            escape_html(&snapshot.harvest.season),
            escape_html(&snapshot.harvest.farmer),
            escape_html(&snapshot.harvest.location),
        ));
        body.push_str("</ul>\n");

        if let Some(manufacturing) = &snapshot.manufacturing {
            body.push_str("<h2>Manufacturing</h2>\n<ul>\n");
            body.push_str(&format!(
                "<li>Manufacturer: {}</li>\n<li>Batch: {}</li>\n",
                escape_html(&manufacturing.manufacturer),
                escape_html(&manufacturing.batch_id),
            ));
            if let Some(description) = &manufacturing.process_description {
                body.push_str(&format!("<li>Process: {}</li>\n", escape_html(description)));
            }
            body.push_str("</ul>\n");
        }

        if let Some(lab) = &snapshot.lab_testing {
            body.push_str("<h2>Lab Testing</h2>\n<ul>\n");
            body.push_str(&format!(
                "<li>Lab: {}</li>\n<li>Test: {}</li>\n<li>Result: {}</li>\n",
                escape_html(&lab.lab),
                escape_html(&lab.test_type),
                escape_html(&lab.result),
            ));
            body.push_str("</ul>\n");
        }

        body.push_str("<h2>Stage Trail</h2>\n<ul>\n");
        for (stage, entry) in &snapshot.stages {
            body.push_str(&format!(
                "<li>{}: by {} at {}</li>\n",
                stage.as_str(),
                escape_html(&entry.performed_by),
                entry.timestamp,
            ));
        }
        body.push_str("</ul>\n");
        body.push_str(&format!(
            "<p><a href=\"{}\">Verify online</a></p>\n</body></html>\n",
            escape_html(&snapshot.verification_url)
        ));

        Ok(body.into_bytes())
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
