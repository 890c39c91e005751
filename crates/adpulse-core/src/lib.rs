//! Core domain model and job lifecycle types for AdPulse.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-core";

/// Flat field-name → value mapping as received from a platform API.
pub type RawRecord = Map<String, Value>;

/// What triggered an extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Scheduled,
    Manual,
    Backfill,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scheduled => "scheduled",
            JobKind::Manual => "manual",
            JobKind::Backfill => "backfill",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(JobKind::Scheduled),
            "manual" => Some(JobKind::Manual),
            "backfill" => Some(JobKind::Backfill),
            _ => None,
        }
    }
}

/// Extraction job lifecycle. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Per-source extraction parameters, stored as JSON on the data source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub data_type: Option<String>,
}

impl ExtractionConfig {
    /// Malformed JSON degrades to the empty configuration rather than
    /// failing the read.
    pub fn from_json_str(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }

    pub fn data_type(&self) -> &str {
        self.data_type.as_deref().unwrap_or("campaign")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub cron: Option<String>,
}

impl ScheduleConfig {
    pub fn from_json_str(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Decrypted credential payload as handed out by the credential
/// provider. Encryption at rest lives outside this workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    pub platform: String,
    pub payload: Map<String, Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A configured (credential, platform) pairing that can be extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: Uuid,
    pub project_id: Uuid,
    pub credential_id: Uuid,
    pub platform: String,
    pub source_name: String,
    pub extraction_config: ExtractionConfig,
    pub schedule_config: ScheduleConfig,
    pub is_active: bool,
    pub last_extraction_at: Option<DateTime<Utc>>,
    pub next_extraction_at: Option<DateTime<Utc>>,
    pub extraction_status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One invocation of the pipeline against one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub data_source_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExtractionJob {
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// One deduplicated unit of platform data for a (source, type, date).
/// Never mutated after insert; corrections arrive as new rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub id: Uuid,
    pub data_source_id: Uuid,
    pub extraction_job_id: Uuid,
    pub data_type: String,
    pub data_date: NaiveDate,
    pub raw_data: Value,
    pub processed_data: Value,
    pub metrics: Value,
    pub data_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Canonicalized handoff contract from the normalizer into the
/// persistence engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub platform: String,
    pub extracted_at: DateTime<Utc>,
    pub data_type: String,
    pub data_date: NaiveDate,
    pub dimensions: Map<String, Value>,
    pub metrics: Map<String, Value>,
    pub raw: Value,
}

impl NormalizedRecord {
    /// Stable content projection used for fingerprinting. The
    /// extraction timestamp is volatile and stays out of the hash
    /// input, otherwise re-extracting unchanged data would never
    /// dedup.
    pub fn content(&self) -> Value {
        json!({
            "platform": self.platform,
            "dimensions": self.dimensions,
            "metrics": self.metrics,
        })
    }

    /// Full canonical payload as persisted in `processed_data`.
    pub fn processed(&self) -> Value {
        json!({
            "platform": self.platform,
            "extracted_at": self.extracted_at.to_rfc3339(),
            "dimensions": self.dimensions,
            "metrics": self.metrics,
        })
    }

    pub fn metric_values(&self) -> Value {
        Value::Object(self.metrics.clone())
    }
}

/// Structured result of `extract_for_source`; failures are reported
/// here, never raised past the orchestrator boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub data_source_id: Uuid,
    pub source_name: Option<String>,
    pub platform: Option<String>,
    pub success: bool,
    pub records_count: u64,
    pub stored_count: u64,
    pub job_id: Option<Uuid>,
    pub existing_data_id: Option<Uuid>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn failure(data_source_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            data_source_id,
            source_name: None,
            platform: None,
            success: false,
            records_count: 0,
            stored_count: 0,
            job_id: None,
            existing_data_id: None,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Aggregate of per-source outcomes for one project extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectReport {
    pub project_id: Uuid,
    pub message: String,
    pub total_data_sources: usize,
    pub successful_extractions: usize,
    pub total_records: u64,
    pub results: Vec<SourceOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub data_source_id: Uuid,
    pub source_name: String,
    pub platform: String,
    pub is_active: bool,
    pub status: String,
    pub last_extraction_at: Option<DateTime<Utc>>,
    pub last_extraction_records: i64,
    pub latest_data_date: Option<NaiveDate>,
    pub latest_job: Option<ExtractionJob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub project_id: Uuid,
    pub data_sources: Vec<SourceStatus>,
    pub total_data_sources: usize,
    pub active_data_sources: usize,
}
