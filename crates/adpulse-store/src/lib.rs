//! Deduplicating persistence engine for extracted marketing data.
//!
//! The uniqueness constraint on `(data_source_id, data_type,
//! data_date, data_hash)` is the load-bearing invariant of the whole
//! pipeline: it is enforced by the storage engine itself, so racing
//! writers cannot corrupt state; the loser's duplicate insert is
//! absorbed as already-current.

use std::str::FromStr;

use adpulse_core::{
    CredentialRecord, DataSource, ExtractedData, ExtractionConfig, ExtractionJob, JobKind,
    JobStatus, NormalizedRecord, Project, ScheduleConfig,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-store";

pub const DEFAULT_QUERY_LIMIT: u32 = 1000;

/// Idempotent DDL, executed at connection startup. Future migrations
/// gate on `PRAGMA user_version`.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
    id           TEXT PRIMARY KEY,
    project_id   TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    platform     TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    is_active    INTEGER NOT NULL DEFAULT 1,
    created_at   TEXT NOT NULL,
    UNIQUE (project_id, platform)
);

CREATE TABLE IF NOT EXISTS data_sources (
    id                  TEXT PRIMARY KEY,
    project_id          TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    credential_id       TEXT NOT NULL REFERENCES credentials(id) ON DELETE CASCADE,
    platform            TEXT NOT NULL,
    source_name         TEXT NOT NULL,
    extraction_config   TEXT NOT NULL,
    schedule_config     TEXT NOT NULL,
    is_active           INTEGER NOT NULL DEFAULT 1,
    last_extraction_at  TEXT,
    next_extraction_at  TEXT,
    extraction_status   TEXT NOT NULL DEFAULT 'pending',
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS extraction_jobs (
    id                 TEXT PRIMARY KEY,
    data_source_id     TEXT NOT NULL REFERENCES data_sources(id) ON DELETE CASCADE,
    job_kind           TEXT NOT NULL,
    status             TEXT NOT NULL DEFAULT 'pending',
    started_at         TEXT,
    completed_at       TEXT,
    records_processed  INTEGER NOT NULL DEFAULT 0,
    error_message      TEXT,
    created_at         TEXT NOT NULL
);

-- Rows are append-only; corrections arrive as new rows with a new
-- content hash.
CREATE TABLE IF NOT EXISTS extracted_data (
    id                 TEXT PRIMARY KEY,
    data_source_id     TEXT NOT NULL REFERENCES data_sources(id) ON DELETE CASCADE,
    extraction_job_id  TEXT NOT NULL REFERENCES extraction_jobs(id) ON DELETE CASCADE,
    data_type          TEXT NOT NULL,
    data_date          TEXT NOT NULL,
    raw_data           TEXT NOT NULL,
    processed_data     TEXT NOT NULL,
    metrics            TEXT,
    data_hash          TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    UNIQUE (data_source_id, data_type, data_date, data_hash)
);

CREATE INDEX IF NOT EXISTS idx_data_source_date ON extracted_data(data_source_id, data_date);
CREATE INDEX IF NOT EXISTS idx_data_type_date ON extracted_data(data_type, data_date);
CREATE INDEX IF NOT EXISTS idx_jobs_source_created ON extraction_jobs(data_source_id, created_at);

PRAGMA user_version = 1;
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ─── Fingerprinting ──────────────────────────────────────────────────

/// Serializes a JSON value with object keys in sorted order at every
/// nesting level, so identical logical content always renders the
/// identical byte string regardless of insertion order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Content fingerprint over `"{source}:{type}:{date}:{payload}"`,
/// the dedup key for one extracted unit.
pub fn fingerprint(
    data_source_id: Uuid,
    data_type: &str,
    data_date: NaiveDate,
    payload: &Value,
) -> String {
    let input = format!(
        "{data_source_id}:{data_type}:{data_date}:{}",
        canonical_json(payload)
    );
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of one transactional batch commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    pub processed: u64,
    pub inserted: u64,
    pub duplicates: u64,
}

// ─── Store ───────────────────────────────────────────────────────────

/// SQLite-backed store. Cloning is cheap; the pool is shared.
#[derive(Clone)]
pub struct MetricStore {
    pool: SqlitePool,
}

impl MetricStore {
    /// Open (or create) the database at `url` and run schema
    /// initialisation.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store, useful for testing. Pinned to a single pool
    /// connection so the database outlives individual acquires.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    // ── Projects / credentials / data sources ──

    pub async fn create_project(&self, name: &str) -> Result<Project> {
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO projects (id, name, is_active, created_at) VALUES (?, ?, ?, ?)")
            .bind(project.id.to_string())
            .bind(&project.name)
            .bind(project.is_active)
            .bind(project.created_at)
            .execute(&self.pool)
            .await?;
        Ok(project)
    }

    pub async fn project(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, name, is_active, created_at FROM projects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| project_from_row(&row)).transpose()
    }

    pub async fn active_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, name, is_active, created_at FROM projects WHERE is_active = 1 ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(project_from_row).collect()
    }

    pub async fn create_credential(
        &self,
        project_id: Uuid,
        platform: &str,
        payload: &Map<String, Value>,
    ) -> Result<CredentialRecord> {
        let credential = CredentialRecord {
            id: Uuid::new_v4(),
            project_id,
            platform: platform.to_string(),
            payload: payload.clone(),
            is_active: true,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO credentials (id, project_id, platform, payload_json, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(credential.id.to_string())
        .bind(credential.project_id.to_string())
        .bind(&credential.platform)
        .bind(serde_json::to_string(&credential.payload)?)
        .bind(credential.is_active)
        .bind(credential.created_at)
        .execute(&self.pool)
        .await?;
        Ok(credential)
    }

    /// Credential-provider contract: the decrypted payload or nothing;
    /// never partially-decrypted data.
    pub async fn credential(&self, id: Uuid) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(
            "SELECT id, project_id, platform, payload_json, is_active, created_at \
             FROM credentials WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| credential_from_row(&row)).transpose()
    }

    pub async fn create_data_source(
        &self,
        project_id: Uuid,
        credential_id: Uuid,
        platform: &str,
        source_name: &str,
        extraction_config: &ExtractionConfig,
        schedule_config: &ScheduleConfig,
    ) -> Result<DataSource> {
        let now = Utc::now();
        let source = DataSource {
            id: Uuid::new_v4(),
            project_id,
            credential_id,
            platform: platform.to_string(),
            source_name: source_name.to_string(),
            extraction_config: extraction_config.clone(),
            schedule_config: schedule_config.clone(),
            is_active: true,
            last_extraction_at: None,
            next_extraction_at: None,
            extraction_status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO data_sources (id, project_id, credential_id, platform, source_name, \
             extraction_config, schedule_config, is_active, extraction_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(source.id.to_string())
        .bind(source.project_id.to_string())
        .bind(source.credential_id.to_string())
        .bind(&source.platform)
        .bind(&source.source_name)
        .bind(serde_json::to_string(&source.extraction_config)?)
        .bind(serde_json::to_string(&source.schedule_config)?)
        .bind(source.is_active)
        .bind(source.extraction_status.as_str())
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(source)
    }

    pub async fn data_source(&self, id: Uuid) -> Result<Option<DataSource>> {
        let row = sqlx::query(&format!(
            "{DATA_SOURCE_COLUMNS} FROM data_sources WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| data_source_from_row(&row)).transpose()
    }

    pub async fn set_data_source_active(&self, id: Uuid, is_active: bool) -> Result<()> {
        sqlx::query("UPDATE data_sources SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn active_sources_for_project(&self, project_id: Uuid) -> Result<Vec<DataSource>> {
        let rows = sqlx::query(&format!(
            "{DATA_SOURCE_COLUMNS} FROM data_sources \
             WHERE project_id = ? AND is_active = 1 ORDER BY created_at"
        ))
        .bind(project_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(data_source_from_row).collect()
    }

    /// Deletes cascade through jobs and extracted rows.
    pub async fn delete_data_source(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM data_sources WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Job bookkeeping ──

    pub async fn create_job(&self, data_source_id: Uuid, kind: JobKind) -> Result<ExtractionJob> {
        let job = ExtractionJob {
            id: Uuid::new_v4(),
            data_source_id,
            kind,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            records_processed: 0,
            error_message: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO extraction_jobs (id, data_source_id, job_kind, status, records_processed, created_at) \
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.data_source_id.to_string())
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    /// `pending -> running` on dispatch; the data source mirrors the
    /// transition.
    pub async fn start_job(&self, job_id: Uuid, data_source_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE extraction_jobs SET status = 'running', started_at = ? WHERE id = ?")
            .bind(now)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE data_sources SET extraction_status = 'running', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(data_source_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Commits the whole batch for one job as a single transaction:
    /// either all new rows land together with the job bookkeeping, or
    /// none do. A row whose fingerprint tuple already exists is
    /// absorbed as already-current, not an error.
    pub async fn commit_extraction(
        &self,
        job_id: Uuid,
        data_source_id: Uuid,
        records: &[NormalizedRecord],
    ) -> Result<CommitStats> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for record in records {
            let data_hash = fingerprint(
                data_source_id,
                &record.data_type,
                record.data_date,
                &record.content(),
            );
            let result = sqlx::query(
                "INSERT INTO extracted_data (id, data_source_id, extraction_job_id, data_type, \
                 data_date, raw_data, processed_data, metrics, data_hash, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (data_source_id, data_type, data_date, data_hash) DO NOTHING",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(data_source_id.to_string())
            .bind(job_id.to_string())
            .bind(&record.data_type)
            .bind(record.data_date)
            .bind(serde_json::to_string(&record.raw)?)
            .bind(serde_json::to_string(&record.processed())?)
            .bind(serde_json::to_string(&record.metric_values())?)
            .bind(&data_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        sqlx::query(
            "UPDATE extraction_jobs SET status = 'completed', completed_at = ?, records_processed = ? \
             WHERE id = ?",
        )
        .bind(now)
        .bind(records.len() as i64)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE data_sources SET extraction_status = 'completed', last_extraction_at = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(data_source_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let processed = records.len() as u64;
        debug!(%job_id, processed, inserted, "extraction batch committed");
        Ok(CommitStats {
            processed,
            inserted,
            duplicates: processed - inserted,
        })
    }

    /// `running -> failed` with the error detail; terminal.
    pub async fn fail_job(
        &self,
        job_id: Uuid,
        data_source_id: Uuid,
        error_message: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE extraction_jobs SET status = 'failed', completed_at = ?, error_message = ? \
             WHERE id = ?",
        )
        .bind(now)
        .bind(error_message)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE data_sources SET extraction_status = 'failed', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(data_source_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn job(&self, id: Uuid) -> Result<Option<ExtractionJob>> {
        let row = sqlx::query(&format!("{JOB_COLUMNS} FROM extraction_jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    pub async fn latest_job_for_source(&self, data_source_id: Uuid) -> Result<Option<ExtractionJob>> {
        let row = sqlx::query(&format!(
            "{JOB_COLUMNS} FROM extraction_jobs WHERE data_source_id = ? \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(data_source_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    // ── Extracted data queries ──

    /// True when any stored row's date overlaps the inclusive range.
    pub async fn exists_for_range(
        &self,
        data_source_id: Uuid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM extracted_data \
             WHERE data_source_id = ? AND data_date >= ? AND data_date <= ? LIMIT 1",
        )
        .bind(data_source_id.to_string())
        .bind(start_date)
        .bind(end_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Newest stored row inside the range, for short-circuit responses
    /// that reference pre-existing data.
    pub async fn latest_extracted_in_range(
        &self,
        data_source_id: Uuid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT id FROM extracted_data \
             WHERE data_source_id = ? AND data_date >= ? AND data_date <= ? \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(data_source_id.to_string())
        .bind(start_date)
        .bind(end_date)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let id: String = row.try_get("id")?;
            parse_uuid(&id)
        })
        .transpose()
    }

    pub async fn latest_extracted_for_source(
        &self,
        data_source_id: Uuid,
    ) -> Result<Option<ExtractedData>> {
        let row = sqlx::query(&format!(
            "{EXTRACTED_COLUMNS} FROM extracted_data WHERE data_source_id = ? \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(data_source_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| extracted_from_row(&row)).transpose()
    }

    /// Filtered query, newest extraction first, capped at
    /// [`DEFAULT_QUERY_LIMIT`] unless the filter says otherwise.
    pub async fn query_extracted(&self, filter: &ExtractedDataFilter) -> Result<Vec<ExtractedData>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT e.id, e.data_source_id, e.extraction_job_id, e.data_type, e.data_date, \
             e.raw_data, e.processed_data, e.metrics, e.data_hash, e.created_at \
             FROM extracted_data e JOIN data_sources d ON d.id = e.data_source_id WHERE 1 = 1",
        );
        if let Some(id) = filter.data_source_id {
            builder.push(" AND e.data_source_id = ");
            builder.push_bind(id.to_string());
        }
        if let Some(id) = filter.project_id {
            builder.push(" AND d.project_id = ");
            builder.push_bind(id.to_string());
        }
        if let Some(start) = filter.start_date {
            builder.push(" AND e.data_date >= ");
            builder.push_bind(start);
        }
        if let Some(end) = filter.end_date {
            builder.push(" AND e.data_date <= ");
            builder.push_bind(end);
        }
        builder.push(" ORDER BY e.created_at DESC, e.data_date DESC LIMIT ");
        builder.push_bind(i64::from(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT)));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(extracted_from_row).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedDataFilter {
    pub data_source_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub limit: Option<u32>,
}

// ─── Row decoding ────────────────────────────────────────────────────

const DATA_SOURCE_COLUMNS: &str = "SELECT id, project_id, credential_id, platform, source_name, \
     extraction_config, schedule_config, is_active, last_extraction_at, next_extraction_at, \
     extraction_status, created_at, updated_at";

const JOB_COLUMNS: &str = "SELECT id, data_source_id, job_kind, status, started_at, completed_at, \
     records_processed, error_message, created_at";

const EXTRACTED_COLUMNS: &str = "SELECT id, data_source_id, extraction_job_id, data_type, \
     data_date, raw_data, processed_data, metrics, data_hash, created_at";

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|err| StoreError::Corrupt(format!("bad uuid {text}: {err}")))
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    let id: String = row.try_get("id")?;
    Ok(Project {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn credential_from_row(row: &SqliteRow) -> Result<CredentialRecord> {
    let id: String = row.try_get("id")?;
    let project_id: String = row.try_get("project_id")?;
    let payload_json: String = row.try_get("payload_json")?;
    let payload: Map<String, Value> = serde_json::from_str(&payload_json)
        .map_err(|err| StoreError::Corrupt(format!("credential payload: {err}")))?;
    Ok(CredentialRecord {
        id: parse_uuid(&id)?,
        project_id: parse_uuid(&project_id)?,
        platform: row.try_get("platform")?,
        payload,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn data_source_from_row(row: &SqliteRow) -> Result<DataSource> {
    let id: String = row.try_get("id")?;
    let project_id: String = row.try_get("project_id")?;
    let credential_id: String = row.try_get("credential_id")?;
    let extraction_config: String = row.try_get("extraction_config")?;
    let schedule_config: String = row.try_get("schedule_config")?;
    let status: String = row.try_get("extraction_status")?;
    Ok(DataSource {
        id: parse_uuid(&id)?,
        project_id: parse_uuid(&project_id)?,
        credential_id: parse_uuid(&credential_id)?,
        platform: row.try_get("platform")?,
        source_name: row.try_get("source_name")?,
        extraction_config: ExtractionConfig::from_json_str(&extraction_config),
        schedule_config: ScheduleConfig::from_json_str(&schedule_config),
        is_active: row.try_get("is_active")?,
        last_extraction_at: row.try_get::<Option<DateTime<Utc>>, _>("last_extraction_at")?,
        next_extraction_at: row.try_get::<Option<DateTime<Utc>>, _>("next_extraction_at")?,
        extraction_status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown extraction status {status}")))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<ExtractionJob> {
    let id: String = row.try_get("id")?;
    let data_source_id: String = row.try_get("data_source_id")?;
    let kind: String = row.try_get("job_kind")?;
    let status: String = row.try_get("status")?;
    Ok(ExtractionJob {
        id: parse_uuid(&id)?,
        data_source_id: parse_uuid(&data_source_id)?,
        kind: JobKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job kind {kind}")))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job status {status}")))?,
        started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
        records_processed: row.try_get("records_processed")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn extracted_from_row(row: &SqliteRow) -> Result<ExtractedData> {
    let id: String = row.try_get("id")?;
    let data_source_id: String = row.try_get("data_source_id")?;
    let extraction_job_id: String = row.try_get("extraction_job_id")?;
    let raw_data: String = row.try_get("raw_data")?;
    let processed_data: String = row.try_get("processed_data")?;
    let metrics: Option<String> = row.try_get("metrics")?;
    Ok(ExtractedData {
        id: parse_uuid(&id)?,
        data_source_id: parse_uuid(&data_source_id)?,
        extraction_job_id: parse_uuid(&extraction_job_id)?,
        data_type: row.try_get("data_type")?,
        data_date: row.try_get("data_date")?,
        raw_data: lenient_json(&raw_data),
        processed_data: lenient_json(&processed_data),
        metrics: metrics.as_deref().map(lenient_json).unwrap_or(Value::Null),
        data_hash: row.try_get("data_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Malformed stored JSON degrades to an empty object, mirroring the
/// lenient config reads.
fn lenient_json(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::Object(Map::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(day: NaiveDate, campaign: &str, clicks: i64) -> NormalizedRecord {
        let mut dimensions = Map::new();
        dimensions.insert("date".into(), json!(day.format("%Y-%m-%d").to_string()));
        dimensions.insert("campaign_name".into(), json!(campaign));
        let mut metrics = Map::new();
        metrics.insert("clicks".into(), json!(clicks));
        metrics.insert("impressions".into(), json!(clicks * 20));
        NormalizedRecord {
            platform: "klaviyo".into(),
            extracted_at: Utc::now(),
            data_type: "campaign".into(),
            data_date: day,
            dimensions,
            metrics,
            raw: json!({ "campaign_name": campaign, "clicks": clicks }),
        }
    }

    async fn seeded_store() -> (MetricStore, DataSource) {
        let store = MetricStore::connect_in_memory().await.unwrap();
        let project = store.create_project("Acme Marketing").await.unwrap();
        let mut payload = Map::new();
        payload.insert("api_key".into(), json!("k-test"));
        let credential = store
            .create_credential(project.id, "klaviyo", &payload)
            .await
            .unwrap();
        let source = store
            .create_data_source(
                project.id,
                credential.id,
                "klaviyo",
                "Email campaigns",
                &ExtractionConfig::default(),
                &ScheduleConfig::default(),
            )
            .await
            .unwrap();
        (store, source)
    }

    #[test]
    fn canonical_json_sorts_keys_at_every_level() {
        let value = json!({
            "b": 1,
            "a": { "z": true, "m": [1, 2, { "y": 0, "x": 0 }] }
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"m":[1,2,{"x":0,"y":0}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn fingerprint_is_deterministic_across_insertion_order() {
        let source = Uuid::new_v4();
        let day = date(2026, 2, 28);
        let first = json!({ "platform": "google_ads", "metrics": { "clicks": 500, "impressions": 10000 } });
        let second = json!({ "metrics": { "impressions": 10000, "clicks": 500 }, "platform": "google_ads" });

        let a = fingerprint(source, "campaign", day, &first);
        let b = fingerprint(source, "campaign", day, &second);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_changes_with_any_value() {
        let source = Uuid::new_v4();
        let day = date(2026, 2, 28);
        let base = json!({ "metrics": { "clicks": 500 } });
        let changed = json!({ "metrics": { "clicks": 501 } });

        assert_ne!(
            fingerprint(source, "campaign", day, &base),
            fingerprint(source, "campaign", day, &changed)
        );
        assert_ne!(
            fingerprint(source, "campaign", day, &base),
            fingerprint(source, "ad_group", day, &base)
        );
        assert_ne!(
            fingerprint(source, "campaign", day, &base),
            fingerprint(source, "campaign", date(2026, 3, 1), &base)
        );
    }

    #[tokio::test]
    async fn commit_dedups_on_fingerprint_tuple() {
        let (store, source) = seeded_store().await;
        let day = date(2026, 2, 27);
        let job = store.create_job(source.id, JobKind::Manual).await.unwrap();
        store.start_job(job.id, source.id).await.unwrap();
        let stats = store
            .commit_extraction(
                job.id,
                source.id,
                &[record(day, "Summer Sale", 100), record(day, "Brand Awareness", 50)],
            )
            .await
            .unwrap();
        assert_eq!(
            stats,
            CommitStats {
                processed: 2,
                inserted: 2,
                duplicates: 0
            }
        );

        // Re-extraction later: fresh extraction timestamps, one record
        // unchanged, one with a moved metric.
        let second_job = store.create_job(source.id, JobKind::Manual).await.unwrap();
        store.start_job(second_job.id, source.id).await.unwrap();
        let stats = store
            .commit_extraction(
                second_job.id,
                source.id,
                &[record(day, "Summer Sale", 100), record(day, "Brand Awareness", 51)],
            )
            .await
            .unwrap();
        assert_eq!(
            stats,
            CommitStats {
                processed: 2,
                inserted: 1,
                duplicates: 1
            }
        );

        let finished = store.job(second_job.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.records_processed, 2);
        assert!(finished.completed_at.is_some());

        let refreshed = store.data_source(source.id).await.unwrap().unwrap();
        assert_eq!(refreshed.extraction_status, JobStatus::Completed);
        assert!(refreshed.last_extraction_at.is_some());
    }

    #[tokio::test]
    async fn fail_job_marks_job_and_source() {
        let (store, source) = seeded_store().await;
        let job = store.create_job(source.id, JobKind::Scheduled).await.unwrap();
        store.start_job(job.id, source.id).await.unwrap();
        store
            .fail_job(job.id, source.id, "credential validation failed")
            .await
            .unwrap();

        let failed = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.kind, JobKind::Scheduled);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("credential validation failed")
        );
        assert!(failed.started_at.is_some());

        let refreshed = store.data_source(source.id).await.unwrap().unwrap();
        assert_eq!(refreshed.extraction_status, JobStatus::Failed);
        assert!(refreshed.last_extraction_at.is_none());
    }

    #[tokio::test]
    async fn exists_for_range_matches_inclusive_overlap() {
        let (store, source) = seeded_store().await;
        let job = store.create_job(source.id, JobKind::Manual).await.unwrap();
        store.start_job(job.id, source.id).await.unwrap();
        store
            .commit_extraction(job.id, source.id, &[record(date(2026, 2, 27), "Summer Sale", 10)])
            .await
            .unwrap();

        assert!(store
            .exists_for_range(source.id, date(2026, 2, 27), date(2026, 2, 27))
            .await
            .unwrap());
        assert!(store
            .exists_for_range(source.id, date(2026, 2, 1), date(2026, 2, 28))
            .await
            .unwrap());
        assert!(!store
            .exists_for_range(source.id, date(2026, 3, 1), date(2026, 3, 2))
            .await
            .unwrap());
        assert!(store
            .latest_extracted_in_range(source.id, date(2026, 2, 27), date(2026, 2, 27))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn query_is_newest_first_filtered_and_capped() {
        let (store, source) = seeded_store().await;
        let job = store.create_job(source.id, JobKind::Manual).await.unwrap();
        store.start_job(job.id, source.id).await.unwrap();
        let records: Vec<NormalizedRecord> = (0..5u32)
            .map(|i| record(date(2026, 2, 20 + i), "Summer Sale", 10 + i as i64))
            .collect();
        store.commit_extraction(job.id, source.id, &records).await.unwrap();

        let all = store
            .query_extracted(&ExtractedDataFilter {
                project_id: Some(source.project_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].data_date, date(2026, 2, 24));
        assert_eq!(all[0].data_hash.len(), 64);
        assert!(all[0].processed_data.get("platform").is_some());

        let capped = store
            .query_extracted(&ExtractedDataFilter {
                data_source_id: Some(source.id),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);

        let ranged = store
            .query_extracted(&ExtractedDataFilter {
                data_source_id: Some(source.id),
                start_date: Some(date(2026, 2, 23)),
                end_date: Some(date(2026, 2, 24)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ranged.len(), 2);

        let other_project = store
            .query_extracted(&ExtractedDataFilter {
                project_id: Some(Uuid::new_v4()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(other_project.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_source_cascades_to_jobs_and_rows() {
        let (store, source) = seeded_store().await;
        let job = store.create_job(source.id, JobKind::Backfill).await.unwrap();
        store.start_job(job.id, source.id).await.unwrap();
        store
            .commit_extraction(job.id, source.id, &[record(date(2026, 2, 27), "Summer Sale", 10)])
            .await
            .unwrap();

        store.delete_data_source(source.id).await.unwrap();
        assert!(store.data_source(source.id).await.unwrap().is_none());
        assert!(store.latest_job_for_source(source.id).await.unwrap().is_none());
        let rows = store
            .query_extracted(&ExtractedDataFilter {
                data_source_id: Some(source.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn inactive_sources_are_excluded_from_project_listing() {
        let (store, source) = seeded_store().await;
        let listed = store.active_sources_for_project(source.project_id).await.unwrap();
        assert_eq!(listed.len(), 1);

        store.set_data_source_active(source.id, false).await.unwrap();
        let listed = store.active_sources_for_project(source.project_id).await.unwrap();
        assert!(listed.is_empty());
    }
}
