//! Extraction orchestration: drives each data source through
//! credential lookup → capability → normalizer → persistence, and
//! folds per-source outcomes into project-level reports.

use std::sync::Arc;
use std::time::Duration;

use adpulse_core::{
    DataSource, ExtractedData, ExtractionJob, JobKind, NormalizedRecord, ProjectReport,
    ProjectStatus, SourceOutcome, SourceStatus,
};
use adpulse_integrations::{
    build_http_client, normalize_record, HttpClientConfig, IntegrationRegistry,
};
use adpulse_store::{ExtractedDataFilter, MetricStore, StoreError};
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-extract";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub scheduler_enabled: bool,
    pub extract_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://adpulse.db".to_string()),
            scheduler_enabled: std::env::var("ADPULSE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            extract_cron: std::env::var("ADPULSE_EXTRACT_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("ADPULSE_USER_AGENT")
                .unwrap_or_else(|_| "adpulse/0.1".to_string()),
            http_timeout_secs: std::env::var("ADPULSE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// Conditions that short-circuit a whole project batch. Per-source
/// failures never surface here; they land in the [`SourceOutcome`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("project not found: {0}")]
    ProjectNotFound(Uuid),
    #[error("project is not active: {0}")]
    ProjectInactive(Uuid),
    #[error("no active data sources for project {0}")]
    NoActiveDataSources(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub force_refresh: bool,
    pub kind: JobKind,
}

impl ExtractionRequest {
    pub fn manual(start_date: NaiveDate, end_date: NaiveDate, force_refresh: bool) -> Self {
        Self {
            start_date,
            end_date,
            force_refresh,
            kind: JobKind::Manual,
        }
    }
}

enum RunSuccess {
    AlreadyCurrent { existing_data_id: Option<Uuid> },
    Fresh { processed: u64, stored: u64 },
}

pub struct ExtractionPipeline {
    store: MetricStore,
    registry: IntegrationRegistry,
}

impl ExtractionPipeline {
    pub fn new(store: MetricStore, registry: IntegrationRegistry) -> Self {
        Self { store, registry }
    }

    pub async fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        let store = MetricStore::connect(&config.database_url)
            .await
            .context("connecting metric store")?;
        let http = build_http_client(&HttpClientConfig {
            timeout: config.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self::new(store, IntegrationRegistry::with_client(http)))
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    pub fn registry(&self) -> &IntegrationRegistry {
        &self.registry
    }

    /// Runs the full pipeline for one data source. Every failure is
    /// caught at this boundary and returned as a structured outcome.
    ///
    /// A missing or inactive source is a configuration error and
    /// leaves no job row; from dispatch onward the job records the
    /// `pending -> running -> completed|failed` transitions.
    pub async fn extract_for_source(
        &self,
        data_source_id: Uuid,
        request: ExtractionRequest,
    ) -> SourceOutcome {
        let source = match self.store.data_source(data_source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => return SourceOutcome::failure(data_source_id, "data source not found"),
            Err(err) => return SourceOutcome::failure(data_source_id, err.to_string()),
        };

        let mut outcome = SourceOutcome {
            data_source_id,
            source_name: Some(source.source_name.clone()),
            platform: Some(source.platform.clone()),
            success: false,
            records_count: 0,
            stored_count: 0,
            job_id: None,
            existing_data_id: None,
            message: None,
            error: None,
        };

        if !source.is_active {
            outcome.error = Some("data source is not active".to_string());
            return outcome;
        }

        let job = match self.store.create_job(data_source_id, request.kind).await {
            Ok(job) => job,
            Err(err) => {
                outcome.error = Some(err.to_string());
                return outcome;
            }
        };
        outcome.job_id = Some(job.id);
        if let Err(err) = self.store.start_job(job.id, data_source_id).await {
            outcome.error = Some(err.to_string());
            return outcome;
        }

        match self.run_extraction(&source, &job, request).await {
            Ok(RunSuccess::Fresh { processed, stored }) => {
                outcome.success = true;
                outcome.records_count = processed;
                outcome.stored_count = stored;
                outcome.message = Some("data extraction completed successfully".to_string());
            }
            Ok(RunSuccess::AlreadyCurrent { existing_data_id }) => {
                outcome.success = true;
                outcome.existing_data_id = existing_data_id;
                outcome.message = Some("data already exists".to_string());
            }
            Err(err) => {
                let detail = err.to_string();
                error!(source = %data_source_id, error = %detail, "extraction failed");
                if let Err(store_err) = self.store.fail_job(job.id, data_source_id, &detail).await {
                    warn!(source = %data_source_id, error = %store_err, "could not record job failure");
                }
                outcome.error = Some(detail);
            }
        }
        outcome
    }

    async fn run_extraction(
        &self,
        source: &DataSource,
        job: &ExtractionJob,
        request: ExtractionRequest,
    ) -> anyhow::Result<RunSuccess> {
        let credential = self
            .store
            .credential(source.credential_id)
            .await?
            .filter(|credential| credential.is_active)
            .context("credential not found or inactive")?;

        if !request.force_refresh
            && self
                .store
                .exists_for_range(source.id, request.start_date, request.end_date)
                .await?
        {
            let existing_data_id = self
                .store
                .latest_extracted_in_range(source.id, request.start_date, request.end_date)
                .await?;
            self.store.commit_extraction(job.id, source.id, &[]).await?;
            return Ok(RunSuccess::AlreadyCurrent { existing_data_id });
        }

        let integration = self
            .registry
            .resolve(&source.platform, &credential.payload)
            .map_err(anyhow::Error::from)?;

        if !integration.validate_credentials().await {
            anyhow::bail!("credential validation failed");
        }

        info!(
            platform = %source.platform,
            source = %source.id,
            start = %request.start_date,
            end = %request.end_date,
            "extracting data"
        );

        let config = &source.extraction_config;
        let raw_records = integration
            .extract_data(
                request.start_date,
                request.end_date,
                &config.metrics,
                &config.dimensions,
                &config.filters,
            )
            .await
            .map_err(anyhow::Error::from)?;

        if raw_records.is_empty() {
            anyhow::bail!("no data returned from platform");
        }

        let normalized: Vec<NormalizedRecord> = raw_records
            .iter()
            .map(|raw| {
                normalize_record(
                    integration.platform_name(),
                    raw,
                    &config.metrics,
                    &config.dimensions,
                    config.data_type(),
                    request.start_date,
                )
            })
            .collect();

        let stats = self
            .store
            .commit_extraction(job.id, source.id, &normalized)
            .await?;
        info!(
            source = %source.id,
            processed = stats.processed,
            inserted = stats.inserted,
            "extraction committed"
        );
        Ok(RunSuccess::Fresh {
            processed: stats.processed,
            stored: stats.inserted,
        })
    }

    /// Extracts every active data source of the project sequentially.
    /// One source's failure never aborts the rest.
    pub async fn extract_for_project(
        &self,
        project_id: Uuid,
        request: ExtractionRequest,
    ) -> Result<ProjectReport, PipelineError> {
        let project = self
            .store
            .project(project_id)
            .await?
            .ok_or(PipelineError::ProjectNotFound(project_id))?;
        if !project.is_active {
            return Err(PipelineError::ProjectInactive(project_id));
        }
        let sources = self.store.active_sources_for_project(project_id).await?;
        if sources.is_empty() {
            return Err(PipelineError::NoActiveDataSources(project_id));
        }

        let mut results = Vec::with_capacity(sources.len());
        let mut successful_extractions = 0usize;
        let mut total_records = 0u64;
        for source in &sources {
            let outcome = self.extract_for_source(source.id, request).await;
            if outcome.success {
                successful_extractions += 1;
                total_records += outcome.records_count;
            }
            results.push(outcome);
        }

        Ok(ProjectReport {
            project_id,
            message: format!(
                "extraction completed for {successful_extractions}/{} data sources",
                sources.len()
            ),
            total_data_sources: sources.len(),
            successful_extractions,
            total_records,
            results,
        })
    }

    /// Status snapshot per active data source. Pure query; never
    /// triggers extraction work.
    pub async fn extraction_status(&self, project_id: Uuid) -> Result<ProjectStatus, PipelineError> {
        if self.store.project(project_id).await?.is_none() {
            return Err(PipelineError::ProjectNotFound(project_id));
        }
        let sources = self.store.active_sources_for_project(project_id).await?;

        let mut statuses = Vec::with_capacity(sources.len());
        for source in &sources {
            let latest_job = self.store.latest_job_for_source(source.id).await?;
            let latest_row = self.store.latest_extracted_for_source(source.id).await?;
            let status = if latest_job.is_none() && latest_row.is_none() {
                "never_extracted".to_string()
            } else {
                source.extraction_status.as_str().to_string()
            };
            statuses.push(SourceStatus {
                data_source_id: source.id,
                source_name: source.source_name.clone(),
                platform: source.platform.clone(),
                is_active: source.is_active,
                status,
                last_extraction_at: source.last_extraction_at,
                last_extraction_records: latest_job
                    .as_ref()
                    .map(|job| job.records_processed)
                    .unwrap_or(0),
                latest_data_date: latest_row.as_ref().map(|row| row.data_date),
                latest_job,
            });
        }

        Ok(ProjectStatus {
            project_id,
            total_data_sources: statuses.len(),
            active_data_sources: statuses.iter().filter(|status| status.is_active).count(),
            data_sources: statuses,
        })
    }

    pub async fn query_extracted(
        &self,
        filter: &ExtractedDataFilter,
    ) -> Result<Vec<ExtractedData>, PipelineError> {
        Ok(self.store.query_extracted(filter).await?)
    }

    /// When enabled, a cron job extracts the previous day for every
    /// active project. Single-range calls only; no backfill planning.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
        config: &PipelineConfig,
    ) -> anyhow::Result<Option<JobScheduler>> {
        if !config.scheduler_enabled {
            return Ok(None);
        }

        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(config.extract_cron.as_str(), move |_id, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                pipeline.run_scheduled_extraction().await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", config.extract_cron))?;
        scheduler.add(job).await.context("adding scheduler job")?;
        Ok(Some(scheduler))
    }

    async fn run_scheduled_extraction(&self) {
        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        let request = ExtractionRequest {
            start_date: yesterday,
            end_date: yesterday,
            force_refresh: false,
            kind: JobKind::Scheduled,
        };

        let projects = match self.store.active_projects().await {
            Ok(projects) => projects,
            Err(err) => {
                error!(error = %err, "scheduled extraction could not list projects");
                return;
            }
        };
        for project in projects {
            match self.extract_for_project(project.id, request).await {
                Ok(report) => info!(
                    project = %project.id,
                    successes = report.successful_extractions,
                    total = report.total_data_sources,
                    records = report.total_records,
                    "scheduled extraction finished"
                ),
                Err(err) => warn!(project = %project.id, error = %err, "scheduled extraction skipped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpulse_core::{ExtractionConfig, JobStatus, ScheduleConfig};
    use serde_json::{json, Map};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn pipeline() -> ExtractionPipeline {
        let store = MetricStore::connect_in_memory().await.unwrap();
        ExtractionPipeline::new(store, IntegrationRegistry::new().unwrap())
    }

    async fn seed_source(
        pipeline: &ExtractionPipeline,
        project_id: Uuid,
        platform: &str,
        payload: &Map<String, serde_json::Value>,
    ) -> DataSource {
        let credential = pipeline
            .store()
            .create_credential(project_id, platform, payload)
            .await
            .unwrap();
        let config = ExtractionConfig {
            metrics: vec![
                "impressions".into(),
                "clicks".into(),
                "cost".into(),
                "ctr".into(),
                "cpc".into(),
            ],
            dimensions: vec!["date".into(), "campaign_name".into()],
            ..Default::default()
        };
        pipeline
            .store()
            .create_data_source(
                project_id,
                credential.id,
                platform,
                &format!("{platform} source"),
                &config,
                &ScheduleConfig::default(),
            )
            .await
            .unwrap()
    }

    fn api_key_payload() -> Map<String, serde_json::Value> {
        let mut payload = Map::new();
        payload.insert("api_key".into(), json!("k-test"));
        payload
    }

    #[tokio::test]
    async fn re_extraction_is_idempotent() {
        let pipeline = pipeline().await;
        let project = pipeline.store().create_project("Acme").await.unwrap();
        let source = seed_source(&pipeline, project.id, "klaviyo", &api_key_payload()).await;

        let request = ExtractionRequest::manual(date(2026, 2, 27), date(2026, 2, 28), false);
        let first = pipeline.extract_for_source(source.id, request).await;
        assert!(first.success, "first extraction failed: {:?}", first.error);
        assert_eq!(first.records_count, 8);
        assert_eq!(first.stored_count, 8);
        assert!(first.job_id.is_some());

        // Same range without force: short-circuits on existing data.
        let second = pipeline.extract_for_source(source.id, request).await;
        assert!(second.success);
        assert_eq!(second.records_count, 0);
        assert_eq!(second.stored_count, 0);
        assert_eq!(second.message.as_deref(), Some("data already exists"));
        assert!(second.existing_data_id.is_some());

        // Forced refresh re-runs extraction; unchanged fingerprints do
        // not create new rows.
        let forced = pipeline
            .extract_for_source(
                source.id,
                ExtractionRequest::manual(date(2026, 2, 27), date(2026, 2, 28), true),
            )
            .await;
        assert!(forced.success);
        assert_eq!(forced.records_count, 8);
        assert_eq!(forced.stored_count, 0);

        let rows = pipeline
            .query_extracted(&ExtractedDataFilter {
                data_source_id: Some(source.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 8);
    }

    #[tokio::test]
    async fn one_failing_source_does_not_abort_the_project() {
        let pipeline = pipeline().await;
        let project = pipeline.store().create_project("Acme").await.unwrap();
        seed_source(&pipeline, project.id, "klaviyo", &api_key_payload()).await;
        // Shopify requires shop_domain + access_token; an empty payload
        // fails credential validation.
        seed_source(&pipeline, project.id, "shopify", &Map::new()).await;
        seed_source(&pipeline, project.id, "metricool", &api_key_payload()).await;

        let day = date(2026, 2, 27);
        let report = pipeline
            .extract_for_project(project.id, ExtractionRequest::manual(day, day, false))
            .await
            .unwrap();

        assert_eq!(report.total_data_sources, 3);
        assert_eq!(report.successful_extractions, 2);
        assert_eq!(report.total_records, 8);
        let failed: Vec<_> = report.results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].platform.as_deref(), Some("shopify"));
        assert_eq!(
            failed[0].error.as_deref(),
            Some("credential validation failed")
        );
    }

    #[tokio::test]
    async fn inverted_range_reports_no_data_returned() {
        let pipeline = pipeline().await;
        let project = pipeline.store().create_project("Acme").await.unwrap();
        let source = seed_source(&pipeline, project.id, "klaviyo", &api_key_payload()).await;

        let outcome = pipeline
            .extract_for_source(
                source.id,
                ExtractionRequest::manual(date(2026, 3, 2), date(2026, 3, 1), false),
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("no data returned from platform"));

        let job = pipeline
            .store()
            .latest_job_for_source(source.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("no data returned from platform")
        );
    }

    #[tokio::test]
    async fn configuration_errors_leave_no_job_row() {
        let pipeline = pipeline().await;
        let project = pipeline.store().create_project("Acme").await.unwrap();
        let source = seed_source(&pipeline, project.id, "klaviyo", &api_key_payload()).await;

        let missing = pipeline
            .extract_for_source(
                Uuid::new_v4(),
                ExtractionRequest::manual(date(2026, 2, 27), date(2026, 2, 27), false),
            )
            .await;
        assert!(!missing.success);
        assert_eq!(missing.error.as_deref(), Some("data source not found"));

        pipeline
            .store()
            .set_data_source_active(source.id, false)
            .await
            .unwrap();
        let inactive = pipeline
            .extract_for_source(
                source.id,
                ExtractionRequest::manual(date(2026, 2, 27), date(2026, 2, 27), false),
            )
            .await;
        assert!(!inactive.success);
        assert_eq!(inactive.error.as_deref(), Some("data source is not active"));
        assert!(inactive.job_id.is_none());
        assert!(pipeline
            .store()
            .latest_job_for_source(source.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn missing_project_short_circuits() {
        let pipeline = pipeline().await;
        let err = pipeline
            .extract_for_project(
                Uuid::new_v4(),
                ExtractionRequest::manual(date(2026, 2, 27), date(2026, 2, 27), false),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn status_is_a_pure_query() {
        let pipeline = pipeline().await;
        let project = pipeline.store().create_project("Acme").await.unwrap();
        let source = seed_source(&pipeline, project.id, "klaviyo", &api_key_payload()).await;

        let before = pipeline.extraction_status(project.id).await.unwrap();
        assert_eq!(before.total_data_sources, 1);
        assert_eq!(before.data_sources[0].status, "never_extracted");

        let day = date(2026, 2, 27);
        let outcome = pipeline
            .extract_for_source(source.id, ExtractionRequest::manual(day, day, false))
            .await;
        assert!(outcome.success);

        let after = pipeline.extraction_status(project.id).await.unwrap();
        let status = &after.data_sources[0];
        assert_eq!(status.status, "completed");
        assert_eq!(status.last_extraction_records, 4);
        assert_eq!(status.latest_data_date, Some(day));
        assert!(status.last_extraction_at.is_some());
        assert_eq!(
            status.latest_job.as_ref().map(|job| job.status),
            Some(JobStatus::Completed)
        );
    }
}
