use adpulse_core::{ExtractionConfig, ScheduleConfig};
use adpulse_extract::{ExtractionPipeline, ExtractionRequest, PipelineConfig};
use adpulse_integrations::{requirements, SUPPORTED_PLATFORMS};
use adpulse_store::MetricStore;
use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::{json, Map};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "adpulse")]
#[command(about = "AdPulse marketing-performance extraction pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API (and the scheduler when enabled).
    Serve,
    /// Create the database schema.
    Migrate,
    /// Run one extraction for a data source or a whole project.
    Extract {
        #[arg(long, conflicts_with = "project")]
        source: Option<Uuid>,
        #[arg(long)]
        project: Option<Uuid>,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Per-source extraction status for a project.
    Status {
        #[arg(long)]
        project: Uuid,
    },
    /// Supported platforms and their credential requirements.
    Platforms,
    /// Seed a demo project with a stub-backed data source.
    SeedDemo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => adpulse_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            MetricStore::connect(&config.database_url).await?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Extract {
            source,
            project,
            start,
            end,
            force,
        } => {
            let config = PipelineConfig::from_env();
            let pipeline = ExtractionPipeline::from_config(&config).await?;
            let request = ExtractionRequest::manual(start, end, force);
            if let Some(source) = source {
                let outcome = pipeline.extract_for_source(source, request).await;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else if let Some(project) = project {
                let report = pipeline.extract_for_project(project, request).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                anyhow::bail!("pass --source or --project");
            }
        }
        Commands::Status { project } => {
            let config = PipelineConfig::from_env();
            let pipeline = ExtractionPipeline::from_config(&config).await?;
            let status = pipeline.extraction_status(project).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Platforms => {
            for platform in SUPPORTED_PLATFORMS {
                let reqs = requirements(platform);
                println!(
                    "{platform}: {} (required: {})",
                    reqs.description,
                    reqs.required_fields.join(", ")
                );
            }
        }
        Commands::SeedDemo => {
            let config = PipelineConfig::from_env();
            let store = MetricStore::connect(&config.database_url).await?;
            let project = store.create_project("Demo Project").await?;
            let mut payload = Map::new();
            payload.insert("api_key".into(), json!("demo-key"));
            let credential = store
                .create_credential(project.id, "klaviyo", &payload)
                .await?;
            let extraction_config = ExtractionConfig {
                metrics: vec![
                    "impressions".into(),
                    "clicks".into(),
                    "cost".into(),
                    "ctr".into(),
                    "cpc".into(),
                    "roas".into(),
                ],
                dimensions: vec!["date".into(), "campaign_name".into()],
                ..Default::default()
            };
            let source = store
                .create_data_source(
                    project.id,
                    credential.id,
                    "klaviyo",
                    "Demo email campaigns",
                    &extraction_config,
                    &ScheduleConfig::default(),
                )
                .await?;
            println!("project:     {}", project.id);
            println!("credential:  {}", credential.id);
            println!("data source: {}", source.id);
        }
    }

    Ok(())
}
