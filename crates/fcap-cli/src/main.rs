use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use fcap_adapters::{
    load_search_fixture, open_upload_path, ApiPage, OpportunitySource, SearchFilters, SourceError,
};
use fcap_core::CanonicalOpportunity;
use fcap_pipeline::{
    export_csv, export_parquet_snapshot, inspect_upload, parse_choice, project_source, run_search,
    summarize, summary_markdown, ColumnMapping, PipelineConfig, ProjectionContext, UserChoices,
};
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "fcap")]
#[command(about = "Federal capture opportunity pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search SAM.gov and print a summary brief.
    Search {
        #[arg(long)]
        naics: Option<String>,
        #[arg(long)]
        agency: Option<String>,
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long = "type")]
        opportunity_type: Option<String>,
        #[arg(long)]
        set_aside: Option<String>,
        /// Replay a saved search response instead of calling the API.
        #[arg(long)]
        fixture: Option<PathBuf>,
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// List an upload's columns with mapping suggestions.
    Columns {
        file: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Project an uploaded CSV or Excel file.
    Upload {
        file: PathBuf,
        /// FIELD=COLUMN, repeatable.
        #[arg(long = "map", value_name = "FIELD=COLUMN")]
        map: Vec<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        export: Option<PathBuf>,
        #[arg(long)]
        parquet: Option<PathBuf>,
    },
    /// Run the HTTP API.
    Serve,
}

struct ReplaySource(ApiPage);

#[async_trait]
impl OpportunitySource for ReplaySource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(&self, _filters: &SearchFilters) -> Result<ApiPage, SourceError> {
        Ok(self.0.clone())
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Search {
            naics,
            agency,
            days,
            opportunity_type,
            set_aside,
            fixture,
            export,
        } => {
            let filters = SearchFilters {
                naics,
                agency,
                date_range_days: days,
                opportunity_type,
                set_aside,
            };
            let source: Box<dyn OpportunitySource> = match fixture {
                Some(path) => Box::new(ReplaySource(load_search_fixture(&path)?)),
                None => Box::new(config.sam_gov_source()?),
            };
            let ctx = ProjectionContext::new();
            let outcome = run_search(source.as_ref(), &filters, &ctx).await?;
            println!(
                "search complete: run_id={} total_records={} returned={}",
                ctx.run_id,
                outcome.total_records,
                outcome.projection.records.len()
            );
            print_brief(&outcome.projection.records);
            if let Some(path) = export {
                export_csv(&path, &outcome.projection.records).await?;
                println!("exported {}", path.display());
            }
        }
        Commands::Columns { file, content_type } => {
            let rules = config.load_fallback_rules()?;
            let mut source = open_upload_path(&file, content_type.as_deref())?;
            let today = ProjectionContext::new().today();
            let inspection = inspect_upload(source.as_mut(), 0, &rules, today)?;
            println!("columns:");
            for column in &inspection.columns {
                println!("  {column}");
            }
            println!("suggestions:");
            for (field, column) in &inspection.suggestions {
                println!("  {field}={column}");
            }
            println!("bindings without choices:");
            for (field, binding) in inspection.fallbacks.iter() {
                println!("  {field}: {binding:?}");
            }
        }
        Commands::Upload {
            file,
            map,
            chunk_size,
            content_type,
            export,
            parquet,
        } => {
            let choices = map
                .iter()
                .map(|m| parse_choice(m))
                .collect::<Result<UserChoices>>()
                .context("parsing --map")?;
            let rules = config.load_fallback_rules()?;
            let ctx = ProjectionContext::new();
            let mut source = open_upload_path(&file, content_type.as_deref())?;
            let mapping = ColumnMapping::build(source.columns(), &choices, &rules, ctx.today());
            let chunk_size = chunk_size.unwrap_or(config.chunk_size);
            let projection = project_source(source.as_mut(), &mapping, chunk_size, &ctx)?;
            println!(
                "upload complete: run_id={} file={} rows={} chunks={} issues={}",
                ctx.run_id,
                display_name(&file),
                projection.rows,
                projection.chunks,
                projection.issues.len()
            );
            print_brief(&projection.records);
            if let Some(path) = export {
                export_csv(&path, &projection.records).await?;
                println!("exported {}", path.display());
            }
            if let Some(dir) = parquet {
                let manifest = export_parquet_snapshot(&dir, &projection.records, &ctx).await?;
                println!("parquet manifest {}", manifest.display());
            }
        }
        Commands::Serve => {
            info!(port = config.web_port, "starting web server");
            fcap_web::serve(config).await?;
        }
    }

    Ok(())
}

fn print_brief(records: &[CanonicalOpportunity]) {
    println!("{}", summary_markdown(&summarize(records, 10)));
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
