mod cli;
mod error;
mod landmarks;
mod pipeline;
mod run_artifacts;
mod run_context;
mod video;

use anyhow::Result;
use cli::{Args, Command};
use landmarks::sidecar::sidecar_factory;
use pipeline::merge::merge_checkpoints;
use pipeline::orchestrator::{run_extraction, run_landmark_files};
use pipeline::relabel::relabel;
use pipeline::schema::CaptureSchema;
use tracing_subscriber::EnvFilter;
use video::opencv_opener;

fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse_args();
    let extractor_factory = sidecar_factory(args.sidecar_suffix);

    match args.command {
        Command::Extract(extract) => {
            let config = extract.into_config()?;
            let summary = run_extraction(&config, extractor_factory, opencv_opener())?;
            if let Some(artifact) = &summary.artifact {
                tracing::info!("Dataset written to {:?}", artifact);
            }
        }
        Command::LandmarkFiles(files) => {
            let config = files.into_config()?;
            let summary = run_landmark_files(&config, extractor_factory, opencv_opener())?;
            if let Some(manifest) = &summary.artifact {
                tracing::info!("Manifest written to {:?}", manifest);
            }
        }
        Command::Merge(merge) => {
            let config = merge.into_config()?;
            let schema = CaptureSchema::new(&config.groups, config.mode);
            let final_path = config.final_output_path();
            let report = merge_checkpoints(
                &config.output_folder,
                &config.dataset_name,
                &schema,
                &final_path,
            )?;
            tracing::info!(
                "Merged {} checkpoints ({} rows) into {:?}",
                report.files,
                report.rows,
                final_path
            );
        }
        Command::Relabel(relabel_args) => {
            relabel(
                &relabel_args.artifact,
                &relabel_args.label_csv,
                &relabel_args.output,
            )?;
        }
    }

    Ok(())
}
