use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use lmo_core::OrbitCategory;
use lmo_sync::{LaunchDataset, LaunchPipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lmo-cli")]
#[command(about = "Launch mass to orbit: fetch, classify and aggregate launch tables")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every source and print the per-year summary.
    Sync {
        /// Print only the run line when the dataset fingerprint did not change.
        #[arg(long)]
        skip_unchanged: bool,
        /// Treat this date as today when closing the current year's series.
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// List the configured sources.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync {
        skip_unchanged: false,
        today: None,
    }) {
        Commands::Sync {
            skip_unchanged,
            today,
        } => {
            let pipeline = LaunchPipeline::new(config)?;
            let dataset = match today {
                Some(today) => pipeline.run_at(today).await?,
                None => pipeline.run_once().await?,
            };
            let stats = dataset.parse_stats();
            println!(
                "sync complete: run_id={} sources={} launches={} skipped={} changed={} \
                 fingerprint={}",
                dataset.run_id,
                dataset.sources.len(),
                dataset.launches.len(),
                stats.skipped(),
                dataset.changed,
                dataset.fingerprint
            );
            if skip_unchanged && !dataset.changed {
                println!("dataset unchanged, skipping summary");
            } else {
                print_summary(&dataset);
            }
        }
        Commands::Sources => {
            for source in &config.sources {
                println!("{}\t{}\t{}", source.id, source.family, source.url);
            }
        }
    }

    Ok(())
}

fn print_summary(dataset: &LaunchDataset) {
    for report in &dataset.sources {
        println!(
            "source {}: {:?}, {} bytes, {} accepted, {} skipped",
            report.source.id,
            report.fetch,
            report.bytes,
            report.stats.accepted,
            report.stats.skipped()
        );
    }

    for row in &dataset.pivot.rows {
        let breakdown = OrbitCategory::ALL
            .iter()
            .filter(|c| row.mass_for(**c) > 0)
            .map(|c| format!("{}={}", c, row.mass_for(*c)))
            .collect::<Vec<_>>()
            .join(", ");
        println!("{}: {} kg [{}]", row.year, row.total_kg(), breakdown);
    }

    for series in &dataset.cumulative {
        println!(
            "cumulative {}: {} kg over {} launches",
            series.year,
            series.final_mass_kg(),
            series.points.iter().filter(|p| !p.synthetic).count()
        );
    }
}
