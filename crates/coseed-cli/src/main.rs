use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use coseed_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "coseed")]
#[command(about = "Generate company upsert SQL batches from a CSV export")]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags win over the COSEED_* environment variables.
#[derive(Debug, Args)]
struct ConfigOverrides {
    #[arg(long, global = true)]
    input: Option<PathBuf>,
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true, value_parser = parse_batch_size)]
    batch_size: Option<usize>,
    #[arg(long, global = true)]
    rules: Option<PathBuf>,
}

impl ConfigOverrides {
    fn apply(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(input) = self.input {
            config.input_path = input;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(rules) = self.rules {
            config.rules_path = Some(rules);
        }
        config
    }
}

fn parse_batch_size(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("batch size must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(err) => Err(format!("invalid batch size {value:?}: {err}")),
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert the CSV export into SQL batch files.
    Generate,
    /// Print the sector each name would be assigned.
    Classify { names: Vec<String> },
    /// Print the active rule table in evaluation order.
    Rules,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.overrides.apply(SyncConfig::from_env());
    let pipeline = SyncPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Generate) {
        Commands::Generate => {
            let summary = pipeline.run_once()?;
            println!(
                "generate complete: run_id={} companies={} batches={} skipped={} duplicates={} summary={}",
                summary.run_id,
                summary.companies,
                summary.batches.len(),
                summary.rows_skipped,
                summary.duplicates_dropped,
                summary.summary_path.display()
            );
        }
        Commands::Classify { names } => {
            for name in names {
                println!("{}\t{}", pipeline.rules().classify(&name), name);
            }
        }
        Commands::Rules => {
            let rules = pipeline.rules();
            for (i, rule) in rules.rules().iter().enumerate() {
                println!("{:>2}. {} <- {}", i + 1, rule.sector, rule.contains_any.join(" | "));
            }
            println!(" *. {}", rules.fallback());
        }
    }

    Ok(())
}
