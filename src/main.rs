use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tile_stream::{
    InstrumentConfig, Pipeline, PipelineConfig, RunOutcome, logging, serpentine_position,
};

#[derive(Parser)]
#[command(name = "tile-stream", version, about = "Convert microscope tiles while they are acquired")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch an acquisition directory and convert tiles as they appear
    Run {
        /// TOML configuration file
        #[arg(short, long, env = "TILE_STREAM_CONFIG")]
        config: PathBuf,

        /// Override the acquisition root
        #[arg(long)]
        root: Option<PathBuf>,

        /// Override the grid rows (sequential instruments)
        #[arg(long)]
        nrow: Option<usize>,

        /// Override the grid columns (sequential instruments)
        #[arg(long)]
        ncol: Option<usize>,

        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
    /// Print the grid position of a serpentine acquisition index
    Decode {
        #[arg(long)]
        ncol: usize,

        /// 1-based acquisition index
        index: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            root,
            nrow,
            ncol,
            poll_interval_ms,
        } => {
            let mut config = PipelineConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            if let Some(root) = root {
                config.root = root;
            }
            if let Some(interval) = poll_interval_ms {
                config.poll_interval_ms = interval;
            }
            if nrow.is_some() || ncol.is_some() {
                let InstrumentConfig::Sequential {
                    nrow: rows,
                    ncol: cols,
                    ..
                } = &mut config.instrument
                else {
                    bail!("--nrow/--ncol only apply to sequential instruments");
                };
                *rows = nrow.unwrap_or(*rows);
                *cols = ncol.unwrap_or(*cols);
            }
            config.validate()?;
            run(config).await
        }
        Command::Decode { ncol, index } => {
            let position = serpentine_position(index, ncol)
                .with_context(|| format!("index {index} with {ncol} columns has no position"))?;
            println!("{} {}", position.row, position.col);
            Ok(())
        }
    }
}

async fn run(config: PipelineConfig) -> Result<()> {
    let guard = logging::init_logging(config.log_file.as_deref())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current tile");
            on_signal.cancel();
        }
    });

    info!(root = %config.root.display(), "Starting acquisition pipeline");
    let pipeline = match Pipeline::from_config(&config, &cancel).await {
        Ok(pipeline) => pipeline,
        Err(_) if cancel.is_cancelled() => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let summary = pipeline.run(&cancel).await?;

    info!(
        processed = summary.processed,
        total = summary.total,
        converted = summary.converted,
        erased = summary.erased,
        retained = summary.retained,
        elapsed = ?summary.elapsed,
        "Run finished"
    );
    if summary.outcome == RunOutcome::Cancelled {
        drop(guard);
        std::process::exit(130);
    }
    Ok(())
}
