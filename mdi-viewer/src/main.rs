//! MDI viewer entry point.
//!
//! ```text
//! mdi-viewer fetch <FILE_ID> <START> <END>   Fetch and summarize a slice range
//! mdi-viewer inspect <CAPTURE>               Decode a capture of raw MDI frames
//! mdi-viewer --config <path>                 Load a custom config TOML
//! mdi-viewer --server <url>                  Override the transport URL
//! mdi-viewer --gen-config                    Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mdi_viewer::commands;
use mdi_viewer::config::ViewerConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "mdi-viewer", about = "Stream, cache and inspect MDI volume slices")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "mdi-viewer.toml")]
    config: PathBuf,

    /// Server URL, overriding `transport.url`.
    #[arg(short, long)]
    server: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch slices START..=END (either direction) of a file.
    Fetch {
        file_id: String,
        start: u32,
        end: u32,
    },
    /// Decode every frame in a capture file.
    Inspect { capture: PathBuf },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", ViewerConfig::default().to_toml()?);
        return Ok(());
    }

    let Some(command) = cli.command else {
        eprintln!("no command given; see --help");
        std::process::exit(2);
    };

    let config = ViewerConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mdi-viewer v{}", env!("CARGO_PKG_VERSION"));

    match command {
        Command::Fetch { file_id, start, end } => {
            let config = config.resolve(cli.server)?;
            info!(url = %config.transport.url, %file_id, start, end, "fetching");
            commands::fetch(config, &file_id, start, end).await?;
        }
        Command::Inspect { capture } => {
            let summary = commands::inspect(&capture).await?;
            println!(
                "{} frames decoded, {} rejected: {:?}",
                summary.frames, summary.rejected, summary.by_type
            );
        }
    }

    Ok(())
}
