//! CloudRAID - retrieve files striped over six shards
//!
//! Usage:
//!   cloudraid split <input> <dir>         - Write the six shards of a file
//!   cloudraid fetch --filesize N --shard .. -o <out>
//!                                         - Reconstruct a file from its shards
//!   cloudraid config                      - Show the effective configuration

use clap::{Parser, Subcommand};
use cloudraid::{
    config::Config,
    raid::{encode, RequestParams, RAIDPARTS},
    scheduler::SchedulerGroup,
    transport::FileTransport,
    Error, Result,
};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Bytes handed to the output file per call
const WRITE_CHUNK: usize = 1 << 20;

#[derive(Parser)]
#[command(name = "cloudraid")]
#[command(version = "0.1.0")]
#[command(about = "Fetch and reconstruct files striped over six shards")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a file into part0 (parity) through part5
    Split {
        /// File to split
        input: PathBuf,

        /// Directory receiving the shards
        dir: PathBuf,
    },

    /// Reconstruct a file from its shards
    Fetch {
        /// Size of the original file in bytes
        #[arg(long)]
        filesize: u64,

        /// Shard path or file:// URL, parity first; "-" marks a missing shard
        #[arg(long = "shard", required = true)]
        shards: Vec<String>,

        /// First byte to retrieve
        #[arg(long, default_value_t = 0)]
        start: u64,

        /// Number of bytes to retrieve (default: up to the end)
        #[arg(long)]
        len: Option<u64>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Print request statistics as JSON when done
        #[arg(long)]
        stats: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write it to the configuration file
        #[arg(long)]
        save: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install log subscriber");
    }

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Split { input, dir } => cmd_split(&input, &dir),

        Commands::Fetch {
            filesize,
            shards,
            start,
            len,
            output,
            stats,
        } => cmd_fetch(config_path, filesize, shards, start, len, &output, stats),

        Commands::Config { save } => cmd_config(config_path, save),
    }
}

fn cmd_split(input: &Path, dir: &Path) -> Result<()> {
    let data = std::fs::read(input)?;
    std::fs::create_dir_all(dir)?;

    for (part, shard) in encode(&data).iter().enumerate() {
        let path = dir.join(format!("part{}", part));
        std::fs::write(&path, shard)?;
        info!("wrote {:?} ({} bytes)", path, shard.len());
    }

    println!("filesize: {}", data.len());
    Ok(())
}

fn cmd_fetch(
    config_path: &Path,
    filesize: u64,
    shards: Vec<String>,
    start: u64,
    len: Option<u64>,
    output: &Path,
    stats: bool,
) -> Result<()> {
    if shards.len() != RAIDPARTS {
        return Err(Error::Config(format!(
            "--shard must be given {} times, got {}",
            RAIDPARTS,
            shards.len()
        )));
    }

    let config = Config::load_or_default(config_path)?;
    let len = len.unwrap_or_else(|| filesize.saturating_sub(start));
    let urls = shards
        .into_iter()
        .map(|shard| if shard == "-" { String::new() } else { shard });
    let params = RequestParams::new(filesize, urls)?.with_range(start, len)?;

    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;
    let transport = FileTransport::new(runtime.handle().clone());
    let group = SchedulerGroup::start(&config, Arc::new(transport))?;

    let handle = group.submit(params)?;
    let mut out = BufWriter::new(std::fs::File::create(output)?);

    let mut written = 0u64;
    loop {
        let n = handle.send_data(&mut out, WRITE_CHUNK)?;
        if n == 0 {
            break;
        }
        written += n as u64;
    }
    out.flush()?;

    info!("wrote {} bytes to {:?}", written, output);

    if stats {
        let report = serde_json::to_string_pretty(&handle.stats())
            .map_err(|e| Error::Internal(e.to_string()))?;
        println!("{}", report);
    }

    group.report_metrics();
    group.remove(handle);
    Ok(())
}

fn cmd_config(config_path: &Path, save: bool) -> Result<()> {
    let config = Config::load_or_default(config_path)?;

    if save {
        config.save(config_path)?;
        info!("Configuration saved to {:?}", config_path);
    }

    let content =
        serde_json::to_string_pretty(&config).map_err(|e| Error::Internal(e.to_string()))?;
    println!("{}", content);
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
