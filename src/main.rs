//! BlockVerity CLI
//!
//! ```text
//! blockverity format  data.img --hash hash.img [--fec fec.img --fec-roots 2]
//! blockverity verify  --config verity.yaml
//! blockverity read    --table "<table line>" --block 5 --count 1 -o out.bin
//! blockverity status  --config verity.yaml
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures::stream::{self, StreamExt};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockverity::adapters::{AbortRestart, LoggingNotifier};
use blockverity::builder::{format_image, FormatOptions};
use blockverity::cache::BufferedCacheConfig;
use blockverity::config::VerityConfig;
use blockverity::pipeline::{TargetOptions, VerityTarget};
use blockverity::policy::VerityMode;

// =============================================================================
// CLI Arguments
// =============================================================================

/// BlockVerity - transparent block integrity verification
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the hash tree (and FEC parity) for a data image
    Format(FormatArgs),
    /// Read every block of a device through the verifier
    Verify(VerifyArgs),
    /// Read a range of verified blocks
    Read(ReadArgs),
    /// Print the table line of a device
    Status(SourceArgs),
}

#[derive(ClapArgs, Debug)]
struct FormatArgs {
    /// Data image to protect
    data: PathBuf,

    /// Output path of the hash image
    #[arg(long)]
    hash: PathBuf,

    /// Output path of the FEC parity image
    #[arg(long, requires = "fec_roots")]
    fec: Option<PathBuf>,

    /// Parity bytes per codeword
    #[arg(long, requires = "fec")]
    fec_roots: Option<u8>,

    /// Hash tree format version (0 or 1)
    #[arg(long, default_value = "1")]
    format_version: u8,

    #[arg(long, default_value = "4096")]
    data_block_size: u32,

    #[arg(long, default_value = "4096")]
    hash_block_size: u32,

    #[arg(long, default_value = "sha256")]
    algorithm: String,

    /// Salt as hex, or "-" for none
    #[arg(long, default_value = "-")]
    salt: String,

    /// Blocks reserved at the front of the hash image
    #[arg(long, default_value = "0")]
    hash_start: u64,

    /// Write the resulting configuration as YAML
    #[arg(long)]
    config_out: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct SourceArgs {
    /// YAML or JSON configuration file
    #[arg(long, env = "VERITY_CONFIG", conflicts_with = "table")]
    config: Option<PathBuf>,

    /// Table line
    #[arg(long)]
    table: Option<String>,

    /// Override the corruption mode
    #[arg(long, value_parser = parse_mode)]
    mode: Option<VerityMode>,
}

#[derive(ClapArgs, Debug)]
struct VerifyArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Blocks per request
    #[arg(long, default_value = "32")]
    chunk_blocks: u64,

    /// Requests kept in flight
    #[arg(long, default_value = "8")]
    jobs: usize,

    /// Hash cache capacity in blocks
    #[arg(long, default_value = "8192")]
    cache_blocks: usize,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    metrics: bool,
}

#[derive(ClapArgs, Debug)]
struct ReadArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// First data block
    #[arg(long, default_value = "0")]
    block: u64,

    /// Number of blocks
    #[arg(long, default_value = "1")]
    count: u64,

    /// Output file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_mode(value: &str) -> std::result::Result<VerityMode, String> {
    match value {
        "fail_io" | "eio" => Ok(VerityMode::FailIo),
        "log_only" | "ignore_corruption" => Ok(VerityMode::LogOnly),
        "restart" | "restart_on_corruption" => Ok(VerityMode::Restart),
        other => Err(format!("unknown mode '{}'", other)),
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(&args);

    let result = match args.command {
        Command::Format(cmd) => run_format(cmd),
        Command::Verify(cmd) => run_verify(cmd).await,
        Command::Read(cmd) => run_read(cmd).await,
        Command::Status(cmd) => run_status(cmd),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Commands
// =============================================================================

fn run_format(cmd: FormatArgs) -> anyhow::Result<ExitCode> {
    let data = std::fs::read(&cmd.data)
        .with_context(|| format!("reading {}", cmd.data.display()))?;

    let salt = if cmd.salt == "-" {
        Vec::new()
    } else {
        hex::decode(&cmd.salt).context("salt is not valid hex")?
    };

    let options = FormatOptions {
        version: cmd.format_version,
        data_block_size: cmd.data_block_size,
        hash_block_size: cmd.hash_block_size,
        algorithm: cmd.algorithm,
        salt,
        hash_start: cmd.hash_start,
        fec_roots: cmd.fec_roots,
    };
    let image = format_image(&data, &options)?;

    std::fs::write(&cmd.hash, &image.hash_image)
        .with_context(|| format!("writing {}", cmd.hash.display()))?;

    let data_path = cmd.data.display().to_string();
    let hash_path = cmd.hash.display().to_string();
    let config = match (&cmd.fec, &image.fec_image) {
        (Some(path), Some(parity)) => {
            std::fs::write(path, parity)
                .with_context(|| format!("writing {}", path.display()))?;
            image.full_config(&data_path, &hash_path, &path.display().to_string())
        }
        _ => image.config(&data_path, &hash_path),
    };

    if let Some(path) = &cmd.config_out {
        let yaml = serde_yaml::to_string(&config)?;
        std::fs::write(path, yaml).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "Wrote configuration");
    }

    println!("Root digest: {}", hex::encode(&image.root_digest));
    println!("Table: {}", config.to_table_line());
    Ok(ExitCode::SUCCESS)
}

async fn run_verify(cmd: VerifyArgs) -> anyhow::Result<ExitCode> {
    let config = load_config(&cmd.source)?;
    let options = TargetOptions {
        notifier: Arc::new(LoggingNotifier::new()),
        restart: Arc::new(AbortRestart),
        cache: BufferedCacheConfig {
            capacity_blocks: cmd.cache_blocks,
        },
    };
    let target = VerityTarget::open(&config, options)?;

    let data_blocks = target.device().data_blocks();
    let chunk = cmd.chunk_blocks.max(1);
    let starts: Vec<u64> = (0..data_blocks).step_by(chunk as usize).collect();

    let target_ref = &target;
    let failures: Vec<(u64, blockverity::Error)> = stream::iter(starts)
        .map(|start| async move {
            let count = chunk.min(data_blocks - start);
            (start, target_ref.read_blocks(start, count).await)
        })
        .buffer_unordered(cmd.jobs.max(1))
        .filter_map(|(start, result)| async move { result.err().map(|e| (start, e)) })
        .collect()
        .await;

    target.shutdown().await;

    for (start, e) in &failures {
        warn!(start, error = %e, "Read failed");
    }

    let report = target.status_report();
    println!("{}", serde_json::to_string_pretty(&report)?);
    if cmd.metrics {
        print!("{}", target.metrics().encode()?);
    }

    if failures.is_empty() && report.status == 'V' {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn run_read(cmd: ReadArgs) -> anyhow::Result<ExitCode> {
    let config = load_config(&cmd.source)?;
    let target = VerityTarget::open(&config, TargetOptions::default())?;

    let result = target.read_blocks(cmd.block, cmd.count).await;
    target.shutdown().await;
    let data = result?;

    match &cmd.output {
        Some(path) => {
            std::fs::write(path, &data).with_context(|| format!("writing {}", path.display()))?
        }
        None => std::io::stdout().lock().write_all(&data)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn run_status(cmd: SourceArgs) -> anyhow::Result<ExitCode> {
    let config = load_config(&cmd)?;
    println!("{}", config.to_table_line());
    Ok(ExitCode::SUCCESS)
}

fn load_config(source: &SourceArgs) -> anyhow::Result<VerityConfig> {
    let mut config = match (&source.config, &source.table) {
        (Some(path), _) => VerityConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        (None, Some(line)) => VerityConfig::from_table_line(line)?,
        (None, None) => bail!("either --config or --table is required"),
    };

    if let Some(mode) = source.mode {
        config.mode = mode;
    }
    Ok(config)
}
