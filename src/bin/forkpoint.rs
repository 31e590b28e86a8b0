//! Forkpoint CLI - locate diverging bytes and resume transfers.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use forkpoint::{
    serve_listener, AsyncLocator, FileHashChecker, FramedClient, FsTargetFactory, HashAlgorithm,
    LocatorBuilder, MultipartHashChecker, ResumableUpload, TransferServer,
};

/// Forkpoint - find where two copies of a file diverge
#[derive(Parser)]
#[command(name = "forkpoint")]
#[command(version)]
#[command(about = "Locate the first differing byte and resume interrupted transfers")]
#[command(long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the first byte at which two local files differ
    Locate {
        /// Source file
        #[arg(required = true)]
        source: PathBuf,

        /// Target file
        #[arg(required = true)]
        target: PathBuf,

        /// Sub-segments compared per round (at least 2)
        #[arg(short, long, default_value = "5")]
        fan_out: usize,

        /// Digest algorithm (BLAKE3 or SHA256)
        #[arg(short, long, default_value = "BLAKE3")]
        algorithm: HashAlgorithm,
    },

    /// Print the hierarchical digest set of a file range
    Hashes {
        /// File to hash
        #[arg(required = true)]
        file: PathBuf,

        /// Range start
        #[arg(short, long, default_value = "0")]
        start: u64,

        /// Range length (default: to end of file)
        #[arg(short, long)]
        count: Option<u64>,

        /// Number of sub-partitions (at least 2)
        #[arg(short, long, default_value = "5")]
        parts: usize,

        /// Digest algorithm (BLAKE3 or SHA256)
        #[arg(short, long, default_value = "BLAKE3")]
        algorithm: HashAlgorithm,

        /// Hash in one streaming pass through taps instead of seeking
        #[arg(long)]
        tapped: bool,
    },

    /// Accept negotiations and uploads over TCP
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7878")]
        listen: String,

        /// Directory holding targets as <root>/<partition>/<id>
        #[arg(short, long, required = true)]
        root: PathBuf,
    },

    /// Upload a file, sending only what the server lacks
    Push {
        /// File to upload
        #[arg(required = true)]
        file: PathBuf,

        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7878")]
        server: String,

        /// Target partition
        #[arg(short, long, default_value = "default")]
        partition: String,

        /// Target id (default: the file name)
        #[arg(short, long)]
        id: Option<String>,

        /// Sub-segments compared per round (at least 2)
        #[arg(short, long, default_value = "5")]
        fan_out: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Locate {
            source,
            target,
            fan_out,
            algorithm,
        } => run_locate(&source, &target, fan_out, algorithm).await,
        Commands::Hashes {
            file,
            start,
            count,
            parts,
            algorithm,
            tapped,
        } => run_hashes(&file, start, count, parts, algorithm, tapped).await,
        Commands::Serve { listen, root } => run_serve(listen, root).await,
        Commands::Push {
            file,
            server,
            partition,
            id,
            fan_out,
        } => run_push(file, server, partition, id, fan_out).await,
    }
}

fn validate_fan_out(fan_out: usize) -> Result<(), Box<dyn std::error::Error>> {
    if fan_out < 2 {
        return Err(format!("Fan-out must be at least 2, got {fan_out}").into());
    }
    Ok(())
}

async fn run_locate(
    source: &Path,
    target: &Path,
    fan_out: usize,
    algorithm: HashAlgorithm,
) -> Result<(), Box<dyn std::error::Error>> {
    validate_fan_out(fan_out)?;
    let locator = LocatorBuilder::new()
        .fan_out(fan_out)
        .algorithm(algorithm)
        .build();

    match AsyncLocator::from_locator(locator)
        .locate_files(source, target)
        .await?
    {
        Some(offset) => println!("Diverges at offset {offset}"),
        None => println!("Identical"),
    }
    Ok(())
}

async fn run_hashes(
    file: &Path,
    start: u64,
    count: Option<u64>,
    parts: usize,
    algorithm: HashAlgorithm,
    tapped: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let length = tokio::fs::metadata(file).await?.len();
    let count = count.unwrap_or_else(|| length.saturating_sub(start));

    let digests = if tapped {
        let reader = tokio::io::BufReader::new(tokio::fs::File::open(file).await?);
        AsyncLocator::new()
            .hash_reader(reader, start, count, parts, algorithm)
            .await?
    } else {
        let checker = FileHashChecker::new(file);
        tokio::task::spawn_blocking(move || checker.hashes(start, count, parts, algorithm))
            .await??
    };

    for (index, digest) in digests.iter().enumerate() {
        let label = if index == 0 {
            "whole".to_string()
        } else {
            format!("part {}", index - 1)
        };
        println!(
            "{label:>8}  {:>12}  {:>12}  {}",
            digest.start, digest.length, digest.hash
        );
    }
    Ok(())
}

async fn run_serve(listen: String, root: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    tokio::fs::create_dir_all(&root).await?;
    let server = TransferServer::new(
        FsTargetFactory::new(root),
        |partition: &str, id: &str| -> forkpoint::Result<()> {
            println!("Completed {partition}/{id}");
            Ok(())
        },
    );
    tokio::task::spawn_blocking(move || {
        let listener = TcpListener::bind(&listen)?;
        serve_listener(&listener, &server)
    })
    .await??;
    Ok(())
}

async fn run_push(
    file: PathBuf,
    server: String,
    partition: String,
    id: Option<String>,
    fan_out: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    validate_fan_out(fan_out)?;
    let id = match id {
        Some(id) => id,
        None => file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or("Cannot derive an id from the file path; pass --id")?,
    };

    let outcome = tokio::task::spawn_blocking(move || {
        let client = FramedClient::connect(&server)?;
        let locator = LocatorBuilder::new().fan_out(fan_out).build();
        ResumableUpload::new(client, partition)
            .with_locator(locator)
            .push_file(&file, &id)
    })
    .await??;

    match outcome.resumed_from {
        Some(offset) => println!(
            "Uploaded {} bytes from offset {offset}{}",
            outcome.uploaded,
            if outcome.complete { "" } else { " (target still differs)" }
        ),
        None if outcome.complete => println!("Target already up to date"),
        None => println!("Target left unchanged"),
    }
    Ok(())
}
