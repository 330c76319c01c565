//! matrix-client: send two random matrices to a matrix-add server

use clap::Parser;
use matrix_add::client::{generate_matrix, Client};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "matrix-client")]
#[command(version = "0.1.0")]
#[command(about = "Send two random matrices to a matrix-add server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:12345")]
    connect: String,

    /// Matrix dimension
    #[arg(short = 'n', long, default_value_t = 4)]
    size: usize,

    /// Number of workers the server should use
    #[arg(short, long, default_value_t = 2)]
    workers: i64,

    /// Seconds to wait for each server reply
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Skip printing the operand and result matrices
    #[arg(long)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let a = generate_matrix(args.size);
    let b = generate_matrix(args.size);
    if !args.quiet {
        println!("Matrix A:\n{a}");
        println!("Matrix B:\n{b}");
    }

    let started = Instant::now();
    let client = Client::connect(args.connect.as_str(), Duration::from_secs(args.timeout)).await?;
    info!(server = %args.connect, size = args.size, workers = args.workers, "Connected");
    let result = client.add(&a, &b, args.workers).await?;
    let elapsed = started.elapsed();

    if !args.quiet {
        println!("Result:\n{result}");
    }
    println!("Received {n}x{n} result in {elapsed:?}", n = result.dim());
    Ok(())
}
