//! filekv - A Flat-File Key-Value Store
//!
//! This is the simulation harness for filekv. It fires a burst of random
//! `get` / `set` operations at a fresh store, waits for all of them and
//! prints the metrics summary.

use filekv::{Store, StoreConfig};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Base of the values written by the simulation
const BASE_VALUE: i64 = 99993;

/// Harness configuration
struct Config {
    /// Data file to use
    file: PathBuf,
    /// Maximum storage operations in flight
    concurrency: Option<usize>,
    /// Number of random operations to run
    iterations: usize,
    /// Give every `set` a random ttl
    expiry: bool,
    /// Run storage calls on the blocking pool
    isolated: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file: PathBuf::from(filekv::DEFAULT_DATA_FILE),
            concurrency: None,
            iterations: 100,
            expiry: false,
            isolated: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--file" | "-f" => {
                    config.file = PathBuf::from(value_for(&args, i, "--file"));
                    i += 2;
                }
                "--concurrency" | "-c" => {
                    config.concurrency = Some(parse_number(&args, i, "--concurrency"));
                    i += 2;
                }
                "--iterations" | "-n" => {
                    config.iterations = parse_number(&args, i, "--iterations");
                    i += 2;
                }
                "--expiry" | "-e" => {
                    config.expiry = true;
                    i += 1;
                }
                "--isolated" => {
                    config.isolated = true;
                    i += 1;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("filekv version {}", filekv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn store_config(&self) -> StoreConfig {
        let mut store_config = StoreConfig::new(&self.file).with_execute_inline(!self.isolated);
        if let Some(concurrency) = self.concurrency {
            store_config = store_config.with_concurrency(concurrency);
        }
        store_config
    }
}

fn value_for<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn parse_number(args: &[String], i: usize, flag: &str) -> usize {
    value_for(args, i, flag).parse().unwrap_or_else(|_| {
        eprintln!("Error: {} expects a positive number", flag);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
filekv - A Flat-File Key-Value Store

USAGE:
    filekv [OPTIONS]

OPTIONS:
    -f, --file <PATH>          Data file (default: db.txt)
    -c, --concurrency <N>      Storage operations in flight (default: CPU count)
    -n, --iterations <N>       Random operations to run (default: 100)
    -e, --expiry               Give each set a random ttl of 10-100ms
        --isolated             Run file operations on the blocking pool
    -v, --version              Print version information
    -h, --help                 Print this help message

EXAMPLES:
    filekv                           # 100 operations against ./db.txt
    filekv -n 10000 -c 4 --expiry    # Larger run with key expiry

LOGGING:
    Set RUST_LOG to change verbosity, e.g. RUST_LOG=filekv=debug
"#
    );
}

/// One step of the simulated workload.
enum Operation {
    Get(String),
    Set(String, i64, Option<Duration>),
}

/// Builds the random workload up front; `ThreadRng` stays on this thread.
fn plan(iterations: usize, expiry: bool) -> Vec<Operation> {
    let mut rng = rand::thread_rng();
    (0..iterations)
        .map(|i| {
            let key = char::from(rng.gen_range(b'a'..=b'z')).to_string();
            if rng.gen_bool(0.5) {
                let ttl = expiry.then(|| Duration::from_millis(rng.gen_range(10..=100)));
                Operation::Set(key, BASE_VALUE + i as i64, ttl)
            } else {
                Operation::Get(key)
            }
        })
        .collect()
}

async fn run(store: Arc<Store>, operations: Vec<Operation>) -> (usize, usize) {
    let mut tasks = JoinSet::new();
    for operation in operations {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            match operation {
                Operation::Get(key) => store.get(&key).await.map(|v| v.is_some()),
                Operation::Set(key, value, ttl) => store.set_with_ttl(&key, value, ttl).await,
            }
        });
    }

    let (mut hits, mut failures) = (0, 0);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(true)) => hits += 1,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Operation rejected");
                failures += 1;
            }
            Err(e) => {
                warn!(error = %e, "Operation task failed");
                failures += 1;
            }
        }
    }
    store.idle().await;
    (hits, failures)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let store = Arc::new(Store::new(config.store_config())?);
    store.init().await?;

    info!(
        iterations = config.iterations,
        expiry = config.expiry,
        isolated = config.isolated,
        "Starting simulation"
    );

    let operations = plan(config.iterations, config.expiry);
    let started = Instant::now();

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping simulation...");
    };

    tokio::select! {
        (hits, failures) = run(Arc::clone(&store), operations) => {
            info!(
                hits = hits,
                failures = failures,
                elapsed_ms = started.elapsed().as_millis(),
                "Simulation complete"
            );
        }
        _ = shutdown => {}
    }

    store.shutdown();

    let records = store.snapshot().await?;
    println!("\nMetrics\n───────\n{}", store.metrics().summary());
    println!("Scheduler: {:?}", store.scheduler().stats());
    println!("Storage:   {:?}", store.storage_stats());
    println!("Live records in {}: {}", config.file.display(), records.len());

    Ok(())
}
