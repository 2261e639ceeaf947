use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use dlml::apps::nqueens::{self, Board};
use dlml::apps::traffic::{self, FileTask, TrafficSummary};
use dlml::config::{BalanceConfig, GroupConfig, PeerConfig, DEFAULT_AUCTION_RETRIES};
use dlml::shutdown::install_shutdown_handler;
use dlml::strategy::StrategyType;
use dlml::transport::{Endpoint, MemoryNetwork};
use dlml::Dlml;

#[derive(Parser, Debug)]
#[command(name = "dlml")]
#[command(version)]
#[command(about = "Dynamically load-balanced distributed work lists")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    balance: BalanceArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct BalanceArgs {
    /// Donor selection: auction, round_robin or work_stealing.
    /// Defaults to $DLML_STRATEGY, then auction.
    #[arg(long, global = true)]
    strategy: Option<StrategyType>,

    /// Extra auctions a rank runs before declaring termination
    #[arg(long, default_value_t = DEFAULT_AUCTION_RETRIES, global = true)]
    retries: u32,

    /// Let rank 0 donate work like any other rank
    #[arg(long, global = true)]
    allow_rank_zero_donor: bool,
}

impl BalanceArgs {
    fn to_config(&self) -> BalanceConfig {
        BalanceConfig {
            strategy: self.strategy.unwrap_or_else(StrategyType::from_env),
            auction_retries: self.retries,
            ..BalanceConfig::default()
        }
        .with_rank_zero_donor(self.allow_rank_zero_donor)
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run every rank of the group in this process
    Local {
        /// Number of ranks
        #[arg(long, default_value = "4", global = true)]
        ranks: usize,

        #[command(subcommand)]
        app: App,
    },

    /// Run one rank of a TCP group
    Node(NodeArgs),
}

#[derive(clap::Args, Debug)]
struct NodeArgs {
    /// Rank of this process (0 is the root)
    #[arg(long, default_value = "0", global = true)]
    rank: usize,

    /// Port to listen on for peer links
    #[arg(long, default_value = "7400", global = true)]
    port: u16,

    /// Other ranks (comma-separated, format: "rank:host:port")
    /// Example: "1:127.0.0.1:7401,2:127.0.0.1:7402"
    #[arg(long, default_value = "", global = true)]
    peers: String,

    /// Give up if the group is not fully connected within this time
    #[arg(long, default_value = "10000", global = true)]
    connect_timeout_ms: u64,

    #[command(subcommand)]
    app: App,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum App {
    /// Count the solutions of the N-queens puzzle
    Nqueens {
        /// Board size
        #[arg(long, default_value = "8")]
        size: usize,
    },

    /// Count unique alert ids over traffic report files
    Traffic {
        /// Directory holding 1.json, 2.json, ...
        #[arg(long, default_value = "waze")]
        dir: PathBuf,

        /// Number of report files
        #[arg(long, default_value = "100")]
        files: usize,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "app", rename_all = "snake_case")]
enum Outcome {
    Nqueens { size: usize, solutions: u64 },
    Traffic(TrafficSummary),
}

#[derive(Debug, Serialize)]
struct RunReport {
    ranks: usize,
    strategy: String,
    elapsed_ms: u128,
    #[serde(flatten)]
    outcome: Outcome,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let balance = args.balance.to_config();
    let shutdown = install_shutdown_handler();
    let started = Instant::now();

    let (ranks, outcome) = tokio::select! {
        result = run(args.command, balance.clone()) => result?,
        _ = shutdown.cancelled() => return Err("interrupted".into()),
    };

    if let Some(outcome) = outcome {
        let report = RunReport {
            ranks,
            strategy: balance.strategy.to_string(),
            elapsed_ms: started.elapsed().as_millis(),
            outcome,
        };
        print_report(&report, &args.output)?;
    }
    Ok(())
}

async fn run(command: Commands, balance: BalanceConfig) -> Result<(usize, Option<Outcome>), BoxError> {
    match command {
        Commands::Local { ranks, app } => {
            if ranks == 0 {
                return Err("--ranks must be at least 1".into());
            }
            tracing::info!(ranks, strategy = %balance.strategy, "Starting in-process group");
            let mut handles = Vec::with_capacity(ranks);
            for endpoint in MemoryNetwork::endpoints(ranks) {
                let app = app.clone();
                let balance = balance.clone();
                handles.push(tokio::spawn(run_local_rank(endpoint, balance, app)));
            }
            let mut root_outcome = None;
            for handle in handles {
                if let Some(outcome) = handle.await?? {
                    root_outcome = Some(outcome);
                }
            }
            Ok((ranks, root_outcome))
        }
        Commands::Node(args) => {
            let config = node_config(&args, balance)?;
            let ranks = config.group_size();
            tracing::info!(
                rank = config.rank,
                listen_addr = %config.listen_addr,
                peers = ?config.peers.iter().map(|p| format!("{}:{}", p.rank, p.addr)).collect::<Vec<_>>(),
                "Starting DLML node"
            );
            let outcome = match args.app {
                App::Nqueens { size } => {
                    nqueens_rank(Dlml::init(&config).await?, size).await?
                }
                App::Traffic { dir, files } => {
                    traffic_rank(Dlml::init(&config).await?, dir, files).await?
                }
            };
            Ok((ranks, outcome))
        }
    }
}

async fn run_local_rank(
    endpoint: Endpoint,
    balance: BalanceConfig,
    app: App,
) -> Result<Option<Outcome>, BoxError> {
    match app {
        App::Nqueens { size } => {
            nqueens_rank(Dlml::with_endpoint(endpoint, balance)?, size).await
        }
        App::Traffic { dir, files } => {
            traffic_rank(Dlml::with_endpoint(endpoint, balance)?, dir, files).await
        }
    }
}

async fn nqueens_rank(mut dlml: Dlml<Board>, size: usize) -> Result<Option<Outcome>, BoxError> {
    let solutions = nqueens::count_solutions(&mut dlml, size).await?;
    let outcome = dlml.run_on_one(|| Outcome::Nqueens { size, solutions });
    finish(dlml, outcome).await
}

async fn traffic_rank(
    mut dlml: Dlml<FileTask>,
    dir: PathBuf,
    files: usize,
) -> Result<Option<Outcome>, BoxError> {
    let summary = traffic::run(&mut dlml, &dir, files).await?;
    finish(dlml, summary.map(Outcome::Traffic)).await
}

async fn finish<T: dlml::WorkItem>(
    dlml: Dlml<T>,
    outcome: Option<Outcome>,
) -> Result<Option<Outcome>, BoxError> {
    dlml.finalize().await?;
    Ok(outcome)
}

fn node_config(args: &NodeArgs, balance: BalanceConfig) -> Result<GroupConfig, BoxError> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = GroupConfig {
        rank: args.rank,
        listen_addr,
        peers: parse_peers(&args.peers),
        connect_timeout_ms: args.connect_timeout_ms,
        balance,
        ..GroupConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                let rank: usize = parts[0].parse().ok()?;
                let addr = format!("{}:{}", parts[1], parts[2]);
                Some(PeerConfig { rank, addr })
            } else {
                tracing::warn!(peer, "Invalid peer format, expected rank:host:port");
                None
            }
        })
        .collect()
}

fn print_report(report: &RunReport, format: &OutputFormat) -> Result<(), BoxError> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Table => {
            println!("{:<24} {}", "Ranks:", report.ranks);
            println!("{:<24} {}", "Strategy:", report.strategy);
            match &report.outcome {
                Outcome::Nqueens { size, solutions } => {
                    println!("{:<24} {}", "Board size:", size);
                    println!("{:<24} {}", "Solutions:", solutions);
                }
                Outcome::Traffic(summary) => {
                    println!("{:<24} {}", "Files processed:", summary.files_processed);
                    println!("{:<24} {}", "Unique ids (reduce):", summary.unique_ids);
                    println!("{:<24} {}", "Unique ids (gather):", summary.gathered_unique_ids);
                }
            }
            println!("{:<24} {:.3}s", "Elapsed:", report.elapsed_ms as f64 / 1000.0);
        }
    }
    Ok(())
}
