//! BB84 Net CLI
//!
//! Classical BB84 key exchange and XOR-encrypted messaging between LAN peers

mod config;
mod progress;

use anyhow::Context;
use bb84_core::bits;
use bb84_core::node::{ExchangeReport, Node};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};

use config::{Config, StaticPeer};
use progress::{BenchProgress, TimingStats, format_duration};

/// BB84 Net - simulated quantum key distribution for short messages
#[derive(Parser)]
#[command(name = "bb84")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Display name (overrides the configuration file)
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// TCP listen address (overrides the configuration file)
    #[arg(short, long, global = true)]
    listen: Option<String>,

    /// Known peer as name=host:port (repeatable)
    #[arg(short, long = "peer", global = true)]
    peers: Vec<String>,

    /// Disable LAN discovery
    #[arg(long, global = true)]
    no_discovery: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an interactive node
    Run,

    /// Send one message and exit
    Send {
        /// Recipient display name
        #[arg(required = true)]
        to: String,

        /// Message text
        #[arg(required = true)]
        message: String,

        /// Send unencrypted in the legacy plain format
        #[arg(long)]
        plain: bool,

        /// Seconds to wait for the recipient to be discovered
        #[arg(short, long, default_value_t = 3)]
        wait: u64,
    },

    /// List peers visible on the network
    Peers {
        /// Seconds to listen for announcements
        #[arg(short, long, default_value_t = 3)]
        wait: u64,
    },

    /// Time repeated exchanges with one peer
    Bench {
        /// Recipient display name
        #[arg(required = true)]
        to: String,

        /// Message text
        #[arg(short, long, default_value = "HI")]
        message: String,

        /// Number of exchanges
        #[arg(short, long, default_value_t = 100)]
        iterations: u64,

        /// Seconds to wait for the recipient to be discovered
        #[arg(short, long, default_value_t = 3)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    apply_overrides(&mut config, &cli);

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Run => run_node(&config).await?,
        Commands::Send {
            to,
            message,
            plain,
            wait,
        } => send_once(&config, &to, &message, plain, wait).await?,
        Commands::Peers { wait } => list_peers(&config, wait).await?,
        Commands::Bench {
            to,
            message,
            iterations,
            wait,
        } => bench(&config, &to, &message, iterations, wait).await?,
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(name) = &cli.name {
        config.node.name.clone_from(name);
    }
    if let Some(listen) = &cli.listen {
        config.network.listen_addr.clone_from(listen);
    }
    if cli.no_discovery {
        config.discovery.enabled = false;
    }
    config.peers.static_peers.extend(cli.peers.iter().cloned());
}

/// Create and start a node with static peers registered
async fn start_node(config: &Config) -> anyhow::Result<Node> {
    let node = Node::new(config.to_node_config()?)?;
    node.on_message_received(|sender, message| {
        println!("\n{} {}", style(format!("[{sender}]")).cyan().bold(), message);
    })
    .await;
    node.start().await?;

    for StaticPeer { name, addr } in config.static_peers()? {
        node.add_peer(&name, addr);
    }

    if let Some(addr) = node.local_addr().await {
        println!("Node {} listening on {}", style(node.name()).bold(), addr);
    }
    Ok(node)
}

/// Wait until `peer` is known or `wait` seconds pass
async fn wait_for_peer(node: &Node, peer: &str, wait: u64) -> anyhow::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(wait);
    while node.resolve_address(peer).is_err() {
        if Instant::now() >= deadline {
            anyhow::bail!("Peer '{}' not found", peer);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

fn print_report(peer: &str, report: &ExchangeReport) {
    let verdict = if report.delivered {
        style("delivered").green().bold()
    } else {
        style("rejected by recipient").red().bold()
    };
    println!("Message to {peer}: {verdict}");
    println!("  Raw bits:    {}", report.required_key_bits);
    println!("  Sifted key:  {} bits", report.sifted_key_len);
    println!("  Check bits:  {}", report.check_bit_count);
    println!("  Final key:   {} bits", report.final_key_len);
    println!(
        "  Key (hex):   {}",
        hex::encode(bits::bits_to_bytes(&report.final_key))
    );
    println!("  Elapsed:     {}", format_duration(report.elapsed));
}

/// Send one message
async fn send_once(
    config: &Config,
    peer: &str,
    message: &str,
    plain: bool,
    wait: u64,
) -> anyhow::Result<()> {
    let node = start_node(config).await?;
    let result = async {
        wait_for_peer(&node, peer, wait).await?;
        if plain {
            node.send_plain_message(peer, message).await?;
            println!("Plain message to {peer}: {}", style("acknowledged").green());
        } else {
            let report = node.send_message(peer, message).await?;
            print_report(peer, &report);
        }
        anyhow::Ok(())
    }
    .await;

    node.stop().await?;
    result
}

/// List peers
async fn list_peers(config: &Config, wait: u64) -> anyhow::Result<()> {
    let node = start_node(config).await?;
    if config.discovery.enabled {
        println!("Listening for announcements for {wait}s...");
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }

    let directory = node.directory();
    let peers: Vec<_> = directory
        .records()
        .into_iter()
        .filter(|record| record.name != node.name())
        .collect();

    if peers.is_empty() {
        println!("No other peers found");
    } else {
        println!("Peers:");
        for record in peers {
            println!("  {:<20} {}", record.name, record.socket_addr());
        }
    }

    node.stop().await?;
    Ok(())
}

/// Time repeated exchanges
async fn bench(
    config: &Config,
    peer: &str,
    message: &str,
    iterations: u64,
    wait: u64,
) -> anyhow::Result<()> {
    let node = start_node(config).await?;
    let result = async {
        wait_for_peer(&node, peer, wait).await?;

        let progress = BenchProgress::new(iterations, peer);
        let mut durations = Vec::new();
        let mut failures = 0u64;

        for i in 1..=iterations {
            let started = Instant::now();
            match node.send_message(peer, message).await {
                Ok(report) if report.delivered => durations.push(started.elapsed()),
                Ok(_) => failures += 1,
                Err(e) => {
                    tracing::debug!("Iteration {} failed: {}", i, e);
                    failures += 1;
                }
            }
            progress.tick(failures);
        }
        progress.finish_with_message(format!(
            "{} of {} exchanges delivered",
            durations.len(),
            iterations
        ));

        match TimingStats::from_durations(&durations) {
            Some(stats) => {
                println!("\nTransmission time statistics:");
                println!("  Mean:      {:.2} ms", stats.mean);
                println!("  Median:    {:.2} ms", stats.median);
                println!("  Std dev:   {:.2} ms", stats.std_dev);
                println!("  Min:       {:.2} ms", stats.min);
                println!("  Max:       {:.2} ms", stats.max);
                println!("  CV:        {:.2}%", stats.cv_percent);
            }
            None => println!("No successful transmissions to analyze"),
        }
        anyhow::Ok(())
    }
    .await;

    node.stop().await?;
    result
}

fn print_help() {
    println!("Commands:");
    println!("  peers                   list other peers");
    println!("  send <peer> <message>   send over a fresh BB84 key");
    println!("  plain <peer> <message>  send unencrypted");
    println!("  rates                   show observed error rates");
    println!("  exchanges               show in-flight inbound exchanges");
    println!("  help                    show this list");
    println!("  quit                    stop the node");
}

/// Run an interactive node
async fn run_node(config: &Config) -> anyhow::Result<()> {
    let node = start_node(config).await?;
    println!("BB84 Net v{}", env!("CARGO_PKG_VERSION"));
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let mut parts = line.trim().splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("" | "help"), _, _) => print_help(),
            (Some("quit" | "exit"), _, _) => break,
            (Some("peers"), _, _) => {
                let peers = node.list_other_peers();
                if peers.is_empty() {
                    println!("No other peers online");
                }
                for (i, name) in peers.iter().enumerate() {
                    println!("{}. {}", i + 1, name);
                }
            }
            (Some("send"), Some(peer), Some(message)) => {
                match node.send_message(peer, message).await {
                    Ok(report) => print_report(peer, &report),
                    Err(e) => println!("{} {}", style("Failed:").red().bold(), e),
                }
            }
            (Some("plain"), Some(peer), Some(message)) => {
                match node.send_plain_message(peer, message).await {
                    Ok(()) => println!("Plain message to {peer}: {}", style("acknowledged").green()),
                    Err(e) => println!("{} {}", style("Failed:").red().bold(), e),
                }
            }
            (Some("rates"), _, _) => {
                let rates = node.error_rates().await;
                println!("Average error rate: {:.2}%", node.average_error_rate().await * 100.0);
                if rates.is_empty() {
                    println!("No transmissions yet");
                }
                for (i, rate) in rates.iter().enumerate() {
                    println!("  Transmission {}: {:.2}%", i + 1, rate * 100.0);
                }
            }
            (Some("exchanges"), _, _) => {
                let exchanges = node.active_exchanges();
                println!(
                    "{} in flight, {} since start",
                    exchanges.len(),
                    node.total_exchanges()
                );
                for summary in exchanges {
                    println!(
                        "  {} from {} ({} raw bits) {:?}",
                        summary.exchange_id,
                        summary.peer_addr,
                        summary.required_key_bits,
                        summary.stage
                    );
                }
            }
            _ => println!("Unrecognized command, type 'help'"),
        }
    }

    println!("\nShutting down...");
    node.stop().await?;
    Ok(())
}
