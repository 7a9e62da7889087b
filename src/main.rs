use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use nova_balancer::{
    Balancer, BalancerConfig, GuestId, GuestStats, HostId, TaskState,
    config::DEFAULT_CONFIG_FILE,
    log_info, log_warn, logger,
    virsh::VirshConnector,
};
use std::path::PathBuf;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "nova-balancer")]
#[command(about = "Load-aware live migration scheduler for libvirt hypervisor fleets")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the balancer configuration
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,
    /// Sample every host once and print the fleet
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Live-migrate one guest and wait for the result
    Migrate {
        /// Guest (domain) name
        guest: String,
        /// Destination host; picked automatically when omitted
        #[arg(long)]
        to: Option<String>,
    },
    /// Validate the configuration and print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "nova_balancer=debug");
        }
    }
    logger::init_logger();

    let config = BalancerConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Status { json } => status(config, json).await,
        Commands::Migrate { guest, to } => migrate(config, guest, to).await,
        Commands::CheckConfig => check_config(&config),
    }
}

async fn run(config: BalancerConfig) -> anyhow::Result<()> {
    if !VirshConnector::check_virsh_available() {
        log_warn!("virsh not found in PATH; every host will show as unreachable");
    }

    let balancer = Balancer::from_config(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_info!("Interrupt received, draining migrations");
            let _ = shutdown_tx.send(true);
        }
    });

    balancer.run(shutdown_rx).await;
    Ok(())
}

async fn status(config: BalancerConfig, json: bool) -> anyhow::Result<()> {
    let balancer = Balancer::from_config(config);
    let ranking = balancer.config().selector.ranking;
    let report = balancer.refresh().await;
    let snapshot = balancer.fleet_snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:<8} {:<8} {:<8}",
        "HOST", "STATE", "CPU%", "MEM%", "GUESTS"
    );
    println!("{}", "=".repeat(60));
    for (host, entry) in &snapshot.hosts {
        let state = if entry.reachable { "up" } else { "unreachable" };
        let (cpu, mem) = entry
            .load
            .as_ref()
            .map(|load| (format!("{:.1}", load.cpu_percent), format!("{:.1}", load.mem_percent)))
            .unwrap_or(("-".to_string(), "-".to_string()));
        println!(
            "{:<20} {:<12} {:<8} {:<8} {:<8}",
            host.as_str(),
            state,
            cpu,
            mem,
            entry.guests.len()
        );
    }

    let mut guests: Vec<&GuestStats> = snapshot
        .hosts
        .values()
        .flat_map(|entry| entry.guests.values())
        .collect();
    guests.sort_by(|a, b| ranking.compare(a, b));

    if !guests.is_empty() {
        println!();
        println!(
            "{:<24} {:<20} {:<10} {:<14} {:<12}",
            "GUEST", "HOST", "VCPUS", "CPU TIME", "MEMORY"
        );
        println!("{}", "=".repeat(84));
        for guest in guests {
            println!(
                "{:<24} {:<20} {:<10} {:<14} {:<12}",
                guest.guest_id.as_str(),
                guest.host_id.as_str(),
                guest.vcpus,
                format!("{:.1}s", guest.cpu_time_ns as f64 / 1e9),
                format!("{}MB", guest.used_memory_bytes / (1024 * 1024))
            );
        }
    }

    if !report.unreachable.is_empty() {
        println!();
        println!("{} host(s) could not be sampled", report.unreachable.len());
    }
    Ok(())
}

async fn migrate(config: BalancerConfig, guest: String, to: Option<String>) -> anyhow::Result<()> {
    let balancer = Balancer::from_config(config);
    balancer.refresh().await;

    let guest = GuestId::from(guest);
    let destination = to.map(HostId::from);
    let task = balancer
        .force_migrate_and_wait(&guest, destination.as_ref())
        .await?;

    match task.state {
        TaskState::Succeeded => {
            println!(
                "Guest '{}' migrated from {} to {}",
                task.guest_id, task.source_host, task.dest_host
            );
            Ok(())
        }
        _ => bail!(
            "Migration of '{}' to {} failed: {}",
            task.guest_id,
            task.dest_host,
            task.last_error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

fn check_config(config: &BalancerConfig) -> anyhow::Result<()> {
    config.validate()?;

    println!("Fleet: {}", config.fleet.as_deref().unwrap_or("(unnamed)"));
    println!(
        "Thresholds: cpu > {}%, mem > {}% over {} samples",
        config.thresholds.cpu_percent, config.thresholds.mem_percent, config.detector.window
    );
    println!(
        "Selector: {:?} ranking, {}% safety margin",
        config.selector.ranking, config.selector.margin_percent
    );
    println!(
        "Coordinator: {} concurrent migration(s), {}s failure cooldown",
        config.coordinator.max_concurrent, config.coordinator.failure_cooldown_seconds
    );
    println!();
    println!("{:<20} {:<40} {:<8}", "HOST", "URI", "LOCAL");
    println!("{}", "=".repeat(70));
    for host in &config.hosts {
        println!(
            "{:<20} {:<40} {:<8}",
            host.id.as_str(),
            host.uri,
            if host.local { "yes" } else { "no" }
        );
    }
    Ok(())
}
