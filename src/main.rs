use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tinysubnets::{Broker, BrokerClient, Config, Leases, Result};

#[derive(Parser)]
#[command(name = "tinysubnets")]
#[command(author, version, about = "Point-to-point /30 lease broker", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListLeases,
    /// Ask the running broker for a lease
    Request {
        #[arg(long, conflicts_with = "identifier", required_unless_present = "identifier")]
        mac: Option<String>,
        #[arg(long)]
        identifier: Option<String>,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        iface: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting lease broker with config: {:?}", cli.config);
            info!(
                "Address pool: {} - {} ({} blocks)",
                config.pool_start,
                config.pool_end,
                config.block_count()
            );
            let leases = Arc::new(Leases::new(Arc::new(config)).await?);
            let broker = Broker::new(leases);

            broker
                .run_until(async {
                    if let Err(error) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for shutdown signal: {}", error);
                        std::future::pending::<()>().await;
                    }
                    info!("Received shutdown signal, stopping broker...");
                })
                .await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let leases = Leases::new(Arc::new(config)).await?;
            let records = leases.list_leases().await;

            if records.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<24} {:<16} {:<16} {:<24} {:<10}",
                    "Client", "IP Address", "Router", "Expires At", "Remaining"
                );
                println!("{}", "-".repeat(92));

                for lease in records {
                    let remaining = lease.remaining_seconds();
                    let remaining_str = if remaining > 0 {
                        format!("{}s", remaining)
                    } else {
                        "expired".to_string()
                    };

                    println!(
                        "{:<24} {:<16} {:<16} {:<24} {:<10}",
                        lease.client_key,
                        lease.host_address,
                        lease.router_address(),
                        lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        remaining_str
                    );
                }
            }

            Ok(())
        }
        Commands::Request {
            mac,
            identifier,
            name,
            iface,
        } => {
            let client = BrokerClient::new(&config.socket_path);
            let request = tinysubnets::LeaseRequest {
                mac: mac.unwrap_or_default(),
                identifier: identifier.unwrap_or_default(),
                name,
                iface,
            };
            let grant = client.send_lease_request(&request).await?;
            let response = tinysubnets::LeaseResponse::from(grant);
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
    }
}
