//! Pairing and inventory tool for a Caseta bridge.
//!
//! Pairs with the bridge (or reuses stored credentials) without starting the
//! MQTT side, and lists what the bridge knows, which is handy for finding
//! the names to use in command topics.
//!
//! Usage:
//!   lutron-pair <bridge ip> pair [--force]
//!   lutron-pair <bridge ip> inventory
//!   lutron-pair <bridge ip> forget

use clap::{Parser, Subcommand};
use lutron_mqtt::config::{BridgeArgs, BridgeConfig, LogConfig};
use lutron_mqtt::credentials::CredentialStore;
use lutron_mqtt::leap::{LeapClient, LeapConnector};
use lutron_mqtt::logging;
use lutron_mqtt::pairing::{LapPairing, PairingError, PairingManager};
use lutron_mqtt::registry::Registry;
use std::io;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "lutron-pair")]
#[command(version, about = "Pair with a Lutron bridge and list its devices")]
struct Cli {
    #[command(flatten)]
    bridge: BridgeArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair with the bridge unless stored credentials still work
    Pair {
        /// Discard stored credentials and pair again
        #[arg(long)]
        force: bool,
    },
    /// List areas, devices, buttons and scenes
    Inventory,
    /// Delete the stored credentials
    Forget,
}

async fn open_session(
    config: &BridgeConfig,
    store: CredentialStore,
) -> Result<LeapClient, PairingError> {
    // Push events are not needed here
    let (events, _) = mpsc::channel(1);
    PairingManager::new(
        LeapConnector::new(&config.address, config.leap_port, events),
        LapPairing::new(
            &config.address,
            config.pairing_port,
            config.lap_cert.clone(),
            config.lap_key.clone(),
        ),
        store,
        config.pair_timeout(),
    )
    .ensure_session()
    .await
}

fn forget(store: &CredentialStore) -> io::Result<()> {
    match std::fs::remove_file(store.path()) {
        Ok(()) => {
            println!("Removed {}", store.path().display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            println!("No credentials at {}", store.path().display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn print_inventory(registry: &Registry) {
    for device in registry.devices() {
        let area = registry.area_name(device).unwrap_or("-");
        println!(
            "device {:>4}  {:<20} {:<24} {} ({})",
            device.id,
            area,
            device.name,
            device.kind,
            device.device_type
        );
        for button in device.buttons.iter().filter_map(|id| registry.button(*id)) {
            println!(
                "  button {:>4}  #{} {}",
                button.id, button.number, button.name
            );
        }
        if !device.state.is_empty() {
            let state: Vec<String> = device
                .state
                .iter()
                .map(|(attribute, value)| format!("{attribute}={value}"))
                .collect();
            println!("  state  {}", state.join(" "));
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(&LogConfig::from(&cli.bridge))?;

    let config = BridgeConfig::from(&cli.bridge);
    let store = CredentialStore::for_bridge(&config.credentials_dir, &config.address);

    match cli.command {
        Commands::Forget => forget(&store)?,
        Commands::Pair { force } => {
            if force {
                forget(&store)?;
            }
            println!("Connecting to bridge at {}...", config.address);
            let session = open_session(&config, store.clone()).await?;
            println!("Paired. Credentials in {}", store.path().display());
            session.close().await;
        }
        Commands::Inventory => {
            let session = open_session(&config, store).await?;
            let registry = Registry::load(&session).await?;
            print_inventory(&registry);
            session.close().await;
        }
    }
    Ok(())
}
