use clap::Parser;
use log::{error, info, warn};
use lutron_mqtt::bridge::Bridge;
use lutron_mqtt::config::{Cli, Config};
use lutron_mqtt::credentials::CredentialStore;
use lutron_mqtt::error::{BridgeError, Result};
use lutron_mqtt::events;
use lutron_mqtt::feedback::{self, FeedbackPublisher};
use lutron_mqtt::instance_lock::InstanceLock;
use lutron_mqtt::leap::LeapConnector;
use lutron_mqtt::logging;
use lutron_mqtt::mqtt::MqttClient;
use lutron_mqtt::pairing::{LapPairing, PairingManager};
use lutron_mqtt::registry::Registry;
use lutron_mqtt::router::TopicRouter;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// How long startup waits for the first broker ConnAck.
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from(Cli::parse());
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    info!("Starting lutron-mqtt {}", env!("CARGO_PKG_VERSION"));
    info!("  Bridge: {}", config.bridge.address);
    info!(
        "  Broker: {}:{}",
        config.mqtt.broker_host, config.mqtt.broker_port
    );
    info!("  Command topic: {}", config.mqtt.command_topic);
    info!(
        "  Feedback topic: {} ({})",
        config.feedback.root,
        if config.feedback.json { "json" } else { "individual" }
    );

    match run(config).await {
        Ok(()) => {
            info!("lutron-mqtt stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let _lock = InstanceLock::acquire(&config.bridge.address)?;

    let (leap_tx, leap_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let bridge_config = &config.bridge;
    let pairing = PairingManager::new(
        LeapConnector::new(&bridge_config.address, bridge_config.leap_port, leap_tx),
        LapPairing::new(
            &bridge_config.address,
            bridge_config.pairing_port,
            bridge_config.lap_cert.clone(),
            bridge_config.lap_key.clone(),
        ),
        CredentialStore::for_bridge(&bridge_config.credentials_dir, &bridge_config.address),
        bridge_config.pair_timeout(),
    );
    let session = Arc::new(pairing.ensure_session().await?);

    let mut registry = Registry::load(session.as_ref())
        .await
        .map_err(BridgeError::RegistryLoad)?;
    let responses = events::subscribe(session.as_ref(), &registry)
        .await
        .map_err(BridgeError::EventSubscription)?;
    events::prime(&mut registry, &responses);

    let router = TopicRouter::new(&config.mqtt.command_topic);
    let backlog = feedback::snapshot_size(&registry, config.feedback.json);
    let mqtt = MqttClient::new(&config.mqtt, router.subscription(), backlog);
    let publisher = mqtt.client();
    let (mqtt_tx, mqtt_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (connected_tx, connected_rx) = oneshot::channel();
    let mqtt_task = tokio::spawn(mqtt.run(mqtt_tx, Some(connected_tx)));

    let broker = format!("{}:{}", config.mqtt.broker_host, config.mqtt.broker_port);
    if !matches!(
        tokio::time::timeout(BROKER_CONNECT_TIMEOUT, connected_rx).await,
        Ok(Ok(()))
    ) {
        mqtt_task.abort();
        session.close().await;
        return Err(BridgeError::BrokerUnreachable(broker));
    }

    let bridge = Bridge::new(
        registry,
        Arc::clone(&session),
        router,
        FeedbackPublisher::new(publisher.clone(), &config.feedback),
    );
    bridge.publish_snapshot();

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Received shutdown signal");
        shutdown.cancel();
    });

    info!("lutron-mqtt is running");
    info!("  - Press Ctrl+C to exit");
    bridge.run(mqtt_rx, leap_rx, cancel).await;

    session.close().await;
    if let Err(e) = publisher.try_disconnect() {
        warn!("MQTT disconnect failed: {}", e);
    }
    if tokio::time::timeout(MQTT_SHUTDOWN_TIMEOUT, mqtt_task)
        .await
        .is_err()
    {
        warn!("MQTT event loop did not stop in time");
    }
    Ok(())
}

/// Ctrl-C or SIGTERM.
async fn wait_for_shutdown() {
    let terminate = async {
        match signal::unix::signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        }
        _ = terminate => {}
    }
}
