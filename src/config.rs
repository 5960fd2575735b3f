use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_COMMAND_TOPIC: &str = "/lutron/command";
pub const DEFAULT_FEEDBACK_TOPIC: &str = "/lutron/feedback";
pub const DEFAULT_LOG_FILE: &str = "./lutron.log";

/// LEAP control port on Caseta / RA2 Select bridges.
pub const LEAP_PORT: u16 = 8081;
/// Port the bridge listens on for the certificate exchange.
pub const PAIRING_PORT: u16 = 8083;

/// Bridge-side arguments, shared by `lutron-mqtt` and `lutron-pair`.
#[derive(Args, Debug, Clone)]
pub struct BridgeArgs {
    /// Bridge ip address
    #[arg(env = "LUTRON_BRIDGE_IP")]
    pub bridgeip: String,

    /// Directory holding the paired certificate bundle
    #[arg(long, env = "LUTRON_CREDENTIALS_DIR", value_name = "DIR")]
    pub credentials: Option<PathBuf>,

    /// Lutron pairing (LAP) client certificate, used only during pairing
    #[arg(long, env = "LUTRON_LAP_CERT", value_name = "FILE")]
    pub lap_cert: Option<PathBuf>,

    /// Lutron pairing (LAP) client key, used only during pairing
    #[arg(long, env = "LUTRON_LAP_KEY", value_name = "FILE")]
    pub lap_key: Option<PathBuf>,

    /// Seconds to wait for the bridge button press while pairing
    #[arg(long, env = "LUTRON_PAIR_TIMEOUT", default_value_t = 180)]
    pub pair_timeout: u64,

    /// path/name of log file
    #[arg(short = 'l', long, env = "LUTRON_LOG_FILE", default_value = DEFAULT_LOG_FILE)]
    pub log: PathBuf,

    /// debug mode
    #[arg(short = 'D', long, env = "LUTRON_DEBUG")]
    pub debug: bool,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "lutron-mqtt")]
#[command(version, about = "Forward MQTT data to Lutron API")]
pub struct Cli {
    #[command(flatten)]
    pub bridge: BridgeArgs,

    /// MQTT Topic to send commands to, (can use # and +)
    #[arg(short = 't', long, env = "MQTT_COMMAND_TOPIC", default_value = DEFAULT_COMMAND_TOPIC)]
    pub topic: String,

    /// Topic on broker to publish feedback to
    #[arg(short = 'T', long, env = "MQTT_FEEDBACK_TOPIC", default_value = DEFAULT_FEEDBACK_TOPIC)]
    pub feedback: String,

    /// ipaddress of MQTT broker
    #[arg(short = 'b', long, env = "MQTT_BROKER_HOST")]
    pub broker: String,

    /// MQTT broker port number
    #[arg(short = 'p', long, env = "MQTT_BROKER_PORT", default_value_t = 1883)]
    pub port: u16,

    /// MQTT broker user name
    #[arg(short = 'U', long, env = "MQTT_USERNAME")]
    pub user: Option<String>,

    /// MQTT broker password
    #[arg(short = 'P', long, env = "MQTT_PASSWORD")]
    pub passwd: Option<String>,

    /// publish topics as json (vs individual topics)
    #[arg(short = 'J', long = "json_out", env = "LUTRON_JSON_OUT")]
    pub json_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub mqtt: MqttConfig,
    pub feedback: FeedbackConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub address: String,
    pub leap_port: u16,
    pub pairing_port: u16,
    pub credentials_dir: PathBuf,
    pub lap_cert: PathBuf,
    pub lap_key: PathBuf,
    pub pair_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub command_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    pub root: String,
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub path: PathBuf,
    pub debug: bool,
}

/// Default location of paired credentials: `<data dir>/lutron-mqtt`.
pub fn default_credentials_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lutron-mqtt")
}

impl BridgeConfig {
    pub fn pair_timeout(&self) -> Duration {
        Duration::from_secs(self.pair_timeout_secs)
    }
}

impl From<&BridgeArgs> for BridgeConfig {
    fn from(args: &BridgeArgs) -> Self {
        let credentials_dir = args
            .credentials
            .clone()
            .unwrap_or_else(default_credentials_dir);
        Self {
            address: args.bridgeip.clone(),
            leap_port: LEAP_PORT,
            pairing_port: PAIRING_PORT,
            lap_cert: args
                .lap_cert
                .clone()
                .unwrap_or_else(|| credentials_dir.join("lap.crt")),
            lap_key: args
                .lap_key
                .clone()
                .unwrap_or_else(|| credentials_dir.join("lap.key")),
            credentials_dir,
            pair_timeout_secs: args.pair_timeout,
        }
    }
}

impl From<&BridgeArgs> for LogConfig {
    fn from(args: &BridgeArgs) -> Self {
        Self {
            path: args.log.clone(),
            debug: args.debug,
        }
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let bridge = BridgeConfig::from(&cli.bridge);
        let logging = LogConfig::from(&cli.bridge);
        Self {
            mqtt: MqttConfig {
                broker_host: cli.broker,
                broker_port: cli.port,
                client_id: format!("lutron-mqtt-{}", bridge.address),
                username: cli.user,
                password: cli.passwd,
                command_topic: cli.topic,
            },
            feedback: FeedbackConfig {
                root: cli.feedback,
                json: cli.json_out,
            },
            bridge,
            logging,
        }
    }
}
