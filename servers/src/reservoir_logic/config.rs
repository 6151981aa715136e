use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use lib_reservoir::configs::{BrokerConfig, Credentials, ProtocolVersion, ReconnectPolicy};
use lib_reservoir::core::message::{DEFAULT_DATE_FIELD, DEFAULT_VALUE_FIELD};
use lib_reservoir::core::topic_router::DEFAULT_CHANNEL_SUFFIX;
use lib_reservoir::ingestors::csv_records::DEFAULT_FILE_PATTERN;

const DEFAULT_CONFIG_FILE: &str = "server_reservoir.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Reservoir allocation pub/sub server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RESERVOIR_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RESERVOIR_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RESERVOIR_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RESERVOIR_BROKER", help = "Broker backend: redis or memory.")]
    pub broker: Option<String>,

    #[clap(long, env = "RESERVOIR_BROKER_HOST", help = "Broker host name or address.")]
    pub broker_host: Option<String>,

    #[clap(long, env = "RESERVOIR_BROKER_PORT", help = "Broker port.")]
    pub broker_port: Option<u16>,

    #[clap(long, env = "RESERVOIR_BROKER_USERNAME", help = "Broker username, if the broker requires one.")]
    pub broker_username: Option<String>,

    #[clap(long, env = "RESERVOIR_BROKER_PASSWORD", help = "Broker password. Enables authentication when set.")]
    pub broker_password: Option<String>,

    #[clap(long, env = "RESERVOIR_PROTOCOL_VERSION", help = "Broker protocol version: resp2 or resp3.")]
    pub protocol_version: Option<String>,

    #[clap(long, env = "RESERVOIR_CONNECT_TIMEOUT_MS", help = "Milliseconds to wait for the broker handshake.")]
    pub connect_timeout_ms: Option<u64>,

    #[clap(long, env = "RESERVOIR_RECONNECT", help = "Reconnect policy after a lost connection: manual or auto.")]
    pub reconnect: Option<String>,

    #[clap(long, env = "RESERVOIR_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for automatic reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "RESERVOIR_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for automatic reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "RESERVOIR_RECONNECT_MAX_ATTEMPTS", help = "Give up reconnecting after this many attempts. Unlimited when unset.")]
    pub reconnect_max_attempts: Option<u32>,

    #[clap(long, env = "RESERVOIR_SOURCES", value_delimiter = ',', help = "Comma separated reservoir names.")]
    pub sources: Option<Vec<String>>,

    #[clap(long, env = "RESERVOIR_CHANNEL_SUFFIX", help = "Suffix appended to each upper-cased source to form its channel.")]
    pub channel_suffix: Option<String>,

    #[clap(long, env = "RESERVOIR_DATA_DIR", help = "Directory holding the per-reservoir CSV files.")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, env = "RESERVOIR_FILE_PATTERN", help = "CSV file name pattern; {Source} and {source} are substituted.")]
    pub file_pattern: Option<String>,

    #[clap(long, env = "RESERVOIR_DATE_COLUMN", help = "Name of the date column and wire field.")]
    pub date_column: Option<String>,

    #[clap(long, env = "RESERVOIR_VALUE_COLUMN", help = "Name of the measurement column and wire field.")]
    pub value_column: Option<String>,

    #[clap(long, env = "RESERVOIR_PACING_MS", help = "Milliseconds between two publishes of the same source.")]
    pub pacing_ms: Option<u64>,

    #[clap(long, env = "RESERVOIR_LINGER_SECONDS", help = "Seconds to keep receiving after publishing completes.")]
    pub linger_seconds: Option<u64>,

    #[clap(long, env = "RESERVOIR_EXPORT_PATH", help = "Write the final daily summaries to this JSON file on shutdown.")]
    pub export_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            broker: other.broker.or(self.broker),
            broker_host: other.broker_host.or(self.broker_host),
            broker_port: other.broker_port.or(self.broker_port),
            broker_username: other.broker_username.or(self.broker_username),
            broker_password: other.broker_password.or(self.broker_password),
            protocol_version: other.protocol_version.or(self.protocol_version),
            connect_timeout_ms: other.connect_timeout_ms.or(self.connect_timeout_ms),
            reconnect: other.reconnect.or(self.reconnect),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            sources: other.sources.or(self.sources),
            channel_suffix: other.channel_suffix.or(self.channel_suffix),
            data_dir: other.data_dir.or(self.data_dir),
            file_pattern: other.file_pattern.or(self.file_pattern),
            date_column: other.date_column.or(self.date_column),
            value_column: other.value_column.or(self.value_column),
            pacing_ms: other.pacing_ms.or(self.pacing_ms),
            linger_seconds: other.linger_seconds.or(self.linger_seconds),
            export_path: other.export_path.or(self.export_path),
        }
    }

    fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            broker: Some("redis".to_string()),
            broker_host: Some("127.0.0.1".to_string()),
            broker_port: Some(6379),
            protocol_version: Some("resp3".to_string()),
            connect_timeout_ms: Some(60_000),
            reconnect: Some("manual".to_string()),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60_000),
            sources: Some(vec![
                "shasta".to_string(),
                "oroville".to_string(),
                "sonoma".to_string(),
            ]),
            channel_suffix: Some(DEFAULT_CHANNEL_SUFFIX.to_string()),
            data_dir: Some(PathBuf::from(".")),
            file_pattern: Some(DEFAULT_FILE_PATTERN.to_string()),
            date_column: Some(DEFAULT_DATE_FIELD.to_string()),
            value_column: Some(DEFAULT_VALUE_FIELD.to_string()),
            pacing_ms: Some(1000),
            linger_seconds: Some(20),
            ..Default::default()
        }
    }

    /// Turns the merged layers into validated settings.
    pub fn into_settings(self) -> Result<Settings> {
        let merged = Config::defaults().merge(self);

        let broker_kind = match merged.broker.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("redis") | None => BrokerKind::Redis,
            Some("memory") => BrokerKind::Memory,
            Some(other) => bail!("unknown broker backend '{}'", other),
        };

        let protocol = match merged.protocol_version.as_deref() {
            Some(v) => v.parse::<ProtocolVersion>().map_err(|e| anyhow!(e))?,
            None => ProtocolVersion::default(),
        };

        // Authentication is opt-in through the password.
        let credentials = merged.broker_password.map(|password| Credentials {
            username: merged.broker_username.clone(),
            password,
        });

        let broker = BrokerConfig {
            host: merged.broker_host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: merged.broker_port.unwrap_or(6379),
            connect_timeout: Duration::from_millis(merged.connect_timeout_ms.unwrap_or(60_000)),
            protocol,
            credentials,
        };

        let reconnect = match merged.reconnect.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("manual") | None => ReconnectPolicy::Manual,
            Some("auto") => ReconnectPolicy::Auto {
                base_delay: Duration::from_millis(merged.reconnect_base_delay_ms.unwrap_or(1000)),
                max_delay: Duration::from_millis(merged.reconnect_max_delay_ms.unwrap_or(60_000)),
                max_attempts: merged.reconnect_max_attempts,
            },
            Some(other) => bail!("unknown reconnect policy '{}'", other),
        };

        let sources: Vec<String> = merged
            .sources
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if sources.is_empty() {
            bail!("at least one source must be configured");
        }

        Ok(Settings {
            log_dir: merged.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: merged.log_level.unwrap_or_else(|| "info".to_string()),
            broker_kind,
            broker,
            reconnect,
            sources,
            channel_suffix: merged
                .channel_suffix
                .unwrap_or_else(|| DEFAULT_CHANNEL_SUFFIX.to_string()),
            data_dir: merged.data_dir.unwrap_or_else(|| PathBuf::from(".")),
            file_pattern: merged
                .file_pattern
                .unwrap_or_else(|| DEFAULT_FILE_PATTERN.to_string()),
            date_column: merged
                .date_column
                .unwrap_or_else(|| DEFAULT_DATE_FIELD.to_string()),
            value_column: merged
                .value_column
                .unwrap_or_else(|| DEFAULT_VALUE_FIELD.to_string()),
            pacing: Duration::from_millis(merged.pacing_ms.unwrap_or(1000)),
            linger: Duration::from_secs(merged.linger_seconds.unwrap_or(20)),
            export_path: merged.export_path,
        })
    }
}

/// Broker backend the server runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Redis,
    /// In-process broker; publisher and subscriber share one process.
    Memory,
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub log_level: String,
    pub broker_kind: BrokerKind,
    pub broker: BrokerConfig,
    pub reconnect: ReconnectPolicy,
    pub sources: Vec<String>,
    pub channel_suffix: String,
    pub data_dir: PathBuf,
    pub file_pattern: String,
    pub date_column: String,
    pub value_column: String,
    pub pacing: Duration,
    pub linger: Duration,
    pub export_path: Option<PathBuf>,
}

/// Loads settings from defaults, then the JSON config file, then the
/// environment and command line.
pub fn load_config() -> Result<Settings> {
    let cli_args = Config::parse();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::default();

    // Logging is not up yet, so problems with the file go to stderr.
    if config_file_path.exists() {
        let shown = config_file_path.display();
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("Failed to read config file {}", shown))?;
        let file_config = serde_json::from_str::<Config>(&config_str)
            .with_context(|| format!("Failed to parse config file {}", shown))?;
        current_config = current_config.merge(file_config);
    } else if cli_args.config_path.is_some() {
        eprintln!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config.merge(cli_args).into_settings()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let settings = Config::default().into_settings().unwrap();
        assert_eq!(settings.broker_kind, BrokerKind::Redis);
        assert_eq!(settings.broker.endpoint(), "127.0.0.1:6379");
        assert_eq!(settings.broker.connect_timeout, Duration::from_secs(60));
        assert!(settings.broker.credentials.is_none());
        assert_eq!(settings.reconnect, ReconnectPolicy::Manual);
        assert_eq!(settings.sources, vec!["shasta", "oroville", "sonoma"]);
        assert_eq!(settings.channel_suffix, "WML");
        assert_eq!(settings.value_column, "TAF");
        assert_eq!(settings.pacing, Duration::from_secs(1));
        assert_eq!(settings.linger, Duration::from_secs(20));
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        let file_layer: Config = serde_json::from_str(
            r#"{"brokerPort": 6380, "sources": ["folsom"], "pacingMs": 10}"#,
        )
        .unwrap();
        let cli_layer = Config {
            broker_port: Some(7000),
            ..Default::default()
        };

        let settings = Config::default()
            .merge(file_layer)
            .merge(cli_layer)
            .into_settings()
            .unwrap();
        assert_eq!(settings.broker.port, 7000);
        assert_eq!(settings.sources, vec!["folsom"]);
        assert_eq!(settings.pacing, Duration::from_millis(10));
    }

    #[test]
    fn password_enables_credentials() {
        let settings = Config {
            broker_username: Some("ops".into()),
            broker_password: Some("secret".into()),
            ..Default::default()
        }
        .into_settings()
        .unwrap();
        let creds = settings.broker.credentials.unwrap();
        assert_eq!(creds.username.as_deref(), Some("ops"));
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn auto_reconnect_carries_its_delays() {
        let settings = Config {
            reconnect: Some("auto".into()),
            reconnect_base_delay_ms: Some(250),
            reconnect_max_attempts: Some(4),
            ..Default::default()
        }
        .into_settings()
        .unwrap();
        assert_eq!(
            settings.reconnect,
            ReconnectPolicy::Auto {
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(60),
                max_attempts: Some(4),
            }
        );
    }

    #[test]
    fn rejects_unknown_values() {
        let bad_broker = Config {
            broker: Some("kafka".into()),
            ..Default::default()
        };
        assert!(bad_broker.into_settings().is_err());

        let no_sources = Config {
            sources: Some(vec![" ".into()]),
            ..Default::default()
        };
        assert!(no_sources.into_settings().is_err());

        let bad_protocol = Config {
            protocol_version: Some("resp9".into()),
            ..Default::default()
        };
        assert!(bad_protocol.into_settings().is_err());
    }
}
