//! Configuration for the `posix-sessions` example binaries.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, exactly as the
//! original cache server's configuration layer did.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

/// Command-line arguments shared by all three example binaries; each only
/// reads the section relevant to it.
#[derive(Parser, Debug)]
#[command(name = "posix-sessions")]
#[command(author = "posix-sessions authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP/UDP session multiplexors and a shared-memory IPC domain", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// TCP listen endpoint (host:port or a filesystem socket path)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Regex pattern framing requests on the TCP session layer
    #[arg(short = 'r', long)]
    pub pattern: Option<String>,

    /// UDP retransmission timeout in milliseconds
    #[arg(long)]
    pub udp_timeout_ms: Option<u64>,

    /// UDP per-segment retry budget
    #[arg(long)]
    pub udp_max_retries: Option<u32>,

    /// Shared-domain backing file path (workers only; launcher generates one)
    #[arg(long)]
    pub shm_name: Option<PathBuf>,

    /// This participant's rank in the shared domain
    #[arg(long)]
    pub shm_rank: Option<u32>,

    /// Shared-domain per-recipient ring buffer capacity, in bytes
    #[arg(long)]
    pub shm_buffer_size: Option<u32>,

    /// Shared-domain participant count (launcher only)
    #[arg(long)]
    pub shm_participants: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub udp: UdpConfig,
    #[serde(default)]
    pub shm: ShmConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            pattern: default_pattern(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_udp_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_udp_max_retries")]
    pub max_retries: u32,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_udp_timeout_ms(),
            max_retries: default_udp_max_retries(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ShmConfig {
    pub name: Option<PathBuf>,
    pub rank: Option<u32>,
    #[serde(default = "default_shm_buffer_size")]
    pub buffer_size: u32,
    #[serde(default = "default_shm_participants")]
    pub participants: u32,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_pattern() -> String {
    "(.*)\n".to_string()
}

fn default_udp_timeout_ms() -> u64 {
    500
}

fn default_udp_max_retries() -> u32 {
    5
}

fn default_shm_buffer_size() -> u32 {
    64 * 1024
}

fn default_shm_participants() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration, CLI over TOML.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub pattern: String,
    pub udp_timeout_ms: u64,
    pub udp_max_retries: u32,
    pub shm_name: Option<PathBuf>,
    pub shm_rank: Option<u32>,
    pub shm_buffer_size: u32,
    pub shm_participants: u32,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and an optional TOML file. CLI
    /// arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.tcp.listen),
            pattern: cli.pattern.unwrap_or(toml_config.tcp.pattern),
            udp_timeout_ms: cli.udp_timeout_ms.unwrap_or(toml_config.udp.timeout_ms),
            udp_max_retries: cli.udp_max_retries.unwrap_or(toml_config.udp.max_retries),
            shm_name: cli.shm_name.or(toml_config.shm.name),
            shm_rank: cli.shm_rank.or(toml_config.shm.rank),
            shm_buffer_size: cli.shm_buffer_size.unwrap_or(toml_config.shm.buffer_size),
            shm_participants: cli
                .shm_participants
                .unwrap_or(toml_config.shm.participants),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_toml_config_matches_expected_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.tcp.listen, "127.0.0.1:7000");
        assert_eq!(config.udp.max_retries, 5);
        assert_eq!(config.shm.participants, 1);
    }

    #[test]
    fn toml_parsing_round_trips_every_section() {
        let toml_str = r#"
            [tcp]
            listen = "0.0.0.0:9000"
            pattern = "(.*)\r\n"

            [udp]
            timeout_ms = 250
            max_retries = 3

            [shm]
            buffer_size = 8192
            participants = 4

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tcp.listen, "0.0.0.0:9000");
        assert_eq!(config.udp.timeout_ms, 250);
        assert_eq!(config.shm.buffer_size, 8192);
        assert_eq!(config.shm.participants, 4);
        assert_eq!(config.logging.level, "debug");
    }
}
