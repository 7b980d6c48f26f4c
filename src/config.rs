//! Configuration loading and persistence.
//!
//! Reads and writes the on-disk configuration surface described in
//! SPEC_FULL.md §3.C / spec.md §6.4. There is no keyring or secret-store
//! integration here: the config loader and its storage medium are an
//! external collaborator per spec.md §1, so `token` is read from the same
//! JSON/env surface as every other field.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use std::{fs, path::Path};

use crate::constants;

/// A single `N/INTERVAL_S` throttle stage parsed from the `throttle` config
/// string (comma-separated list of stages applied in series).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleStage {
    /// Maximum number of publishes allowed per interval.
    pub max_in_interval: u32,
    /// Interval, in seconds, over which `max_in_interval` applies.
    pub interval_s: u64,
}

/// Configuration surface for the Link/Protocol/Stash stack.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Broker host (and port, as `host:port`).
    pub host: String,
    /// Broker virtual host.
    pub vhost: String,
    /// Account prefix; combined with `epid` to form the broker username.
    pub prefix: String,
    /// Endpoint id; combined with `prefix` to form the broker username and
    /// used directly as the exchange/queue name.
    pub epid: String,
    /// Broker password.
    pub passwd: String,
    /// Hex-encoded HMAC-SHA256 signing token (32 raw bytes).
    #[serde(default)]
    pub token: String,
    /// Optional path to a PEM CA bundle for the broker TLS connection.
    #[serde(default)]
    pub sslca: Option<PathBuf>,
    /// `basic_qos` prefetch count for the data channel.
    #[serde(default = "default_prefetch")]
    pub prefetch: u32,
    /// Fraction of `prefetch` consumed before a multi-ack is sent.
    #[serde(default = "default_ack_fraction")]
    pub ack_fraction: f64,
    /// Broker heartbeat interval, in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Socket-level read/connect timeout, in seconds.
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,
    /// If true, exceptions raised by user source startup code are logged
    /// rather than aborting client startup.
    #[serde(default)]
    pub startup_ignore_exc: bool,
    /// Delay, in seconds, between connection retry attempts (minimum 1s).
    #[serde(default = "default_conn_retry_delay_secs")]
    pub conn_retry_delay_secs: u64,
    /// Threshold, in seconds, of continuous connection failure before
    /// further retry attempts are logged at error level instead of warning.
    #[serde(default = "default_conn_error_log_threshold_secs")]
    pub conn_error_log_threshold_secs: u64,
    /// Total time, in seconds, a request may remain unanswered due to
    /// transport failure before `LinkError` is surfaced to the caller.
    /// Zero disables the timeout (requests retry indefinitely).
    #[serde(default = "default_network_retry_timeout_secs")]
    pub network_retry_timeout_secs: u64,
    /// Maximum number of outbound messages queued before `send` blocks.
    /// Zero means unlimited.
    #[serde(default = "default_send_queue_size")]
    pub send_queue_size: usize,
    /// Comma-separated `N/INTERVAL_S` throttle stages, applied in series
    /// before each publish (e.g. `"5/1,60/60"`).
    #[serde(default)]
    pub throttle: String,
    /// Maximum size, in bytes, of an encoded (post-compression) wrapper
    /// frame before it is rejected locally rather than sent.
    #[serde(default = "default_max_encoded_length")]
    pub max_encoded_length: usize,
    /// Whether values are automatically UBJSON-encoded/decoded on
    /// share/feed-data boundaries.
    #[serde(default = "default_true")]
    pub auto_encode_decode: bool,
    /// Language tag, filled in from the container's PING response if not
    /// set explicitly.
    #[serde(default)]
    pub lang: Option<String>,
}

fn default_prefetch() -> u32 {
    constants::DEFAULT_PREFETCH
}
fn default_ack_fraction() -> f64 {
    constants::DEFAULT_ACK_FRACTION
}
fn default_heartbeat_secs() -> u64 {
    constants::DEFAULT_HEARTBEAT.as_secs()
}
fn default_socket_timeout_secs() -> u64 {
    constants::DEFAULT_SOCKET_TIMEOUT.as_secs()
}
fn default_conn_retry_delay_secs() -> u64 {
    constants::DEFAULT_CONN_RETRY_DELAY.as_secs()
}
fn default_conn_error_log_threshold_secs() -> u64 {
    constants::DEFAULT_CONN_ERROR_LOG_THRESHOLD.as_secs()
}
fn default_network_retry_timeout_secs() -> u64 {
    constants::DEFAULT_NETWORK_RETRY_TIMEOUT.as_secs()
}
fn default_send_queue_size() -> usize {
    constants::DEFAULT_SEND_QUEUE_SIZE
}
fn default_max_encoded_length() -> usize {
    constants::DEFAULT_MAX_ENCODED_LENGTH
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            vhost: String::new(),
            prefix: String::new(),
            epid: String::new(),
            passwd: String::new(),
            token: String::new(),
            sslca: None,
            prefetch: default_prefetch(),
            ack_fraction: default_ack_fraction(),
            heartbeat_secs: default_heartbeat_secs(),
            socket_timeout_secs: default_socket_timeout_secs(),
            startup_ignore_exc: false,
            conn_retry_delay_secs: default_conn_retry_delay_secs(),
            conn_error_log_threshold_secs: default_conn_error_log_threshold_secs(),
            network_retry_timeout_secs: default_network_retry_timeout_secs(),
            send_queue_size: default_send_queue_size(),
            throttle: String::new(),
            max_encoded_length: default_max_encoded_length(),
            auto_encode_decode: true,
            lang: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/ioticiser-test`
    /// 2. `IOTICISER_CONFIG_DIR` env var: explicit override
    /// 3. `IOTICISER_ENV=test`/`system_test`: `tmp/ioticiser-test`
    /// 4. Default: platform config dir
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/ioticiser-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(test_dir) = std::env::var("IOTICISER_CONFIG_DIR") {
                    PathBuf::from(test_dir)
                } else if crate::env::should_use_test_paths() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/ioticiser-test")
                } else {
                    dirs::config_dir()
                        .context("could not determine config directory")?
                        .join(crate::env::APP_NAME)
                }
            }
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from an explicit path (used by tests and by
    /// callers who manage their own file location).
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            anyhow::bail!("config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("IOTICISER_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("IOTICISER_VHOST") {
            self.vhost = v;
        }
        if let Ok(v) = std::env::var("IOTICISER_PREFIX") {
            self.prefix = v;
        }
        if let Ok(v) = std::env::var("IOTICISER_EPID") {
            self.epid = v;
        }
        if let Ok(v) = std::env::var("IOTICISER_PASSWD") {
            self.passwd = v;
        }
        if let Ok(v) = std::env::var("IOTICISER_TOKEN") {
            self.token = v;
        }
        if let Ok(v) = std::env::var("IOTICISER_NETWORK_RETRY_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.network_retry_timeout_secs = secs;
            }
        }
    }

    /// Persists the current configuration to disk (mode 0600 on Unix).
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Parses `token` as a 32-byte HMAC-SHA256 signing key.
    pub fn token_bytes(&self) -> Result<Vec<u8>> {
        hex_decode(&self.token).context("token is not valid hex")
    }

    /// Broker username: `prefix` concatenated with `epid`.
    #[must_use]
    pub fn username(&self) -> String {
        format!("{}{}", self.prefix, self.epid)
    }

    /// Broker exchange/data-queue name: the `epid` itself.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.epid
    }

    /// Keep-alive queue name: `epid` with a `_ka` suffix.
    #[must_use]
    pub fn keepalive_queue(&self) -> String {
        format!("{}_ka", self.epid)
    }

    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    #[must_use]
    pub fn conn_retry_delay(&self) -> Duration {
        Duration::from_secs(self.conn_retry_delay_secs.max(1))
    }

    #[must_use]
    pub fn conn_error_log_threshold(&self) -> Duration {
        Duration::from_secs(self.conn_error_log_threshold_secs)
    }

    /// `None` means the network-retry timeout is disabled (spec: `0`
    /// disables it).
    #[must_use]
    pub fn network_retry_timeout(&self) -> Option<Duration> {
        if self.network_retry_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.network_retry_timeout_secs))
        }
    }

    /// Parses the `throttle` config string into its component stages.
    /// Malformed stages are skipped with a logged warning rather than
    /// failing the whole parse, since throttling is best-effort.
    #[must_use]
    pub fn throttle_stages(&self) -> Vec<ThrottleStage> {
        self.throttle
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|stage| {
                let (n, interval) = stage.split_once('/')?;
                let max_in_interval = n.trim().parse().ok()?;
                let interval_s = interval.trim().parse().ok()?;
                Some(ThrottleStage {
                    max_in_interval,
                    interval_s,
                })
            })
            .collect()
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        anyhow::bail!("hex string has odd length");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte at offset {i}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.prefetch, constants::DEFAULT_PREFETCH);
        assert!((config.ack_fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.heartbeat_secs, 30);
        assert!(config.auto_encode_decode);
        assert!(config.lang.is_none());
    }

    #[test]
    fn test_username_and_exchange() {
        let mut config = Config::default();
        config.prefix = "acct_".to_string();
        config.epid = "abc123".to_string();
        assert_eq!(config.username(), "acct_abc123");
        assert_eq!(config.exchange(), "abc123");
        assert_eq!(config.keepalive_queue(), "abc123_ka");
    }

    #[test]
    fn test_network_retry_timeout_zero_disables() {
        let mut config = Config::default();
        config.network_retry_timeout_secs = 0;
        assert!(config.network_retry_timeout().is_none());
        config.network_retry_timeout_secs = 300;
        assert_eq!(config.network_retry_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_throttle_stages_parsing() {
        let mut config = Config::default();
        config.throttle = "5/1,60/60".to_string();
        let stages = config.throttle_stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].max_in_interval, 5);
        assert_eq!(stages[0].interval_s, 1);
        assert_eq!(stages[1].max_in_interval, 60);
        assert_eq!(stages[1].interval_s, 60);
    }

    #[test]
    fn test_throttle_stages_skips_malformed() {
        let mut config = Config::default();
        config.throttle = "5/1,garbage,10/5".to_string();
        let stages = config.throttle_stages();
        assert_eq!(stages.len(), 2);
    }

    #[test]
    fn test_token_bytes_round_trip() {
        let mut config = Config::default();
        config.token = "00".repeat(32);
        let bytes = config.token_bytes().unwrap();
        assert_eq!(bytes.len(), 32);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_token_bytes_rejects_bad_hex() {
        let mut config = Config::default();
        config.token = "not-hex".to_string();
        assert!(config.token_bytes().is_err());
    }

    #[test]
    fn test_config_json_round_trip() {
        let mut config = Config::default();
        config.host = "broker.example.com:5671".to_string();
        config.epid = "ep1".to_string();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.host, config.host);
        assert_eq!(loaded.epid, config.epid);
    }
}
