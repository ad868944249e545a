//! # Configuration Management Module
//!
//! Loads and writes the TOML configuration that tunes the link core: reconnect
//! timings, region confirmation timeout, duplicate-suppression windows, where
//! pairing state is persisted, and logging.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshlink::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshlink.toml").await?;
//!     let tuning = config.reconnect_tuning();
//!     println!("max reconnect attempts: {}", tuning.max_attempts);
//!
//!     Config::create_default("meshlink.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [link]
//! auto_reconnect = true
//! max_attempts = 8
//! scan_timeout_secs = 15
//! settle_delay_secs = 10
//! backoff_secs = 4
//! ack_ttl_secs = 300
//! local_node = 0x1a2b3c4d
//!
//! [region]
//! confirm_timeout_secs = 90
//!
//! [dedup]
//! recent_window_secs = 5
//! fingerprint_window_secs = 60
//!
//! [storage]
//! state_file = "data/link_state.json"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every tuning value is optional. Missing values fall back to defaults and
//! out-of-range values are clamped (with a warning) when converted into the
//! tuning structs consumed at runtime.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::time::Duration;

use crate::dedup::DedupTuning;
use crate::reconnect::ReconnectTuning;
use crate::region::RegionTuning;

/// Nordic UART-style service UUID advertised by Meshtastic radios.
pub const MESHTASTIC_SERVICE_UUID: &str = "6ba1b218-15a8-461f-9fa8-5dcae273eafd";

/// Pending sends without a delivery ack are dropped after this long.
pub const DEFAULT_ACK_TTL_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub region: RegionConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Default for the persisted auto-reconnect flag on first run.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Bounded number of scan/connect attempts after an unexpected drop.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Discovery scan window per attempt (seconds).
    #[serde(default)]
    pub scan_timeout_secs: Option<u64>,
    /// Wait before the first scan so a rebooting radio can come back (seconds).
    #[serde(default)]
    pub settle_delay_secs: Option<u64>,
    /// Pause between failed attempts (seconds).
    #[serde(default)]
    pub backoff_secs: Option<u64>,
    /// Link must stay up this long after connect to count as recovered (ms).
    #[serde(default)]
    pub post_connect_settle_ms: Option<u64>,
    /// Upper bound for the protocol handshake after connect (seconds).
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
    /// Delay before a failed background loop resets to idle (seconds).
    #[serde(default)]
    pub failed_reset_secs: Option<u64>,
    /// Slice size for every cancellable wait (ms).
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Service UUID used to filter discovery scans.
    #[serde(default)]
    pub service_filter: Option<String>,
    /// How long a sent message waits for its delivery ack (seconds).
    #[serde(default)]
    pub ack_ttl_secs: Option<u64>,
    /// Our node number, folded into outgoing application ids.
    #[serde(default)]
    pub local_node: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegionConfig {
    /// How long to wait for the reboot/reconnect confirmation (seconds).
    #[serde(default)]
    pub confirm_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DedupConfig {
    /// Exact signature window for rapid resends (seconds).
    #[serde(default)]
    pub recent_window_secs: Option<u64>,
    /// Cross-path content fingerprint window (seconds).
    #[serde(default)]
    pub fingerprint_window_secs: Option<u64>,
    /// Timestamp bucket used when deriving application ids (seconds).
    #[serde(default)]
    pub bucket_secs: Option<u64>,
    /// Maximum admitted messages held for comparison.
    #[serde(default)]
    pub max_held: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub state_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: Some(8),
            scan_timeout_secs: Some(15),
            settle_delay_secs: Some(10),
            backoff_secs: Some(4),
            post_connect_settle_ms: Some(1500),
            handshake_timeout_secs: Some(20),
            failed_reset_secs: Some(5),
            poll_interval_ms: Some(250),
            service_filter: Some(MESHTASTIC_SERVICE_UUID.to_string()),
            ack_ttl_secs: Some(DEFAULT_ACK_TTL_SECS),
            local_node: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: "data/link_state.json".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshlink.log".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            link: LinkConfig::default(),
            region: RegionConfig {
                confirm_timeout_secs: Some(90),
            },
            dedup: DedupConfig {
                recent_window_secs: Some(5),
                fingerprint_window_secs: Some(60),
                bucket_secs: Some(60),
                max_held: Some(2000),
            },
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Build reconnect tuning, clamping values that would make the loop
    /// unbounded or spin.
    pub fn reconnect_tuning(&self) -> ReconnectTuning {
        let l = &self.link;
        let d = ReconnectTuning::default();
        let mut max_attempts = l.max_attempts.unwrap_or(d.max_attempts);
        if max_attempts == 0 || max_attempts > 50 {
            warn!(
                "Configured max_attempts={} out of range 1..=50; clamping",
                max_attempts
            );
            max_attempts = max_attempts.clamp(1, 50);
        }
        let mut poll_ms = l
            .poll_interval_ms
            .unwrap_or(d.poll_interval.as_millis() as u64);
        if poll_ms < 10 {
            warn!(
                "Configured poll_interval_ms={}ms is below 10ms; clamping to 10ms",
                poll_ms
            );
            poll_ms = 10;
        }
        let secs = |v: Option<u64>, fallback: Duration| v.map(Duration::from_secs).unwrap_or(fallback);
        ReconnectTuning {
            max_attempts,
            scan_timeout: secs(l.scan_timeout_secs, d.scan_timeout),
            settle_delay: secs(l.settle_delay_secs, d.settle_delay),
            backoff: secs(l.backoff_secs, d.backoff),
            post_connect_settle: l
                .post_connect_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(d.post_connect_settle),
            handshake_timeout: secs(l.handshake_timeout_secs, d.handshake_timeout),
            failed_reset_delay: secs(l.failed_reset_secs, d.failed_reset_delay),
            poll_interval: Duration::from_millis(poll_ms),
            service_filter: l.service_filter.clone().or(d.service_filter),
        }
    }

    /// Ack wait for sent messages, at least one second.
    pub fn ack_ttl(&self) -> Duration {
        let secs = self.link.ack_ttl_secs.unwrap_or(DEFAULT_ACK_TTL_SECS);
        if secs == 0 {
            warn!("Configured ack_ttl_secs=0 would expire every send at once; using 1s");
            return Duration::from_secs(1);
        }
        Duration::from_secs(secs)
    }

    pub fn region_tuning(&self) -> RegionTuning {
        let d = RegionTuning::default();
        let mut timeout = self
            .region
            .confirm_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(d.confirm_timeout);
        if timeout < Duration::from_secs(10) {
            warn!(
                "Configured confirm_timeout_secs={} is below 10s; radios need longer to reboot, clamping",
                timeout.as_secs()
            );
            timeout = Duration::from_secs(10);
        }
        RegionTuning {
            confirm_timeout: timeout,
            poll_interval: self.reconnect_tuning().poll_interval,
        }
    }

    pub fn dedup_tuning(&self) -> DedupTuning {
        let d = DedupTuning::default();
        let c = &self.dedup;
        let recent = c
            .recent_window_secs
            .map(Duration::from_secs)
            .unwrap_or(d.recent_window);
        let mut fingerprint = c
            .fingerprint_window_secs
            .map(Duration::from_secs)
            .unwrap_or(d.fingerprint_window);
        if fingerprint < recent {
            warn!(
                "fingerprint_window_secs ({}) shorter than recent_window_secs ({}); raising",
                fingerprint.as_secs(),
                recent.as_secs()
            );
            fingerprint = recent;
        }
        DedupTuning {
            recent_window: recent,
            fingerprint_window: fingerprint,
            bucket: c
                .bucket_secs
                .filter(|&b| b > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.bucket),
            max_held: c.max_held.filter(|&m| m > 0).unwrap_or(d.max_held),
        }
    }
}
