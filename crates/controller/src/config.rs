//! TOML config file loading and validation. The config is read once at boot
//! and never mutated afterwards; the update reconciler may replace the file on
//! disk, which takes effect on the next start.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Marker key carrying the config file's own version. Must stay a top-level
/// `key = "value"` line so the update reconciler can find it without parsing.
pub const CONFIG_VERSION_KEY: &str = "config_version";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub config_version: Option<String>,
    /// Controller identity: MQTT client id and topic prefix, e.g. `FQX_SM_10006`.
    pub device_id: String,
    /// Field-bus slave addresses, in monitoring order.
    pub addresses: Vec<u8>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    Serial,
    Sim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusParity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    pub path: String,
    pub baud_rate: u32,
    pub parity: BusParity,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub read_retries: u32,
    pub read_retry_delay_ms: u64,
    pub valve_settle_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Serial,
            path: "/dev/serial0".into(),
            baud_rate: 9600,
            parity: BusParity::Odd,
            poll_attempts: 15,
            poll_interval_ms: 100,
            read_retries: 5,
            read_retry_delay_ms: 1000,
            valve_settle_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// Network interface brought up by the cellular modem (e.g. `wwan0`).
    /// Without one the link is treated as always up.
    pub interface: Option<String>,
    pub init_timeout_secs: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            interface: None,
            init_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub ping_failure_threshold: u32,
    pub boot_grace_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ping_failure_threshold: 10,
            boot_grace_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub checkpoint_secs: u64,
    /// Restart when available memory drops below this floor. 0 disables.
    pub min_free_memory_mib: u64,
    pub self_test_on_boot: bool,
    /// Target seeded at boot for devices without a stored record.
    pub default_target_litres: Option<u32>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1800,
            checkpoint_secs: 30,
            min_free_memory_mib: 16,
            self_test_on_boot: true,
            default_target_litres: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub device: Option<PathBuf>,
    pub feed_interval_secs: u64,
    pub hang_timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            device: None,
            feed_interval_secs: 5,
            hang_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/meter-controller"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub enabled: bool,
    pub base_url: String,
    pub firmware_dir: PathBuf,
    /// Firmware file set, relative to `firmware_dir` and `base_url`.
    pub files: Vec<String>,
    pub fetch_retries: u32,
    pub fetch_retry_delay_secs: u64,
    pub fetch_timeout_secs: u64,
    pub maintenance_hour: u8,
    pub utc_offset_hours: i8,
    pub restart_after_maintenance: bool,
    pub reconcile_on_boot: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            firmware_dir: PathBuf::from("/opt/meter-controller"),
            files: Vec::new(),
            fetch_retries: 3,
            fetch_retry_delay_secs: 3,
            fetch_timeout_secs: 30,
            maintenance_hour: 0,
            utc_offset_hours: 0,
            restart_after_maintenance: true,
            reconcile_on_boot: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn checkpoint(&self) -> Duration {
        Duration::from_secs(self.checkpoint_secs)
    }
}

impl WatchdogConfig {
    pub fn feed_interval(&self) -> Duration {
        Duration::from_secs(self.feed_interval_secs)
    }

    pub fn hang_timeout(&self) -> Duration {
        Duration::from_secs(self.hang_timeout_secs)
    }
}

impl LinkConfig {
    pub fn boot_grace(&self) -> Duration {
        Duration::from_secs(self.boot_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Highest unicast Modbus slave address.
const MAX_SLAVE_ADDRESS: u8 = 247;

impl Config {
    /// Validate the whole config. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_identity(&mut errors);
        self.validate_bus(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_update(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_identity(&self, errors: &mut Vec<String>) {
        if self.device_id.trim().is_empty() {
            errors.push("device_id is empty".into());
        } else if self.device_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "device_id '{}' must not contain MQTT topic characters (/ + #)",
                self.device_id
            ));
        }

        if self.addresses.is_empty() {
            errors.push("addresses is empty, no devices to monitor".into());
        }
        let mut seen: HashSet<u8> = HashSet::new();
        for &a in &self.addresses {
            if a == 0 || a > MAX_SLAVE_ADDRESS {
                errors.push(format!(
                    "address {a} out of range [1, {MAX_SLAVE_ADDRESS}]"
                ));
            } else if !seen.insert(a) {
                errors.push(format!("address {a} listed more than once"));
            }
        }
    }

    fn validate_bus(&self, errors: &mut Vec<String>) {
        let b = &self.bus;
        if b.backend == BusBackend::Serial && b.path.trim().is_empty() {
            errors.push("bus.path is empty".into());
        }
        if b.baud_rate == 0 {
            errors.push("bus.baud_rate must be positive".into());
        }
        if b.poll_attempts == 0 {
            errors.push("bus.poll_attempts must be positive".into());
        }
        if b.read_retries == 0 {
            errors.push("bus.read_retries must be positive".into());
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be positive".into());
        }
        if m.keep_alive_secs < 5 {
            errors.push(format!(
                "mqtt.keep_alive_secs must be at least 5, got {}",
                m.keep_alive_secs
            ));
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password is set without mqtt.username".into());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.link.ping_failure_threshold == 0 {
            errors.push("link.ping_failure_threshold must be positive".into());
        }

        let mon = &self.monitor;
        if mon.interval_secs == 0 {
            errors.push("monitor.interval_secs must be positive".into());
        }
        if mon.checkpoint_secs == 0 {
            errors.push("monitor.checkpoint_secs must be positive".into());
        } else if mon.checkpoint_secs > mon.interval_secs {
            errors.push(format!(
                "monitor.checkpoint_secs ({}) exceeds monitor.interval_secs ({})",
                mon.checkpoint_secs, mon.interval_secs
            ));
        }

        let wd = &self.watchdog;
        if wd.feed_interval_secs == 0 {
            errors.push("watchdog.feed_interval_secs must be positive".into());
        }
        if wd.hang_timeout_secs <= wd.feed_interval_secs {
            errors.push(format!(
                "watchdog.hang_timeout_secs ({}) must exceed watchdog.feed_interval_secs ({})",
                wd.hang_timeout_secs, wd.feed_interval_secs
            ));
        }
        if wd.hang_timeout_secs <= mon.checkpoint_secs {
            errors.push(format!(
                "watchdog.hang_timeout_secs ({}) must exceed monitor.checkpoint_secs ({})",
                wd.hang_timeout_secs, mon.checkpoint_secs
            ));
        }
    }

    fn validate_update(&self, errors: &mut Vec<String>) {
        let u = &self.update;
        if u.maintenance_hour > 23 {
            errors.push(format!(
                "update.maintenance_hour {} out of range [0, 23]",
                u.maintenance_hour
            ));
        }
        if !(-12..=14).contains(&u.utc_offset_hours) {
            errors.push(format!(
                "update.utc_offset_hours {} out of range [-12, 14]",
                u.utc_offset_hours
            ));
        }
        if !u.enabled {
            return;
        }
        if !(u.base_url.starts_with("http://") || u.base_url.starts_with("https://")) {
            errors.push(format!(
                "update.base_url '{}' must start with http:// or https://",
                u.base_url
            ));
        }
        if u.fetch_retries == 0 {
            errors.push("update.fetch_retries must be positive".into());
        }
        if u.fetch_timeout_secs >= self.watchdog.hang_timeout_secs {
            errors.push(format!(
                "update.fetch_timeout_secs ({}) must be below watchdog.hang_timeout_secs ({})",
                u.fetch_timeout_secs, self.watchdog.hang_timeout_secs
            ));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for f in &u.files {
            if f.trim().is_empty() || f.contains('/') || f.contains("..") {
                errors.push(format!(
                    "update.files entry '{f}' must be a plain file name"
                ));
            } else if !seen.insert(f) {
                errors.push(format!("update.files entry '{f}' listed more than once"));
            }
        }
    }

    /// Override deployment-specific values from the environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Ok(dir) = env::var("STATE_DIR") {
            self.storage.state_dir = PathBuf::from(dir);
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply env overrides and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env_overrides();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        device_id = %config.device_id,
        devices = config.addresses.len(),
        version = config.config_version.as_deref().unwrap_or("unversioned"),
        "config loaded"
    );

    Ok(config)
}

/// Parse and validate config text without touching the environment. Used to
/// vet a downloaded config before it replaces the file on disk.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Minimal valid config for unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    toml::from_str(
        r#"
device_id = "FQX_SM_10006"
addresses = [12, 13]

[bus]
backend = "sim"
"#,
    )
    .expect("test config parses")
}

// ===========================================================================
// Tests
// ===========================================================================
