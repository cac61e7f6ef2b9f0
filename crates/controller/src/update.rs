//! Over-the-air reconciliation of the firmware file set and the device config
//! against a plain HTTP file server.
//!
//! Firmware: `<base>/version.txt` names the current release; when it differs
//! from the locally recorded version every file in `update.files` is fetched
//! and swapped in atomically. The local version only advances once the whole
//! set is installed, so a partial download is retried next time.
//!
//! Config: `<base>/device_configs/<device_id>_config.toml` replaces the local
//! config when its `config_version` marker differs.

use anyhow::{anyhow, ensure, Context, Result};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{self, UpdateConfig, CONFIG_VERSION_KEY};
use crate::watchdog::LivenessWriter;

/// Version assumed when nothing is recorded locally.
pub(crate) const NO_VERSION: &str = "0.0.0";

const VERSION_FILE: &str = "version.txt";

const RETRY_CHECKPOINT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Remote source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct Fetched {
    pub(crate) body: Vec<u8>,
    /// Content-Length advertised by the server, if any.
    pub(crate) expected_len: Option<u64>,
}

pub(crate) trait RemoteSource: Send {
    /// Fetch `path` relative to the update base URL.
    fn fetch(&self, path: &str) -> Result<Fetched>;
}

pub(crate) struct HttpSource {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpSource {
    pub(crate) fn new(cfg: &UpdateConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(cfg.fetch_timeout_secs))
            .build();
        Self {
            agent,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl RemoteSource for HttpSource {
    fn fetch(&self, path: &str) -> Result<Fetched> {
        let url = format!("{}/{path}", self.base_url);
        let resp = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("GET {url}"))?;
        let expected_len = resp
            .header("Content-Length")
            .and_then(|v| v.trim().parse().ok());
        let mut body = Vec::new();
        resp.into_reader()
            .read_to_end(&mut body)
            .with_context(|| format!("reading body of {url}"))?;
        Ok(Fetched { body, expected_len })
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FirmwareOutcome {
    UpToDate,
    /// Every file installed and the new version recorded. Needs a restart.
    Updated { version: String },
    /// Some files failed; the local version was left alone.
    Incomplete { version: String, failed: Vec<String> },
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConfigOutcome {
    UpToDate,
    Replaced { from: String, to: String },
    Rejected,
    Unreachable,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Value of the first `config_version = "<x>"` line.
pub(crate) fn extract_version(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        if key.trim() != CONFIG_VERSION_KEY {
            return None;
        }
        let value = value.trim();
        let inner = value.strip_prefix('"')?.split('"').next()?;
        Some(inner.to_string())
    })
}

/// Write `fetched` to `.tmp_<name>` beside `dest`, sync, check the size and
/// rename it over `dest`.
fn install(dest: &Path, fetched: &Fetched) -> Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", dest.display()))?;
    let name = dest
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", dest.display()))?;
    let tmp = dir.join(format!(".tmp_{}", name.to_string_lossy()));

    let result = (|| -> Result<()> {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        f.write_all(&fetched.body)?;
        f.sync_all()?;
        drop(f);

        let on_disk = fs::metadata(&tmp)?.len();
        ensure!(
            on_disk == fetched.body.len() as u64,
            "size mismatch for {}: {on_disk} on disk, {} downloaded",
            dest.display(),
            fetched.body.len()
        );
        if let Some(expected) = fetched.expected_len {
            ensure!(
                on_disk == expected,
                "size mismatch for {}: {on_disk} on disk, server advertised {expected}",
                dest.display()
            );
        }
        fs::rename(&tmp, dest)
            .with_context(|| format!("failed to replace {}", dest.display()))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub(crate) struct UpdateReconciler {
    source: Box<dyn RemoteSource>,
    cfg: UpdateConfig,
    device_id: String,
    state_dir: PathBuf,
    config_path: PathBuf,
    retry_delay: Duration,
}

impl UpdateReconciler {
    pub(crate) fn new(
        source: Box<dyn RemoteSource>,
        cfg: &UpdateConfig,
        device_id: &str,
        state_dir: &Path,
        config_path: &Path,
    ) -> Self {
        Self {
            source,
            cfg: cfg.clone(),
            device_id: device_id.to_string(),
            state_dir: state_dir.to_path_buf(),
            config_path: config_path.to_path_buf(),
            retry_delay: Duration::from_secs(cfg.fetch_retry_delay_secs),
        }
    }

    /// Liveness is touched before every attempt and through the retry delay,
    /// so a long file set never looks like a hung worker.
    fn fetch_with_retries(&self, path: &str, liveness: &LivenessWriter) -> Option<Fetched> {
        let attempts = self.cfg.fetch_retries.max(1);
        for attempt in 1..=attempts {
            liveness.touch();
            match self.source.fetch(path) {
                Ok(f) => return Some(f),
                Err(e) => {
                    warn!(path, attempt, attempts, error = format!("{e:#}"), "fetch failed");
                    if attempt < attempts {
                        liveness.sleep_in_checkpoints(
                            self.retry_delay,
                            RETRY_CHECKPOINT,
                            thread::sleep,
                        );
                    }
                }
            }
        }
        None
    }

    fn version_path(&self) -> PathBuf {
        self.state_dir.join(VERSION_FILE)
    }

    pub(crate) fn local_version(&self) -> Result<String> {
        match fs::read_to_string(self.version_path()) {
            Ok(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Ok(_) => Ok(NO_VERSION.to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(NO_VERSION.to_string()),
            Err(e) => Err(e).context("failed to read local firmware version"),
        }
    }

    fn save_local_version(&self, version: &str) -> Result<()> {
        fs::create_dir_all(&self.state_dir)?;
        install(
            &self.version_path(),
            &Fetched {
                body: version.as_bytes().to_vec(),
                expected_len: None,
            },
        )
        .context("failed to record firmware version")
    }

    /// Bring the firmware file set in line with the server.
    pub(crate) fn reconcile_firmware(&self, liveness: &LivenessWriter) -> Result<FirmwareOutcome> {
        let Some(remote) = self.fetch_with_retries(VERSION_FILE, liveness) else {
            return Ok(FirmwareOutcome::Unreachable);
        };
        let remote = String::from_utf8_lossy(&remote.body).trim().to_string();
        if remote.is_empty() {
            warn!("server version file is empty, skipping firmware update");
            return Ok(FirmwareOutcome::Unreachable);
        }
        let local = self.local_version()?;
        if remote == local {
            info!(version = %local, "firmware up to date");
            return Ok(FirmwareOutcome::UpToDate);
        }
        info!(
            from = %local,
            to = %remote,
            files = self.cfg.files.len(),
            "firmware update available"
        );

        fs::create_dir_all(&self.cfg.firmware_dir).with_context(|| {
            format!("failed to create {}", self.cfg.firmware_dir.display())
        })?;

        let mut failed = Vec::new();
        for name in &self.cfg.files {
            let dest = self.cfg.firmware_dir.join(name);
            let result = self
                .fetch_with_retries(name, liveness)
                .ok_or_else(|| anyhow!("download failed after retries"))
                .and_then(|f| install(&dest, &f));
            match result {
                Ok(()) => info!(file = %name, "firmware file installed"),
                Err(e) => {
                    error!(file = %name, error = format!("{e:#}"), "firmware file not installed");
                    failed.push(name.clone());
                }
            }
        }

        if !failed.is_empty() {
            warn!(
                version = %remote,
                failed = failed.len(),
                "firmware update incomplete, version not advanced"
            );
            return Ok(FirmwareOutcome::Incomplete {
                version: remote,
                failed,
            });
        }
        self.save_local_version(&remote)?;
        info!(version = %remote, "firmware update complete");
        Ok(FirmwareOutcome::Updated { version: remote })
    }

    fn remote_config_path(&self) -> String {
        format!("device_configs/{}_config.toml", self.device_id)
    }

    /// Replace the local config when the server's copy carries a different
    /// version marker. Takes effect on the next start.
    pub(crate) fn reconcile_config(&self, liveness: &LivenessWriter) -> Result<ConfigOutcome> {
        let path = self.remote_config_path();
        let Some(fetched) = self.fetch_with_retries(&path, liveness) else {
            return Ok(ConfigOutcome::Unreachable);
        };

        let remote_text = String::from_utf8_lossy(&fetched.body);
        let remote = extract_version(&remote_text).unwrap_or_else(|| NO_VERSION.to_string());
        let local = match fs::read_to_string(&self.config_path) {
            Ok(text) => extract_version(&text).unwrap_or_else(|| NO_VERSION.to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => NO_VERSION.to_string(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read {}", self.config_path.display())
                })
            }
        };

        if remote == local {
            info!(version = %local, "device config up to date");
            return Ok(ConfigOutcome::UpToDate);
        }
        if let Err(e) = config::parse(&remote_text) {
            error!(version = %remote, error = format!("{e:#}"), "downloaded config rejected");
            return Ok(ConfigOutcome::Rejected);
        }

        install(&self.config_path, &fetched)?;
        info!(from = %local, to = %remote, "device config replaced");
        Ok(ConfigOutcome::Replaced {
            from: local,
            to: remote,
        })
    }

    /// Config first, then firmware. Returns whether new firmware was
    /// installed. Failures are logged only.
    pub(crate) fn reconcile_all(&self, liveness: &LivenessWriter) -> bool {
        match self.reconcile_config(liveness) {
            Ok(ConfigOutcome::Replaced { from, to }) => {
                info!(%from, %to, "new device config takes effect after restart")
            }
            Ok(_) => {}
            Err(e) => error!(error = format!("{e:#}"), "config reconciliation failed"),
        }
        match self.reconcile_firmware(liveness) {
            Ok(FirmwareOutcome::Updated { .. }) => true,
            Ok(_) => false,
            Err(e) => {
                error!(error = format!("{e:#}"), "firmware reconciliation failed");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Files {
        bodies: HashMap<String, Vec<u8>>,
        /// Paths whose advertised length is wrong.
        bad_length: Vec<String>,
        calls: HashMap<String, u32>,
    }

    /// In-memory file server. Paths not present fail to fetch.
    #[derive(Clone, Default)]
    pub(crate) struct FakeSource(Arc<Mutex<Files>>);

    impl FakeSource {
        pub(crate) fn put(&self, path: &str, body: &[u8]) {
            self.0.lock().unwrap().bodies.insert(path.into(), body.to_vec());
        }

        pub(crate) fn remove(&self, path: &str) {
            self.0.lock().unwrap().bodies.remove(path);
        }

        pub(crate) fn lie_about_length(&self, path: &str) {
            self.0.lock().unwrap().bad_length.push(path.into());
        }

        pub(crate) fn calls(&self, path: &str) -> u32 {
            self.0.lock().unwrap().calls.get(path).copied().unwrap_or(0)
        }
    }

    impl RemoteSource for FakeSource {
        fn fetch(&self, path: &str) -> Result<Fetched> {
            let mut files = self.0.lock().unwrap();
            *files.calls.entry(path.into()).or_default() += 1;
            let body = files
                .bodies
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("404 {path}"))?;
            let len = body.len() as u64;
            let expected_len = if files.bad_length.iter().any(|p| p == path) {
                Some(len + 1)
            } else {
                Some(len)
            };
            Ok(Fetched { body, expected_len })
        }
    }
}
