//! Per-device prepaid target persistence. One small JSON file per device,
//! `targets/target_<address>.json` holding `{"<address>": <litres>}`, so a
//! torn write can only ever affect a single meter.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub(crate) struct DeviceStore {
    dir: PathBuf,
}

impl DeviceStore {
    /// Open (creating if needed) the target directory under `state_dir`.
    pub(crate) fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("targets");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create target dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn record_path(&self, address: u8) -> PathBuf {
        self.dir.join(format!("target_{address}.json"))
    }

    /// Stored target for `address`, or `None` if the device has never been
    /// seeded. A record that exists but cannot be read or parsed is an error.
    pub(crate) fn load(&self, address: u8) -> Result<Option<u32>> {
        let path = self.record_path(address);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let record: HashMap<String, u32> = serde_json::from_str(&contents)
            .with_context(|| format!("corrupt target record {}", path.display()))?;
        Ok(record.get(&address.to_string()).copied())
    }

    /// Persist `litres` as the target for `address`. Written to a temp file,
    /// synced, then renamed over the record.
    pub(crate) fn save(&self, address: u8, litres: u32) -> Result<()> {
        let path = self.record_path(address);
        let tmp = self.dir.join(format!(".target_{address}.json.tmp"));
        let record = HashMap::from([(address.to_string(), litres)]);
        let body = serde_json::to_vec(&record)?;

        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        f.write_all(&body)?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;

        tracing::debug!(address, litres, "target saved");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
