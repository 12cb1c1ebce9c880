//! Persistence for the router's output list

use crate::error::Result;
use crate::output::OutputConfig;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

/// External preferences store; the router is its only writer
pub trait PreferencesStore: Send + Sync {
    fn get_router_outputs(&self) -> Result<Vec<OutputConfig>>;

    /// Replace the whole persisted list
    fn set_router_outputs(&self, outputs: &[OutputConfig]) -> Result<()>;
}

/// JSON array on disk, rewritten atomically (temp file + rename)
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferencesStore for JsonFileStore {
    /// A missing file is an empty list. Entries that don't parse are
    /// skipped so one bad record doesn't hide the rest.
    fn get_router_outputs(&self) -> Result<Vec<OutputConfig>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let raw: Vec<serde_json::Value> = serde_json::from_str(&contents)?;
        Ok(raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(config) => Some(config),
                Err(e) => {
                    log::warn!("Skipping malformed output entry in {:?}: {}", self.path, e);
                    None
                }
            })
            .collect())
    }

    fn set_router_outputs(&self, outputs: &[OutputConfig]) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(outputs)?)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!("Persisted {} output(s) to {:?}", outputs.len(), self.path);
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    outputs: Mutex<Vec<OutputConfig>>,
}

impl PreferencesStore for MemoryStore {
    fn get_router_outputs(&self) -> Result<Vec<OutputConfig>> {
        Ok(self.outputs.lock().clone())
    }

    fn set_router_outputs(&self, outputs: &[OutputConfig]) -> Result<()> {
        *self.outputs.lock() = outputs.to_vec();
        Ok(())
    }
}
