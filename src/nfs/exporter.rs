//! Export table
//!
//! Maps volume names to Ganesha export ids and persists one `EXPORT` block
//! per volume into the daemon configuration.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{info, warn};

use super::config::{parse_export_blocks, remove_export_block, write_atomic, ExportBlock};
use crate::error::{Error, Result};

/// Volume name to export id table backed by the config file.
#[derive(Debug)]
pub struct Exporter {
    config_path: PathBuf,
    export_root: PathBuf,
    exports: RwLock<HashMap<String, u16>>,
}

impl Exporter {
    /// Load the exports already present in the config file.
    pub fn load(config_path: impl Into<PathBuf>, export_root: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let config = fs::read_to_string(&config_path)?;
        let exports = parse_export_blocks(&config)
            .into_iter()
            .map(|block| (block.volume, block.export_id))
            .collect();

        Ok(Self {
            config_path,
            export_root: export_root.into(),
            exports: RwLock::new(exports),
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Export id of `volume`, 0 when it is not exported.
    pub fn get_export(&self, volume: &str) -> u16 {
        self.exports.read().get(volume).copied().unwrap_or(0)
    }

    /// All exports, sorted by volume name.
    pub fn list_exports(&self) -> Vec<(String, u16)> {
        let mut exports: Vec<_> = self
            .exports
            .read()
            .iter()
            .map(|(volume, id)| (volume.clone(), *id))
            .collect();
        exports.sort();
        exports
    }

    /// Add an export for `volume` and return its id.
    ///
    /// An existing export is returned unchanged. A failed config write leaves
    /// the table as it was.
    pub fn create_export(&self, volume: &str) -> Result<u16> {
        let mut exports = self.exports.write();
        if let Some(id) = exports.get(volume) {
            return Ok(*id);
        }

        let export_id = next_export_id(exports.values().copied()).ok_or_else(|| Error::Export {
            volume: volume.to_string(),
            reason: "no free export id".to_string(),
        })?;
        exports.insert(volume.to_string(), export_id);

        let block = ExportBlock::new(export_id, self.export_root.join(volume), volume);
        if let Err(e) = self.append_block(&block) {
            exports.remove(volume);
            warn!(volume = %volume, export_id, "Rolled back export after config write failure");
            return Err(Error::Export {
                volume: volume.to_string(),
                reason: e.to_string(),
            });
        }

        info!(volume = %volume, export_id, "Created export");
        Ok(export_id)
    }

    /// Remove the export for `volume` and return its former id, 0 if none.
    pub fn delete_export(&self, volume: &str) -> Result<u16> {
        let mut exports = self.exports.write();
        let export_id = match exports.get(volume) {
            Some(id) => *id,
            None => return Ok(0),
        };

        let config = fs::read_to_string(&self.config_path)?;
        let (updated, removed) = remove_export_block(&config, volume);
        if removed {
            write_atomic(&self.config_path, &updated).map_err(|e| Error::Export {
                volume: volume.to_string(),
                reason: e.to_string(),
            })?;
        }
        exports.remove(volume);

        info!(volume = %volume, export_id, "Deleted export");
        Ok(export_id)
    }

    fn append_block(&self, block: &ExportBlock) -> Result<()> {
        let mut config = fs::read_to_string(&self.config_path)?;
        config.push_str(&block.render());
        write_atomic(&self.config_path, &config)
    }
}

/// Smallest positive id not in use.
fn next_export_id(used: impl Iterator<Item = u16>) -> Option<u16> {
    let mut used: Vec<u16> = used.collect();
    used.sort_unstable();
    let mut candidate: u16 = 1;
    for id in used {
        if id == candidate {
            candidate = candidate.checked_add(1)?;
        } else if id > candidate {
            break;
        }
    }
    Some(candidate)
}
