//! Ganesha configuration file
//!
//! Renders the default daemon configuration, applies targeted field updates
//! to an existing file and reads/writes `EXPORT` blocks.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Log destination used when this process is the container's init child.
pub const INIT_LOG_PATH: &str = "/proc/1/fd/1";

/// Log destination otherwise.
pub const FILE_LOG_PATH: &str = "/tmp/ganesha.log";

const DEFAULT_CONFIG_TEMPLATE: &str = r#"
NFS_Core_Param
{
    NLM_Port = 0;
    MNT_Port = 0;
    RQUOTA_Port = 0;
    Enable_NLM = false;
    Enable_RQUOTA = false;
    Enable_UDP = false;
    fsid_device = false;
    Protocols = 4;
}

LOG {
    Default_Log_Level = INFO;

    Facility {
        name = FILE;
        destination = "{{LOG_PATH}}";
        enable = active;
    }
}

NFSV4
{
    Lease_Lifetime = {{LEASE_LIFETIME}};
    Grace_Period = {{GRACE_PERIOD}};
    Minor_Versions = 1, 2;
    RecoveryBackend = longhorn;
    Only_Numeric_Owners = true;
}

Export_defaults
{
    Protocols = 4;
    Transports = TCP;
    Access_Type = None;
    SecType = sys;
    Squash = None;
}

# Pseudo export, ganesha will automatically create one
# if one is not present
#EXPORT
#{
#    Export_Id = 0;
#    Path = /export;
#    Pseudo = /;
#    FSAL { Name = VFS; }
#}
"#;

/// Pick the log destination from the parent process id.
pub fn log_path_for_parent(ppid: u32) -> &'static str {
    if ppid == 1 {
        INIT_LOG_PATH
    } else {
        FILE_LOG_PATH
    }
}

/// Render the default configuration.
pub fn render_default_config(log_path: &str, lease_lifetime: u32, grace_period: u32) -> String {
    DEFAULT_CONFIG_TEMPLATE
        .replace("{{LOG_PATH}}", log_path)
        .replace("{{LEASE_LIFETIME}}", &lease_lifetime.to_string())
        .replace("{{GRACE_PERIOD}}", &grace_period.to_string())
}

/// Replace the value of every active `key = ...;` line.
///
/// Returns the updated text and whether any line matched. Commented lines
/// are left alone.
pub fn set_field(config: &str, key: &str, value: &str) -> (String, bool) {
    let mut found = false;
    let mut out = String::with_capacity(config.len());
    for line in config.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let matches = !trimmed.starts_with('#')
            && trimmed
                .split_once('=')
                .map(|(k, _)| k.trim() == key)
                .unwrap_or(false);
        if matches {
            found = true;
            let indent = &line[..line.len() - trimmed.len()];
            out.push_str(&format!("{}{} = {};", indent, key, value));
            if line.ends_with('\n') {
                out.push('\n');
            }
        } else {
            out.push_str(line);
        }
    }
    (out, found)
}

// =============================================================================
// Export Blocks
// =============================================================================

/// One `EXPORT { ... }` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBlock {
    pub export_id: u16,
    pub path: PathBuf,
    pub volume: String,
}

impl ExportBlock {
    pub fn new(export_id: u16, path: impl Into<PathBuf>, volume: impl Into<String>) -> Self {
        Self {
            export_id,
            path: path.into(),
            volume: volume.into(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "\nEXPORT\n{{\n    Export_Id = {};\n    Path = {};\n    Pseudo = /{};\n    Protocols = 4;\n    Transports = TCP;\n    Access_Type = RW;\n    Squash = No_root_squash;\n    SecType = sys;\n    FSAL {{ Name = VFS; }}\n}}\n",
            self.export_id,
            self.path.display(),
            self.volume
        )
    }
}

/// Byte ranges of active `EXPORT` blocks, including the leading blank line.
fn export_block_spans(config: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut offset = 0;
    let mut start: Option<usize> = None;
    let mut depth = 0usize;
    let mut prev_blank_start: Option<usize> = None;

    for line in config.split_inclusive('\n') {
        let trimmed = line.trim();
        match start {
            None => {
                if trimmed == "EXPORT" {
                    start = Some(prev_blank_start.unwrap_or(offset));
                    depth = 0;
                } else if trimmed.is_empty() {
                    prev_blank_start.get_or_insert(offset);
                } else {
                    prev_blank_start = None;
                }
            }
            Some(s) => {
                if !trimmed.starts_with('#') {
                    depth += trimmed.matches('{').count();
                    depth = depth.saturating_sub(trimmed.matches('}').count());
                    if depth == 0 && trimmed.contains('}') {
                        spans.push((s, offset + line.len()));
                        start = None;
                        prev_blank_start = None;
                    }
                }
            }
        }
        offset += line.len();
    }
    spans
}

fn block_value<'a>(block: &'a str, key: &str) -> Option<&'a str> {
    block.lines().find_map(|line| {
        let (k, v) = line.trim().split_once('=')?;
        if k.trim() == key {
            Some(v.trim().trim_end_matches(';').trim())
        } else {
            None
        }
    })
}

/// Parse the active export blocks of a configuration.
pub fn parse_export_blocks(config: &str) -> Vec<ExportBlock> {
    export_block_spans(config)
        .into_iter()
        .filter_map(|(s, e)| {
            let block = &config[s..e];
            let export_id = block_value(block, "Export_Id")?.parse().ok()?;
            let path = block_value(block, "Path")?;
            let volume = block_value(block, "Pseudo")?.trim_start_matches('/');
            Some(ExportBlock::new(export_id, path, volume))
        })
        .collect()
}

/// Remove the export block for `volume`. Returns whether one was removed.
pub fn remove_export_block(config: &str, volume: &str) -> (String, bool) {
    for (s, e) in export_block_spans(config) {
        let block = &config[s..e];
        let pseudo = block_value(block, "Pseudo").map(|p| p.trim_start_matches('/'));
        if pseudo == Some(volume) {
            let mut out = String::with_capacity(config.len());
            out.push_str(&config[..s]);
            out.push_str(&config[e..]);
            return (out, true);
        }
    }
    (config.to_string(), false)
}

/// Write `contents` to `path` through a temporary file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = (|| {
        let mut file = options.open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}
