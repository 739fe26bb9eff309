//! Config file loading and state persistence.
//!
//! Two files are involved: a default config that is only ever read, and a
//! state config rewritten after every successful mutation so a restart
//! comes back with the last applied topology. The state file wins when
//! both exist.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::GlobalConfig;

/// Load the startup configuration.
///
/// Tries `state_path` first, then `default_path`. A missing or unreadable
/// file is logged and skipped; a present-but-invalid file is an error so a
/// corrupted state file does not silently boot an empty proxy.
pub fn load_startup_config(
    state_path: Option<&Path>,
    default_path: Option<&Path>,
) -> ConfigResult<Option<GlobalConfig>> {
    for path in [state_path, default_path].into_iter().flatten() {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file not readable, skipping");
                continue;
            }
        };

        let cfg: GlobalConfig =
            serde_json::from_str(&data).map_err(|e| ConfigError::ParseError {
                path: path.display().to_string(),
                source: e,
            })?;

        debug!(path = %path.display(), services = cfg.services.len(), "loaded config");
        return Ok(Some(cfg));
    }

    Ok(None)
}

/// Persist the live configuration to the state file.
///
/// Writes to a sibling temp file and renames it into place so readers never
/// observe a truncated state file.
pub fn write_state_config(path: &Path, cfg: &GlobalConfig) -> ConfigResult<()> {
    let data = serde_json::to_vec_pretty(cfg).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut tmp = PathBuf::from(path);
    tmp.set_extension("tmp");

    std::fs::write(&tmp, &data).map_err(|e| ConfigError::WriteError {
        path: tmp.display().to_string(),
        source: e,
    })?;

    std::fs::rename(&tmp, path).map_err(|e| ConfigError::WriteError {
        path: path.display().to_string(),
        source: e,
    })?;

    debug!(path = %path.display(), bytes = data.len(), "state config written");
    Ok(())
}
