//! Gateway settings.
//!
//! Settings are read from `.cog/settings.json` in the project directory,
//! layered over `~/.config/cog/settings.json`. Project values win per field.
//! The debug subsystem consumes a single key: `debug.timeout` (milliseconds).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    debug: DebugSection,
}

#[derive(Debug, Default, Deserialize)]
struct DebugSection {
    timeout: Option<u64>,
}

/// Effective gateway configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bound on every individual backend round-trip.
    pub timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl Settings {
    /// Load settings for a project directory, falling back to the global file
    /// and then to defaults. Unreadable or malformed files are skipped with a
    /// warning, they never abort gateway startup.
    pub fn load(project_dir: &Path) -> Settings {
        let global = home::home_dir()
            .map(|h| h.join(".config").join("cog").join("settings.json"))
            .and_then(|p| read_settings(&p));
        let project = read_settings(&project_dir.join(".cog").join("settings.json"));

        Self::layer(global, project)
    }

    fn layer(global: Option<SettingsFile>, project: Option<SettingsFile>) -> Settings {
        let mut timeout_ms = DEFAULT_TIMEOUT_MS;
        for file in [global, project].into_iter().flatten() {
            if let Some(t) = file.debug.timeout {
                timeout_ms = t;
            }
        }
        Settings {
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

fn read_settings(path: &PathBuf) -> Option<SettingsFile> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(s) => Some(s),
        Err(e) => {
            log::warn!(target: "gateway", "skip malformed settings file {}: {e}", path.display());
            None
        }
    }
}
