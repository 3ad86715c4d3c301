//! Optional defaults read from `firebak.json` (nearest ancestor of the working
//! directory) and `~/.firebak/config.json`. Flags and environment variables
//! win over both; the local file wins over the global one.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ui::{print_command_status, CommandStatus};

const LOCAL_CONFIG_FILE: &str = "firebak.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub firebase: Option<String>,
    pub destination: Option<PathBuf>,
    pub source: Option<PathBuf>,
    pub marker: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Config {
    /// Fills every unset field from `fallback`.
    pub fn or(self, fallback: Config) -> Config {
        Config {
            firebase: self.firebase.or(fallback.firebase),
            destination: self.destination.or(fallback.destination),
            source: self.source.or(fallback.source),
            marker: self.marker.or(fallback.marker),
            extra: serde_json::Map::new(),
        }
    }
}

pub fn global_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(home.join(".firebak").join("config.json"))
}

/// Nearest `firebak.json` at or above the working directory.
pub fn local_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_upwards(&cwd, LOCAL_CONFIG_FILE)
}

fn find_upwards(start: &Path, name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

pub fn load_file(path: &Path) -> Config {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    let config: Config = match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("could not parse {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("unknown config key {} in {}", key, path.display()),
        );
    }

    tracing::debug!(path = %path.display(), "loaded config");
    config
}

/// Local config layered over global config.
pub fn load() -> Config {
    let local = local_path().map(|p| load_file(&p)).unwrap_or_default();
    let global = global_path()
        .map(|p| load_file(&p))
        .unwrap_or_default();
    local.or(global)
}
