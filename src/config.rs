// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so partial files are
//! fine and a missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bluetooth::Transport;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub adapter: AdapterConfig,
    pub gatt: GattConfig,
    pub hfp: HfpConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Adapter name (e.g. `hci0`); the default adapter when unset.
    pub name: Option<String>,
    /// Visible alias applied at startup.
    pub alias: Option<String>,
    /// Delay after powering the adapter on.
    pub power_on_settle_ms: u64,
    pub discovery_transport: Transport,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: None,
            alias: None,
            power_on_settle_ms: 500,
            discovery_transport: Transport::Auto,
        }
    }
}

impl AdapterConfig {
    pub fn power_on_settle(&self) -> Duration {
        Duration::from_millis(self.power_on_settle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    /// Upper bound on waiting for a device's services to resolve.
    pub services_resolved_timeout_secs: u64,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            services_resolved_timeout_secs: 30,
        }
    }
}

impl GattConfig {
    pub fn services_resolved_timeout(&self) -> Duration {
        Duration::from_secs(self.services_resolved_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HfpConfig {
    pub enabled: bool,
    /// Keepalive poll period once the service level connection is up.
    pub keepalive_secs: u64,
    /// Per-command response timeout.
    pub command_timeout_secs: u64,
    /// Advertised profile version (0x0107 = HFP 1.7).
    pub profile_version: u16,
}

impl Default for HfpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keepalive_secs: 20,
            command_timeout_secs: 5,
            profile_version: 0x0107,
        }
    }
}

impl HfpConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub level: String,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl Config {
    /// Default location: `<config dir>/bluetel/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("bluetel").join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => {
                    debug!("No config directory available, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            debug!("Config file {:?} doesn't exist, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }
}
