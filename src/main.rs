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

//! bluetel daemon: runs the device manager and the hands-free engine and
//! prints every event as one JSON line on stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use bluetel::bluetooth::{BluezBus, DeviceManager};
use bluetel::config::Config;
use bluetel::hfp::{profile, HfpEngine};
use bluetel::logging;

fn print_event<E: Serialize>(event: &E) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to serialize event: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    logging::init(&config.logging)?;

    info!("Starting bluetel v{}", env!("CARGO_PKG_VERSION"));

    let bus = Arc::new(
        BluezBus::new(config.adapter.name.as_deref())
            .await
            .context("Failed to open BlueZ session")?,
    );
    let manager = DeviceManager::start(bus.clone(), &config.adapter, &config.gatt)
        .await
        .context("Failed to start device manager")?;

    let mut device_events = manager.subscribe();
    tokio::spawn(async move {
        while let Some(event) = device_events.recv().await {
            print_event(&event);
        }
    });
    for record in manager.devices() {
        info!("Known device {} ({:?})", record.mac, record.name);
    }

    let engine = HfpEngine::new(config.hfp.clone(), Some(manager.registry()));
    if config.hfp.enabled {
        let mut hfp_events = engine.subscribe();
        tokio::spawn(async move {
            while let Some(event) = hfp_events.recv().await {
                print_event(&event);
            }
        });

        let serving_bus = bus.clone();
        let serving_engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = profile::serve(serving_bus.session(), serving_engine).await {
                error!("Hands-free profile failed: {}", e);
            }
        });
    } else {
        info!("Hands-free engine disabled");
    }

    if let Err(e) = manager
        .start_discovery(config.adapter.discovery_transport)
        .await
    {
        warn!("Failed to start discovery: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Shutting down");

    engine.shutdown();
    if let Err(e) = manager.stop_discovery().await {
        warn!("Failed to stop discovery: {}", e);
    }
    manager.shutdown();
    Ok(())
}
