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

//! Hands-free profile registration and channel accept loop.

use std::sync::Arc;

use bluer::rfcomm::{Profile, ProfileHandle, Role};
use bluer::Session;
use futures::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use super::engine::HfpEngine;
use super::features::SdpFeatures;
use crate::config::HfpConfig;
use crate::error::{BusErrorKind, Result};

/// Hands-Free unit service class.
pub const HFP_HF_UUID: Uuid = Uuid::from_u128(0x0000111e_0000_1000_8000_00805f9b34fb);

fn profile(config: &HfpConfig) -> Profile {
    Profile {
        uuid: HFP_HF_UUID,
        name: Some("Hands-Free".to_string()),
        role: Some(Role::Client),
        version: Some(config.profile_version),
        features: Some(SdpFeatures::supported().bits()),
        ..Default::default()
    }
}

/// Register the hands-free client role, retrying once if a registration
/// with the same UUID is still present.
pub async fn register(session: &Session, config: &HfpConfig) -> Result<ProfileHandle> {
    match session.register_profile(profile(config)).await {
        Ok(handle) => Ok(handle),
        Err(e) => {
            let e = crate::error::Error::from(e);
            if e.bus_kind() != Some(BusErrorKind::AlreadyExists) {
                return Err(e);
            }
            warn!("Hands-free profile already registered, retrying once");
            Ok(session.register_profile(profile(config)).await?)
        }
    }
}

/// Hand every accepted channel to the engine until the profile is released.
pub async fn serve(session: &Session, engine: Arc<HfpEngine>) -> Result<()> {
    let mut handle = register(session, engine.config()).await?;
    info!(
        "Hands-free profile registered (version {:#06x})",
        engine.config().profile_version
    );

    while let Some(request) = handle.next().await {
        let mac = request.device().to_string();
        match request.accept() {
            Ok(stream) => {
                if let Err(e) = engine.attach(&mac, stream) {
                    warn!("Rejected hands-free channel from {}: {}", mac, e);
                }
            }
            Err(e) => warn!("Failed to accept hands-free channel from {}: {}", mac, e),
        }
    }

    info!("Hands-free profile released");
    Ok(())
}
