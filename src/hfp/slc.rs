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

//! Service level connection handshake.

use tracing::{debug, info, warn};

use super::at::AtLine;
use super::connection::ConnectionHandle;
use super::features::{AgFeatures, HfFeatures, CODECS};
use crate::error::{Error, Result};

/// Run the handshake to completion, one step at a time.
///
/// On success the actor is told to start its keepalive and emit
/// `Connected`. Any error from a step that is not explicitly optional is
/// returned as-is; the caller tears the connection down.
pub async fn establish(handle: &ConnectionHandle, features: HfFeatures) -> Result<AgFeatures> {
    let mac = handle.mac();

    let response = handle
        .command(format!("AT+BRSF={}", features.bits()))
        .await?;
    let ag = response
        .info
        .iter()
        .find_map(|line| match AtLine::parse(line) {
            Ok(AtLine::Brsf(bits)) => Some(AgFeatures::from_bits_retain(bits)),
            _ => None,
        })
        .ok_or_else(|| Error::Malformed(format!("+BRSF response from {}", mac)))?;
    debug!("[{}] AG features: {:?}", mac, ag);

    if features.contains(HfFeatures::CODEC_NEGOTIATION)
        && ag.contains(AgFeatures::CODEC_NEGOTIATION)
    {
        let codecs: Vec<String> = CODECS.iter().map(u8::to_string).collect();
        optional(mac, handle.command(format!("AT+BAC={}", codecs.join(","))).await);
    }

    handle.command("AT+CIND=?").await?;
    handle.command("AT+CIND?").await?;
    handle.command("AT+CMER=3,0,0,1").await?;

    if ag.contains(AgFeatures::THREE_WAY) {
        optional(mac, handle.command("AT+CHLD=?").await);
    }

    if ag.contains(AgFeatures::HF_INDICATORS) {
        let negotiated = handle.command("AT+BIND=1,2").await;
        if negotiated.is_ok() {
            optional(mac, handle.command("AT+BIND?").await);
        } else {
            optional(mac, negotiated);
        }
    }

    handle.command("AT+CLIP=1").await?;
    handle.command("AT+CCWA=1").await?;
    handle.command("AT+CMEE=1").await?;

    handle.command("AT+COPS=3,0").await?;
    handle.command("AT+COPS?").await?;

    handle.slc_established();
    info!("[{}] Handshake complete", mac);
    Ok(ag)
}

fn optional<T>(mac: &str, result: Result<T>) {
    if let Err(e) = result {
        warn!("[{}] Optional handshake step failed: {}", mac, e);
    }
}
