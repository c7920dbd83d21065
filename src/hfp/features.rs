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

//! Hands-free feature bitmasks.

use bitflags::bitflags;

bitflags! {
    /// Features this hands-free unit announces with `AT+BRSF`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HfFeatures: u32 {
        const EC_NR = 1 << 0;
        const THREE_WAY = 1 << 1;
        const CLI = 1 << 2;
        const VOICE_RECOGNITION = 1 << 3;
        const REMOTE_VOLUME = 1 << 4;
        const ENHANCED_CALL_STATUS = 1 << 5;
        const ENHANCED_CALL_CONTROL = 1 << 6;
        const CODEC_NEGOTIATION = 1 << 7;
        const HF_INDICATORS = 1 << 8;
        const ESCO_S4 = 1 << 9;
    }
}

bitflags! {
    /// Features reported by the audio gateway in `+BRSF`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AgFeatures: u32 {
        const THREE_WAY = 1 << 0;
        const EC_NR = 1 << 1;
        const VOICE_RECOGNITION = 1 << 2;
        const INBAND_RING = 1 << 3;
        const VOICE_TAG = 1 << 4;
        const REJECT_CALL = 1 << 5;
        const ENHANCED_CALL_STATUS = 1 << 6;
        const ENHANCED_CALL_CONTROL = 1 << 7;
        const EXTENDED_ERROR = 1 << 8;
        const CODEC_NEGOTIATION = 1 << 9;
        const HF_INDICATORS = 1 << 10;
        const ESCO_S4 = 1 << 11;
    }
}

bitflags! {
    /// Feature word of the SDP record (subset of the BRSF layout).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdpFeatures: u16 {
        const EC_NR = 1 << 0;
        const THREE_WAY = 1 << 1;
        const CLI = 1 << 2;
        const VOICE_RECOGNITION = 1 << 3;
        const REMOTE_VOLUME = 1 << 4;
        const WIDE_BAND = 1 << 5;
    }
}

impl HfFeatures {
    pub fn supported() -> Self {
        HfFeatures::EC_NR
            | HfFeatures::THREE_WAY
            | HfFeatures::CLI
            | HfFeatures::REMOTE_VOLUME
            | HfFeatures::ENHANCED_CALL_STATUS
            | HfFeatures::CODEC_NEGOTIATION
    }
}

impl SdpFeatures {
    pub fn supported() -> Self {
        SdpFeatures::EC_NR
            | SdpFeatures::THREE_WAY
            | SdpFeatures::CLI
            | SdpFeatures::REMOTE_VOLUME
            | SdpFeatures::WIDE_BAND
    }
}

/// Codec ids offered with `AT+BAC`: CVSD and mSBC.
pub const CODECS: &[u8] = &[1, 2];
