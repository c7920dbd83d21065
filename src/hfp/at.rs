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

//! AT command/response text layer.

use crate::error::{Error, Result};

/// Speaker and microphone gains are reported on a 0..=15 scale.
pub const MAX_GAIN: u8 = 15;

/// One classified line received from the audio gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtLine {
    Ok,
    Error,
    CmeError(u32),
    Busy,
    NoAnswer,
    NoCarrier,
    Ring,
    /// `+BRSF: <features>`
    Brsf(u32),
    /// `+CIND: ("call",(0,1)),...`
    CindDefinition(Vec<String>),
    /// `+CIND: 0,0,3,...`
    CindValues(Vec<u8>),
    /// `+CIEV: <1-based index>,<value>`
    Ciev { index: usize, value: u8 },
    Clip {
        number: String,
        name: Option<String>,
    },
    Ccwa {
        number: String,
        name: Option<String>,
    },
    Clcc(CurrentCall),
    Cops(String),
    Vgs(u8),
    Vgm(u8),
    /// `+CHLD: (0,1,1x,2,2x,3,4)`
    Chld(Vec<String>),
    /// Codec proposal.
    Bcs(u8),
    Other(String),
}

/// One entry of a `+CLCC` listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CurrentCall {
    pub index: u8,
    pub incoming: bool,
    /// Raw `<stat>` code.
    pub status: u8,
    pub multiparty: bool,
    pub number: Option<String>,
}

impl AtLine {
    /// Classify a complete, trimmed line.
    pub fn parse(line: &str) -> Result<AtLine> {
        match line {
            "OK" => return Ok(AtLine::Ok),
            "ERROR" => return Ok(AtLine::Error),
            "BUSY" => return Ok(AtLine::Busy),
            "NO ANSWER" => return Ok(AtLine::NoAnswer),
            "NO CARRIER" => return Ok(AtLine::NoCarrier),
            "RING" => return Ok(AtLine::Ring),
            _ => {}
        }

        let Some((prefix, rest)) = line.split_once(':') else {
            return Ok(AtLine::Other(line.to_string()));
        };
        let rest = rest.trim();
        let malformed = || Error::Malformed(format!("AT line {:?}", line));

        let parsed = match prefix.trim() {
            "+CME ERROR" => AtLine::CmeError(rest.parse().map_err(|_| malformed())?),
            "+BRSF" => AtLine::Brsf(rest.parse().map_err(|_| malformed())?),
            "+CIND" if rest.contains('(') => AtLine::CindDefinition(quoted(rest)),
            "+CIND" => AtLine::CindValues(
                rest.split(',')
                    .map(|v| v.trim().parse::<u8>())
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|_| malformed())?,
            ),
            "+CIEV" => {
                let f = fields(rest);
                let index = f.first().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
                let value = f.get(1).and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
                AtLine::Ciev { index, value }
            }
            "+CLIP" => {
                let f = fields(rest);
                AtLine::Clip {
                    number: f.first().cloned().ok_or_else(malformed)?,
                    name: non_empty(f.get(4)),
                }
            }
            "+CCWA" => {
                let f = fields(rest);
                AtLine::Ccwa {
                    number: f.first().cloned().ok_or_else(malformed)?,
                    name: non_empty(f.get(3)),
                }
            }
            "+CLCC" => {
                let f = fields(rest);
                let num = |i: usize| f.get(i).and_then(|v| v.parse::<u8>().ok());
                AtLine::Clcc(CurrentCall {
                    index: num(0).ok_or_else(malformed)?,
                    incoming: num(1).ok_or_else(malformed)? == 1,
                    status: num(2).ok_or_else(malformed)?,
                    multiparty: num(4) == Some(1),
                    number: non_empty(f.get(5)),
                })
            }
            "+COPS" => AtLine::Cops(fields(rest).get(2).cloned().ok_or_else(malformed)?),
            "+VGS" => AtLine::Vgs(rest.parse().map_err(|_| malformed())?),
            "+VGM" => AtLine::Vgm(rest.parse().map_err(|_| malformed())?),
            "+CHLD" => AtLine::Chld(
                rest.trim_matches(|c| c == '(' || c == ')')
                    .split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect(),
            ),
            "+BCS" => AtLine::Bcs(rest.parse().map_err(|_| malformed())?),
            _ => AtLine::Other(line.to_string()),
        };
        Ok(parsed)
    }

    /// Final result code of a command, as `Ok(())` or the failure reason.
    pub fn terminal(&self) -> Option<std::result::Result<(), String>> {
        match self {
            AtLine::Ok => Some(Ok(())),
            AtLine::Error => Some(Err("ERROR".into())),
            AtLine::CmeError(code) => Some(Err(format!("+CME ERROR: {}", code))),
            AtLine::Busy => Some(Err("BUSY".into())),
            AtLine::NoAnswer => Some(Err("NO ANSWER".into())),
            _ => None,
        }
    }
}

/// Split on commas outside quotes; quotes are stripped.
fn fields(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in s.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => out.push(std::mem::take(&mut current).trim().to_string()),
            c => current.push(c),
        }
    }
    out.push(current.trim().to_string());
    out
}

/// All quoted strings in order.
fn quoted(s: &str) -> Vec<String> {
    s.split('"').skip(1).step_by(2).map(str::to_string).collect()
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.filter(|s| !s.is_empty()).cloned()
}

/// Accumulates received bytes and yields complete lines.
///
/// Both `\r\n` and bare `\r` or `\n` terminators are accepted; empty lines
/// are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                if !line.is_empty() {
                    lines.push(line);
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Bytes of an unterminated trailing line.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Keep only characters valid in a dial string.
pub fn sanitize_number(number: &str) -> String {
    number
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | '*' | '#'))
        .collect()
}

/// Validate a DTMF tone.
pub fn dtmf_tone(tone: char) -> Result<char> {
    let tone = tone.to_ascii_uppercase();
    if tone.is_ascii_digit() || matches!(tone, '*' | '#' | 'A'..='D') {
        Ok(tone)
    } else {
        Err(Error::InvalidArgument(format!("DTMF tone {:?}", tone)))
    }
}

pub fn clamp_gain(level: u8) -> u8 {
    level.min(MAX_GAIN)
}
