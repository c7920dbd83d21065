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

//! I/O-free protocol state of one hands-free connection.
//!
//! The connection actor feeds received bytes, queued commands and timer
//! expiries in; the session hands back bytes to write and events to emit.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::at::{AtLine, LineBuffer};
use super::features::AgFeatures;
use super::indicators::{is_call_indicator, CallState, Indicators};
use super::queue::{CommandQueue, PendingCommand};
use crate::events::{GainKind, HfpEvent};

/// Work produced by one session step.
#[derive(Debug, Default, PartialEq)]
pub struct Outputs {
    pub writes: Vec<String>,
    pub events: Vec<HfpEvent>,
}

pub struct Session {
    mac: String,
    buffer: LineBuffer,
    indicators: Indicators,
    queue: CommandQueue,
    ag_features: AgFeatures,
    call_state: CallState,
    command_timeout: Duration,
}

impl Session {
    pub fn new(mac: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            mac: mac.into(),
            buffer: LineBuffer::new(),
            indicators: Indicators::new(),
            queue: CommandQueue::new(),
            ag_features: AgFeatures::empty(),
            call_state: CallState::Idle,
            command_timeout,
        }
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn ag_features(&self) -> AgFeatures {
        self.ag_features
    }

    pub fn call_state(&self) -> CallState {
        self.call_state
    }

    pub fn indicators(&self) -> &Indicators {
        &self.indicators
    }

    /// Deadline of the in-flight command.
    pub fn deadline(&self) -> Option<Instant> {
        self.queue.deadline()
    }

    pub fn enqueue(&mut self, command: PendingCommand, now: Instant) -> Outputs {
        debug!("[{}] queue {}", self.mac, command.line());
        self.queue.push(command);
        let mut out = Outputs::default();
        self.pump(now, &mut out);
        out
    }

    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Outputs {
        let mut out = Outputs::default();
        for line in self.buffer.push(bytes) {
            debug!("[{}] <- {}", self.mac, line);
            self.handle_line(&line, &mut out);
            // Advance per line so the next line is correlated with the new head.
            self.pump(now, &mut out);
        }
        out
    }

    pub fn expire(&mut self, now: Instant) -> Outputs {
        let mut out = Outputs::default();
        if self.queue.expire(now) {
            self.pump(now, &mut out);
        }
        out
    }

    /// Reject every queued command with `ConnectionClosed`.
    pub fn close(&mut self) {
        self.queue.close();
    }

    fn pump(&mut self, now: Instant, out: &mut Outputs) {
        if let Some(wire) = self.queue.next_to_send(now, self.command_timeout) {
            debug!("[{}] -> {}", self.mac, wire.trim_end());
            out.writes.push(wire);
        }
    }

    fn handle_line(&mut self, line: &str, out: &mut Outputs) {
        let parsed = match AtLine::parse(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("[{}] Ignoring {}", self.mac, e);
                return;
            }
        };

        if let Some(result) = parsed.terminal() {
            self.queue.on_terminal(result);
            return;
        }

        match parsed {
            AtLine::Brsf(bits) => {
                self.ag_features = AgFeatures::from_bits_retain(bits);
                out.events.push(HfpEvent::AgFeatures {
                    mac: self.mac.clone(),
                    features: bits,
                });
            }
            AtLine::CindDefinition(names) => {
                debug!("[{}] Indicators: {:?}", self.mac, names);
                self.indicators.define(names);
            }
            AtLine::CindValues(values) => {
                if !self.indicators.is_defined() {
                    warn!("[{}] Indicator values before definitions", self.mac);
                } else {
                    let changed = self.indicators.set_all(&values);
                    self.indicators_changed(changed, out);
                }
            }
            AtLine::Ciev { index, value } => match self.indicators.set(index, value) {
                Some((name, true)) => self.indicators_changed(vec![(name, value)], out),
                Some((_, false)) => {}
                None => warn!("[{}] Unknown indicator index {}", self.mac, index),
            },
            AtLine::Clip { number, name } => {
                out.events.push(self.call_event(CallState::Incoming, Some(number), name));
            }
            AtLine::Ccwa { number, name } => {
                out.events.push(self.call_event(CallState::Waiting, Some(number), name));
            }
            AtLine::Ring => out.events.push(self.call_event(CallState::Ringing, None, None)),
            AtLine::NoCarrier => out.events.push(self.call_event(CallState::Idle, None, None)),
            AtLine::Clcc(call) => match CallState::from_clcc(call.status) {
                Some(state) => out.events.push(self.call_event(state, call.number, None)),
                None => warn!("[{}] Unknown call status {}", self.mac, call.status),
            },
            AtLine::Cops(name) => out.events.push(HfpEvent::OperatorName {
                mac: self.mac.clone(),
                name,
            }),
            AtLine::Vgs(level) => out.events.push(self.volume(GainKind::Speaker, level)),
            AtLine::Vgm(level) => out.events.push(self.volume(GainKind::Microphone, level)),
            AtLine::Chld(modes) => out.events.push(HfpEvent::HoldModes {
                mac: self.mac.clone(),
                modes,
            }),
            AtLine::Bcs(codec) => {
                // Confirmed ahead of anything not yet sent, never interleaved with the head.
                debug!("[{}] AG proposes codec {}", self.mac, codec);
                self.queue
                    .push_front(PendingCommand::new(format!("AT+BCS={}", codec), None));
            }
            AtLine::Other(_) => debug!("[{}] Unhandled line: {}", self.mac, line),
            AtLine::Ok
            | AtLine::Error
            | AtLine::CmeError(_)
            | AtLine::Busy
            | AtLine::NoAnswer => {}
        }

        self.queue.on_info(line);
    }

    fn indicators_changed(&mut self, changed: Vec<(String, u8)>, out: &mut Outputs) {
        let mut rederive = false;
        for (name, value) in changed {
            match name.as_str() {
                "battchg" => out.events.push(HfpEvent::BatteryLevel {
                    mac: self.mac.clone(),
                    level: value,
                }),
                "signal" => out.events.push(HfpEvent::SignalStrength {
                    mac: self.mac.clone(),
                    level: value,
                }),
                _ => {}
            }
            rederive |= is_call_indicator(&name);
            out.events.push(HfpEvent::Indicator {
                mac: self.mac.clone(),
                name,
                value,
            });
        }

        if rederive {
            let state = self.indicators.call_state();
            if state != self.call_state {
                self.call_state = state;
                out.events.push(self.call_event(state, None, None));
            }
        }
    }

    fn call_event(&self, state: CallState, number: Option<String>, name: Option<String>) -> HfpEvent {
        HfpEvent::CallState {
            mac: self.mac.clone(),
            state,
            number,
            name,
        }
    }

    fn volume(&self, kind: GainKind, level: u8) -> HfpEvent {
        HfpEvent::Volume {
            mac: self.mac.clone(),
            kind,
            level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::hfp::queue::CommandResponse;
    use tokio::sync::oneshot;

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    fn session() -> Session {
        Session::new(MAC, Duration::from_secs(5))
    }

    fn queue(
        session: &mut Session,
        line: &str,
        now: Instant,
    ) -> (Outputs, oneshot::Receiver<Result<CommandResponse>>) {
        let (tx, rx) = oneshot::channel();
        (session.enqueue(PendingCommand::new(line, Some(tx)), now), rx)
    }

    #[test]
    fn test_slc_prefix_completes_in_order() {
        let now = Instant::now();
        let mut s = session();
        let (out, mut brsf) = queue(&mut s, "AT+BRSF=183", now);
        assert_eq!(out.writes, vec!["AT+BRSF=183\r"]);
        let (out, mut def) = queue(&mut s, "AT+CIND=?", now);
        assert!(out.writes.is_empty());
        let (_, mut vals) = queue(&mut s, "AT+CIND?", now);

        let out = s.feed(
            b"\r\n+BRSF: 4095\r\n\r\n+CIND: (\"call\",(0,1)),(\"callsetup\",(0-3))\r\n\r\n+CIND: 0,0\r\n\r\nOK\r\n",
            now,
        );

        assert_eq!(out.writes, vec!["AT+CIND=?\r", "AT+CIND?\r"]);
        assert!(brsf.try_recv().unwrap().is_ok());
        assert!(def.try_recv().unwrap().is_ok());
        assert!(vals.try_recv().unwrap().is_ok());
        assert_eq!(s.call_state(), CallState::Idle);
        assert_eq!(s.ag_features(), AgFeatures::from_bits_retain(4095));
        assert!(out.events.contains(&HfpEvent::AgFeatures {
            mac: MAC.into(),
            features: 4095
        }));
    }

    #[test]
    fn test_shared_ok_does_not_swallow_later_replies() {
        let now = Instant::now();
        let mut s = session();
        let (_, mut brsf) = queue(&mut s, "AT+BRSF=183", now);
        let (_, mut def) = queue(&mut s, "AT+CIND=?", now);
        let (_, mut vals) = queue(&mut s, "AT+CIND?", now);

        // One OK for three early-completed commands.
        s.feed(
            b"+BRSF: 4095\r\n+CIND: (\"call\",(0,1)),(\"callsetup\",(0-3))\r\n+CIND: 0,0\r\nOK\r\n",
            now,
        );
        assert!(brsf.try_recv().unwrap().is_ok());
        assert!(def.try_recv().unwrap().is_ok());
        assert!(vals.try_recv().unwrap().is_ok());

        let (out, mut ata) = queue(&mut s, "ATA", now);
        assert_eq!(out.writes, vec!["ATA\r"]);
        s.feed(b"OK\r\n", now);
        assert!(ata.try_recv().unwrap().is_ok());

        let (out, mut cmer) = queue(&mut s, "AT+CMER=3,0,0,1", now);
        assert_eq!(out.writes, vec!["AT+CMER=3,0,0,1\r"]);
        s.feed(b"ERROR\r\n", now);
        assert!(cmer.try_recv().unwrap().is_err());
        assert!(s.deadline().is_none());
    }

    #[test]
    fn test_indicator_values_battery() {
        let now = Instant::now();
        let mut s = session();
        let out = s.feed(
            b"+CIND: (\"call\",(0,1)),(\"callsetup\",(0-3)),(\"battchg\",(0-5))\r\n+CIND: 0,0,3\r\n",
            now,
        );

        assert_eq!(s.indicators().get("call"), Some(0));
        assert_eq!(s.indicators().get("callsetup"), Some(0));
        assert_eq!(s.indicators().get("battchg"), Some(3));
        assert_eq!(s.indicators().values().len(), 3);
        assert!(out.events.contains(&HfpEvent::BatteryLevel {
            mac: MAC.into(),
            level: 3
        }));
    }

    #[test]
    fn test_ciev_drives_call_state() {
        let now = Instant::now();
        let mut s = session();
        s.feed(
            b"+CIND: (\"service\",(0,1)),(\"call\",(0,1)),(\"callsetup\",(0-3)),(\"callheld\",(0-2))\r\n+CIND: 1,0,0,0\r\n",
            now,
        );

        let out = s.feed(b"+CIEV: 3,1\r\nRING\r\n+CLIP: \"5551234\",129\r\n", now);
        assert_eq!(
            out.events,
            vec![
                HfpEvent::Indicator {
                    mac: MAC.into(),
                    name: "callsetup".into(),
                    value: 1
                },
                HfpEvent::CallState {
                    mac: MAC.into(),
                    state: CallState::Incoming,
                    number: None,
                    name: None
                },
                HfpEvent::CallState {
                    mac: MAC.into(),
                    state: CallState::Ringing,
                    number: None,
                    name: None
                },
                HfpEvent::CallState {
                    mac: MAC.into(),
                    state: CallState::Incoming,
                    number: Some("5551234".into()),
                    name: None
                },
            ]
        );

        let out = s.feed(b"+CIEV: 2,1\r\n+CIEV: 3,0\r\n", now);
        assert_eq!(s.call_state(), CallState::Active);
        assert_eq!(
            out.events
                .iter()
                .filter(|e| matches!(e, HfpEvent::CallState { .. }))
                .count(),
            1
        );

        // Unknown index is ignored.
        assert!(s.feed(b"+CIEV: 9,1\r\n", now).events.is_empty());
    }

    #[test]
    fn test_codec_confirmation_waits_for_head() {
        let now = Instant::now();
        let mut s = session();
        let (_, _clcc) = queue(&mut s, "AT+CLCC", now);
        let (_, _vgs) = queue(&mut s, "AT+VGS=9", now);

        let out = s.feed(b"+BCS: 2\r\n", now);
        assert!(out.writes.is_empty());

        let out = s.feed(b"OK\r\n", now);
        assert_eq!(out.writes, vec!["AT+BCS=2\r"]);
        let out = s.feed(b"OK\r\n", now);
        assert_eq!(out.writes, vec!["AT+VGS=9\r"]);
    }

    #[test]
    fn test_timeout_advances_queue() {
        let now = Instant::now();
        let mut s = session();
        let (_, mut first) = queue(&mut s, "AT+COPS?", now);
        let (_, mut second) = queue(&mut s, "AT+CMEE=1", now);

        assert!(s.expire(now + Duration::from_secs(1)).writes.is_empty());
        let out = s.expire(now + Duration::from_secs(5));
        assert_eq!(out.writes, vec!["AT+CMEE=1\r"]);
        assert!(matches!(first.try_recv().unwrap(), Err(crate::error::Error::Timeout(_))));

        s.close();
        assert!(matches!(
            second.try_recv().unwrap(),
            Err(crate::error::Error::ConnectionClosed)
        ));
    }
}
