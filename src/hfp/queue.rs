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

//! Per-connection command queue.
//!
//! Only the head command is ever on the wire. It completes on its final
//! result code, on the info line it asked for, or on timeout; the next
//! command is sent only after that.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Lines received while a command was in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResponse {
    pub info: Vec<String>,
}

pub type Responder = oneshot::Sender<Result<CommandResponse>>;

/// A command waiting for its turn.
#[derive(Debug)]
pub struct PendingCommand {
    line: String,
    responder: Option<Responder>,
}

impl PendingCommand {
    pub fn new(line: impl Into<String>, responder: Option<Responder>) -> Self {
        Self {
            line: line.into(),
            responder,
        }
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// Info prefix whose arrival completes the command before its final
    /// result code.
    fn completing_prefix(&self) -> Option<&'static str> {
        match self.line.as_str() {
            l if l.starts_with("AT+BRSF=") => Some("+BRSF"),
            "AT+CIND=?" | "AT+CIND?" => Some("+CIND"),
            "AT+CHLD=?" => Some("+CHLD"),
            "AT+COPS?" => Some("+COPS"),
            _ => None,
        }
    }

    fn resolve(self, result: Result<CommandResponse>) {
        match self.responder {
            Some(responder) => {
                // The caller may have given up waiting.
                let _ = responder.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!("{} failed: {}", self.line, e);
                }
            }
        }
    }
}

struct InFlight {
    command: PendingCommand,
    deadline: Instant,
    info: Vec<String>,
}

#[derive(Default)]
pub struct CommandQueue {
    waiting: VecDeque<PendingCommand>,
    in_flight: Option<InFlight>,
    /// Final result code still expected for the last command completed early.
    owed_terminals: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: PendingCommand) {
        self.waiting.push_back(command);
    }

    /// Queue ahead of everything not yet sent.
    pub fn push_front(&mut self, command: PendingCommand) {
        self.waiting.push_front(command);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    /// Put the head on the wire if nothing is in flight. Returns the bytes
    /// to write.
    pub fn next_to_send(&mut self, now: Instant, timeout: Duration) -> Option<String> {
        if self.in_flight.is_some() {
            return None;
        }
        let command = self.waiting.pop_front()?;
        let wire = format!("{}\r", command.line);
        self.in_flight = Some(InFlight {
            command,
            deadline: now + timeout,
            info: Vec::new(),
        });
        Some(wire)
    }

    /// Record a non-final line.
    pub fn on_info(&mut self, line: &str) {
        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };
        flight.info.push(line.to_string());

        let completes = flight
            .command
            .completing_prefix()
            .is_some_and(|prefix| line.starts_with(prefix));
        if completes {
            // The AG answered this command, so any result code still owed to
            // an earlier one is not coming. Only this command's own is expected.
            self.owed_terminals = 1;
            self.complete(Ok(()));
        }
    }

    /// Handle a final result code.
    pub fn on_terminal(&mut self, result: std::result::Result<(), String>) {
        if self.owed_terminals > 0 {
            self.owed_terminals -= 1;
            return;
        }
        if self.in_flight.is_none() {
            debug!("Final result code with nothing in flight: {:?}", result);
            return;
        }
        self.complete(result);
    }

    fn complete(&mut self, result: std::result::Result<(), String>) {
        if let Some(flight) = self.in_flight.take() {
            let result = match result {
                Ok(()) => Ok(CommandResponse { info: flight.info }),
                Err(reason) => Err(Error::Command {
                    command: flight.command.line.clone(),
                    reason,
                }),
            };
            flight.command.resolve(result);
        }
    }

    /// Fail the in-flight command if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> bool {
        match &self.in_flight {
            Some(flight) if flight.deadline <= now => {}
            _ => return false,
        }
        if let Some(flight) = self.in_flight.take() {
            let what = format!("response to {}", flight.command.line);
            flight.command.resolve(Err(Error::Timeout(what)));
        }
        true
    }

    /// Reject everything with `ConnectionClosed`.
    pub fn close(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            flight.command.resolve(Err(Error::ConnectionClosed));
        }
        for command in self.waiting.drain(..) {
            command.resolve(Err(Error::ConnectionClosed));
        }
        self.owed_terminals = 0;
    }
}
