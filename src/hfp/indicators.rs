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

//! AG indicator table and call-state derivation.

use std::collections::HashMap;

use serde::Serialize;

/// Call state label reported to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Incoming,
    Dialing,
    Alerting,
    Active,
    Held,
    Waiting,
    Ringing,
}

impl CallState {
    /// Map a `+CLCC` `<stat>` code.
    pub fn from_clcc(status: u8) -> Option<Self> {
        match status {
            0 => Some(CallState::Active),
            1 => Some(CallState::Held),
            2 => Some(CallState::Dialing),
            3 => Some(CallState::Alerting),
            4 => Some(CallState::Incoming),
            5 => Some(CallState::Waiting),
            _ => None,
        }
    }
}

/// Derive the call state from `call`, `callsetup` and `callheld`.
pub fn derive_call_state(call: u8, callsetup: u8, callheld: u8) -> CallState {
    match (call, callsetup, callheld) {
        (1, 0, 2) => CallState::Held,
        (1, 0, _) => CallState::Active,
        (_, 1, _) => CallState::Incoming,
        (_, 2, _) => CallState::Dialing,
        (_, 3, _) => CallState::Alerting,
        (_, _, 2) => CallState::Held,
        _ => CallState::Idle,
    }
}

const CALL_INDICATORS: [&str; 3] = ["call", "callsetup", "callheld"];

pub fn is_call_indicator(name: &str) -> bool {
    CALL_INDICATORS.contains(&name)
}

/// Ordered indicator names and their current values.
#[derive(Debug, Default)]
pub struct Indicators {
    names: Vec<String>,
    values: HashMap<String, u8>,
}

impl Indicators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the name table. Values from a previous table are dropped.
    pub fn define(&mut self, names: Vec<String>) {
        self.names = names;
        self.values.clear();
    }

    pub fn is_defined(&self) -> bool {
        !self.names.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<u8> {
        self.values.get(name).copied()
    }

    pub fn values(&self) -> &HashMap<String, u8> {
        &self.values
    }

    /// Bulk update in table order. Returns the indicators whose value changed.
    pub fn set_all(&mut self, values: &[u8]) -> Vec<(String, u8)> {
        let updates: Vec<(String, u8)> = self
            .names
            .iter()
            .zip(values)
            .map(|(name, &value)| (name.clone(), value))
            .collect();
        updates
            .into_iter()
            .filter(|(name, value)| self.values.insert(name.clone(), *value) != Some(*value))
            .collect()
    }

    /// Single update by 1-based index. `None` when the index is unknown.
    pub fn set(&mut self, index: usize, value: u8) -> Option<(String, bool)> {
        let name = self.names.get(index.checked_sub(1)?)?.clone();
        let changed = self.values.insert(name.clone(), value) != Some(value);
        Some((name, changed))
    }

    pub fn call_state(&self) -> CallState {
        derive_call_state(
            self.get("call").unwrap_or(0),
            self.get("callsetup").unwrap_or(0),
            self.get("callheld").unwrap_or(0),
        )
    }
}
