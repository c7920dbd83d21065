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

//! Upward event contract and subscriber fan-out.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::bluetooth::{DeviceChanges, DeviceRecord, InterfaceMap, PropertyMap};
use crate::hfp::CallState;

/// Events emitted by the device manager.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DeviceEvent {
    DeviceFound {
        mac: String,
        record: DeviceRecord,
    },
    DeviceChanged {
        mac: String,
        changes: DeviceChanges,
    },
    DeviceRemoved {
        mac: String,
    },
    CharacteristicChanged {
        path: String,
        value: Vec<u8>,
    },
    /// Media objects are forwarded untouched to the media collaborator.
    MediaAdded {
        path: String,
        #[serde(skip)]
        interfaces: InterfaceMap,
    },
    MediaRemoved {
        path: String,
        interfaces: Vec<String>,
    },
    MediaChanged {
        path: String,
        interface: String,
        #[serde(skip)]
        changed: PropertyMap,
    },
}

/// Which gain a volume report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GainKind {
    Speaker,
    Microphone,
}

/// Events emitted by the hands-free engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HfpEvent {
    /// A channel arrived; no protocol traffic has happened yet.
    PreConnect { mac: String },
    /// Service level connection established.
    Connected { mac: String },
    /// `link_connected` reports whether the device manager still sees the
    /// baseband link up, i.e. only the hands-free channel went away.
    Disconnected { mac: String, link_connected: bool },
    CallState {
        mac: String,
        state: CallState,
        number: Option<String>,
        name: Option<String>,
    },
    Indicator { mac: String, name: String, value: u8 },
    BatteryLevel { mac: String, level: u8 },
    SignalStrength { mac: String, level: u8 },
    OperatorName { mac: String, name: String },
    AgFeatures { mac: String, features: u32 },
    HoldModes { mac: String, modes: Vec<String> },
    Volume { mac: String, kind: GainKind, level: u8 },
}

/// One-to-many event delivery.
///
/// Every live subscriber receives exactly one copy of each emitted event.
/// Dropping the receiver unsubscribes.
pub struct EventBus<E> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: E) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
