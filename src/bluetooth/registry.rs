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

//! Owned device cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::address::mac_from_path;
use super::bus::PropertyMap;
use super::device::{DeviceChanges, DeviceRecord};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventBus};

/// Authoritative cache of known devices, keyed by canonical MAC.
///
/// Created with the manager and dropped with it. All mutation goes through
/// the dispatcher or the startup enumeration.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    discovering: AtomicBool,
    powered: AtomicBool,
    events: EventBus<DeviceEvent>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            discovering: AtomicBool::new(false),
            powered: AtomicBool::new(false),
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus<DeviceEvent> {
        &self.events
    }

    pub fn get(&self, mac: &str) -> Option<DeviceRecord> {
        self.devices.read().get(mac).cloned()
    }

    pub fn all(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.mac.cmp(&b.mac));
        devices
    }

    pub fn is_link_connected(&self, mac: &str) -> bool {
        self.devices
            .read()
            .get(mac)
            .map(|d| d.connected)
            .unwrap_or(false)
    }

    /// Insert a device seen for the first time and emit `deviceFound`.
    ///
    /// A device that is already cached is updated in place instead, emitting
    /// `deviceChanged` for whatever the new properties touched.
    pub fn upsert(&self, path: &str, props: &PropertyMap) -> Result<()> {
        let mac = mac_from_path(path)
            .ok_or_else(|| Error::Malformed(format!("device path {}", path)))?;

        let event = {
            let mut devices = self.devices.write();
            match devices.get_mut(&mac) {
                Some(record) => {
                    let changes = record.apply(props);
                    (!changes.is_empty()).then(|| DeviceEvent::DeviceChanged {
                        mac: mac.clone(),
                        changes,
                    })
                }
                None => {
                    let record = DeviceRecord::from_properties(path, props)
                        .ok_or_else(|| Error::Malformed(format!("device object {}", path)))?;
                    info!("Device found: {} ({:?})", mac, record.name);
                    devices.insert(mac.clone(), record.clone());
                    Some(DeviceEvent::DeviceFound {
                        mac: mac.clone(),
                        record,
                    })
                }
            }
        };

        if let Some(event) = event {
            self.events.emit(event);
        }
        Ok(())
    }

    /// Insert a device from startup enumeration; emits `deviceFound` only if new.
    pub fn insert_enumerated(&self, path: &str, props: &PropertyMap) -> Result<bool> {
        let mac = mac_from_path(path)
            .ok_or_else(|| Error::Malformed(format!("device path {}", path)))?;
        if self.devices.read().contains_key(&mac) {
            debug!("Device {} already known from a signal, skipping", mac);
            return Ok(false);
        }
        self.upsert(path, props)?;
        Ok(true)
    }

    /// Apply a `Device1` property change. Unknown devices are ignored.
    pub fn apply_changes(&self, path: &str, changed: &PropertyMap) -> Result<Option<DeviceChanges>> {
        let mac = mac_from_path(path)
            .ok_or_else(|| Error::Malformed(format!("device path {}", path)))?;

        let changes = {
            let mut devices = self.devices.write();
            let Some(record) = devices.get_mut(&mac) else {
                debug!("Property change for unknown device {}", mac);
                return Ok(None);
            };
            record.apply(changed)
        };

        if !changes.is_empty() {
            self.events.emit(DeviceEvent::DeviceChanged {
                mac,
                changes: changes.clone(),
            });
        }
        Ok(Some(changes))
    }

    /// Apply a `Battery1` property change.
    pub fn apply_battery(&self, path: &str, changed: &PropertyMap) -> Result<()> {
        let mac = mac_from_path(path)
            .ok_or_else(|| Error::Malformed(format!("battery path {}", path)))?;

        let level = {
            let mut devices = self.devices.write();
            devices
                .get_mut(&mac)
                .and_then(|record| record.apply_battery(changed))
        };

        if let Some(level) = level {
            self.events.emit(DeviceEvent::DeviceChanged {
                mac,
                changes: DeviceChanges {
                    battery: Some(level),
                    ..Default::default()
                },
            });
        }
        Ok(())
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let mac = mac_from_path(path)
            .ok_or_else(|| Error::Malformed(format!("device path {}", path)))?;
        if self.devices.write().remove(&mac).is_some() {
            info!("Device removed: {}", mac);
            self.events.emit(DeviceEvent::DeviceRemoved { mac });
        }
        Ok(())
    }

    pub fn set_discovering(&self, discovering: bool) {
        self.discovering.store(discovering, Ordering::SeqCst);
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
