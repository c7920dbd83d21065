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

//! Central router for control-bus notifications.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::address::is_under;
use super::bus::{
    BusSignal, InterfaceMap, PropertyMap, ADAPTER_IFACE, BATTERY_IFACE,
    GATT_CHARACTERISTIC_IFACE, DEVICE_IFACE, MEDIA_IFACE_PREFIX,
};
use super::registry::DeviceRegistry;
use crate::error::{Error, Result};
use crate::events::DeviceEvent;

/// Callback invoked with the new value of a characteristic.
pub type NotifyCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

fn is_media(interface: &str) -> bool {
    interface.starts_with(MEDIA_IFACE_PREFIX)
}

/// Single entry point for every asynchronous bus notification.
///
/// Each notification is handled independently: a failure is logged and the
/// next notification is processed as usual.
pub struct Dispatcher {
    adapter_path: String,
    registry: Arc<DeviceRegistry>,
    notify_callbacks: Mutex<HashMap<String, NotifyCallback>>,
}

impl Dispatcher {
    pub fn new(adapter_path: impl Into<String>, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            adapter_path: adapter_path.into(),
            registry,
            notify_callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Consume the signal stream until the bus goes away.
    pub async fn run(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<BusSignal>) {
        debug!("Dispatcher started for {}", self.adapter_path);
        while let Some(signal) = signals.recv().await {
            self.dispatch(signal);
        }
        info!("Control bus signal stream ended");
    }

    pub fn register_notify(&self, path: &str, callback: NotifyCallback) {
        self.notify_callbacks.lock().insert(path.to_string(), callback);
    }

    pub fn unregister_notify(&self, path: &str) -> bool {
        self.notify_callbacks.lock().remove(path).is_some()
    }

    pub fn dispatch(&self, signal: BusSignal) {
        if !is_under(signal.path(), &self.adapter_path) {
            debug!("Ignoring signal outside adapter scope: {}", signal.path());
            return;
        }

        let path = signal.path().to_string();
        let result = match signal {
            BusSignal::InterfacesAdded { path, interfaces } => {
                self.on_interfaces_added(&path, interfaces)
            }
            BusSignal::InterfacesRemoved { path, interfaces } => {
                self.on_interfaces_removed(&path, interfaces)
            }
            BusSignal::PropertiesChanged {
                path,
                interface,
                changed,
            } => self.on_properties_changed(&path, &interface, changed),
        };

        if let Err(e) = result {
            warn!("Failed to handle signal for {}: {}", path, e);
        }
    }

    fn on_interfaces_added(&self, path: &str, interfaces: InterfaceMap) -> Result<()> {
        if interfaces.keys().any(|i| is_media(i)) {
            self.registry.events().emit(DeviceEvent::MediaAdded {
                path: path.to_string(),
                interfaces,
            });
            return Ok(());
        }

        if let Some(props) = interfaces.get(DEVICE_IFACE) {
            self.registry.upsert(path, props)?;
        }
        if let Some(props) = interfaces.get(BATTERY_IFACE) {
            self.registry.apply_battery(path, props)?;
        }
        Ok(())
    }

    fn on_interfaces_removed(&self, path: &str, interfaces: Vec<String>) -> Result<()> {
        if interfaces.iter().any(|i| is_media(i)) {
            self.registry.events().emit(DeviceEvent::MediaRemoved {
                path: path.to_string(),
                interfaces,
            });
            return Ok(());
        }

        if interfaces.iter().any(|i| i == DEVICE_IFACE) {
            self.registry.remove(path)?;
        }
        if interfaces.iter().any(|i| i == GATT_CHARACTERISTIC_IFACE)
            && self.unregister_notify(path)
        {
            debug!("Dropped notify callback for removed characteristic {}", path);
        }
        Ok(())
    }

    fn on_properties_changed(
        &self,
        path: &str,
        interface: &str,
        changed: PropertyMap,
    ) -> Result<()> {
        match interface {
            ADAPTER_IFACE => {
                if let Some(d) = changed.get("Discovering").and_then(|v| v.as_bool()) {
                    debug!("Adapter discovering: {}", d);
                    self.registry.set_discovering(d);
                }
                if let Some(p) = changed.get("Powered").and_then(|v| v.as_bool()) {
                    info!("Adapter powered: {}", p);
                    self.registry.set_powered(p);
                }
                Ok(())
            }
            DEVICE_IFACE => self.registry.apply_changes(path, &changed).map(|_| ()),
            BATTERY_IFACE => self.registry.apply_battery(path, &changed),
            GATT_CHARACTERISTIC_IFACE => {
                let Some(value) = changed.get("Value") else {
                    return Ok(());
                };
                let bytes = value
                    .to_bytes()
                    .ok_or_else(|| Error::Malformed(format!("characteristic value on {}", path)))?;

                let callback = self.notify_callbacks.lock().get(path).cloned();
                if let Some(callback) = callback {
                    callback(&bytes);
                }
                self.registry
                    .events()
                    .emit(DeviceEvent::CharacteristicChanged {
                        path: path.to_string(),
                        value: bytes,
                    });
                Ok(())
            }
            other if is_media(other) => {
                self.registry.events().emit(DeviceEvent::MediaChanged {
                    path: path.to_string(),
                    interface: other.to_string(),
                    changed,
                });
                Ok(())
            }
            other => {
                debug!("Unhandled property change on {} ({})", path, other);
                Ok(())
            }
        }
    }
}
