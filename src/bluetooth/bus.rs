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

//! The control-bus seam.
//!
//! [`ControlBus`] is the only way the rest of the crate talks to the radio
//! adapter and device objects. The BlueZ backend lives in
//! [`super::bluez`]; tests drive the manager through an in-memory fake.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::value::Value;
use crate::error::Result;

pub const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_IFACE: &str = "org.bluez.Device1";
pub const BATTERY_IFACE: &str = "org.bluez.Battery1";
pub const GATT_SERVICE_IFACE: &str = "org.bluez.GattService1";
pub const GATT_CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";
/// Prefix shared by every media interface (endpoints, transports, players).
pub const MEDIA_IFACE_PREFIX: &str = "org.bluez.Media";

/// Property name → value.
pub type PropertyMap = HashMap<String, Value>;
/// Interface name → properties.
pub type InterfaceMap = HashMap<String, PropertyMap>;

/// Asynchronous notification from the control bus.
#[derive(Debug, Clone)]
pub enum BusSignal {
    InterfacesAdded {
        path: String,
        interfaces: InterfaceMap,
    },
    InterfacesRemoved {
        path: String,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        path: String,
        interface: String,
        changed: PropertyMap,
    },
}

impl BusSignal {
    pub fn path(&self) -> &str {
        match self {
            BusSignal::InterfacesAdded { path, .. }
            | BusSignal::InterfacesRemoved { path, .. }
            | BusSignal::PropertiesChanged { path, .. } => path,
        }
    }
}

/// One entry of the managed-object set.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    pub path: String,
    pub interfaces: InterfaceMap,
}

/// Transport selector for discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Auto,
    Bredr,
    Le,
}

/// Adapter-level scan configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub transport: Transport,
    /// Keep reporting repeated advertisements so RSSI stays fresh.
    pub duplicate_data: bool,
}

/// Method calls against one remote device object.
#[async_trait]
pub trait DeviceProxy: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn pair(&self) -> Result<()>;
    async fn set_trusted(&self, trusted: bool) -> Result<()>;
    async fn set_blocked(&self, blocked: bool) -> Result<()>;
    async fn services_resolved(&self) -> Result<bool>;
}

/// Control/method calls against the adapter and the object tree below it.
#[async_trait]
pub trait ControlBus: Send + Sync {
    /// Object path of the managed adapter.
    fn adapter_path(&self) -> &str;

    /// Install match rules and return the signal stream.
    ///
    /// Must be called before any enumeration so that no object appearing in
    /// between is missed.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusSignal>>;

    async fn adapter_powered(&self) -> Result<bool>;
    async fn set_adapter_powered(&self, powered: bool) -> Result<()>;
    async fn set_adapter_alias(&self, alias: &str) -> Result<()>;
    async fn adapter_discovering(&self) -> Result<bool>;
    async fn set_discovery_filter(&self, filter: &DiscoveryFilter) -> Result<()>;
    async fn start_discovery(&self) -> Result<()>;
    async fn stop_discovery(&self) -> Result<()>;
    async fn remove_device(&self, device_path: &str) -> Result<()>;

    /// Register the pairing delegate.
    async fn register_agent(&self) -> Result<()>;

    async fn managed_objects(&self) -> Result<Vec<ManagedObject>>;

    /// Create a proxy for the device at `path`. Proxies are cheap identifiers.
    fn device_proxy(&self, path: &str) -> Result<Arc<dyn DeviceProxy>>;

    async fn read_characteristic(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_characteristic(
        &self,
        path: &str,
        value: &[u8],
        without_response: bool,
    ) -> Result<()>;
    async fn start_notify(&self, path: &str) -> Result<()>;
    async fn stop_notify(&self, path: &str) -> Result<()>;
}
