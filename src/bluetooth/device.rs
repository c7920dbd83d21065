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

//! Device records and selective property updates.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::address::{canonical_mac, mac_from_path};
use super::bus::PropertyMap;
use super::value::Value;

/// Transport family of a device, derived from its address type and class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Classic,
    Le,
    Dual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(AddressType::Public),
            "random" => Some(AddressType::Random),
            _ => None,
        }
    }
}

/// Manufacturer specific advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManufacturerData {
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// Service data advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceData {
    pub uuid: String,
    pub data: Vec<u8>,
}

/// Cached state of one remote device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub mac: String,
    pub path: String,
    pub name: Option<String>,
    pub alias: Option<String>,
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
    pub paired: bool,
    pub bonded: bool,
    pub trusted: bool,
    pub blocked: bool,
    pub connected: bool,
    pub address_type: Option<AddressType>,
    pub class_of_device: Option<u32>,
    pub icon: Option<String>,
    pub battery: Option<u8>,
    pub services_resolved: bool,
    pub classification: Classification,
    pub manufacturer_data: Option<ManufacturerData>,
    pub service_data: Vec<ServiceData>,
    pub service_uuids: Vec<String>,
    /// Refreshed on every property notification, even ones carrying no known field.
    pub last_change: DateTime<Utc>,
}

/// The subset of fields touched by one property-change notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_power: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paired: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_type: Option<AddressType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_of_device: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_resolved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer_data: Option<ManufacturerData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_data: Option<Vec<ServiceData>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_uuids: Option<Vec<String>>,
}

impl DeviceChanges {
    pub fn is_empty(&self) -> bool {
        *self == DeviceChanges::default()
    }
}

fn classify(address_type: Option<AddressType>, class_of_device: Option<u32>) -> Classification {
    match (class_of_device, address_type) {
        (Some(_), Some(AddressType::Random)) => Classification::Dual,
        (Some(_), _) => Classification::Classic,
        (None, _) => Classification::Le,
    }
}

fn manufacturer_data(value: &Value) -> Option<ManufacturerData> {
    value.to_byte_map().into_iter().find_map(|(key, data)| {
        let company_id = key.parse::<u16>().ok()?;
        Some(ManufacturerData { company_id, data })
    })
}

fn service_data(value: &Value) -> Vec<ServiceData> {
    value
        .to_byte_map()
        .into_iter()
        .map(|(uuid, data)| ServiceData { uuid, data })
        .collect()
}

fn small_int<T: TryFrom<i64>>(value: &Value) -> Option<T> {
    value.as_i64().and_then(|i| T::try_from(i).ok())
}

/// Store a decoded property and record it as changed; undecodable values are skipped.
fn set<T: Clone, F: From<T>>(field: &mut F, change: &mut Option<T>, value: Option<T>) {
    if let Some(v) = value {
        *field = F::from(v.clone());
        *change = Some(v);
    }
}

impl DeviceRecord {
    /// Build a record from a `Device1` property map.
    ///
    /// The MAC comes from the `Address` property, falling back to the path.
    pub fn from_properties(path: &str, props: &PropertyMap) -> Option<Self> {
        let mac = props
            .get("Address")
            .and_then(Value::as_str)
            .and_then(canonical_mac)
            .or_else(|| mac_from_path(path))?;

        let mut record = DeviceRecord {
            mac,
            path: path.to_string(),
            name: None,
            alias: None,
            rssi: None,
            tx_power: None,
            paired: false,
            bonded: false,
            trusted: false,
            blocked: false,
            connected: false,
            address_type: None,
            class_of_device: None,
            icon: None,
            battery: None,
            services_resolved: false,
            classification: Classification::Le,
            manufacturer_data: None,
            service_data: Vec::new(),
            service_uuids: Vec::new(),
            last_change: Utc::now(),
        };
        record.apply(props);
        Some(record)
    }

    /// Apply a `Device1` property notification in place.
    ///
    /// Only properties present in `props` are touched; the returned changes
    /// list exactly those fields.
    pub fn apply(&mut self, props: &PropertyMap) -> DeviceChanges {
        let mut changes = DeviceChanges::default();
        self.last_change = Utc::now();

        for (key, value) in props {
            let text = || value.as_str().map(str::to_string);
            match key.as_str() {
                "Name" => set(&mut self.name, &mut changes.name, text()),
                "Alias" => set(&mut self.alias, &mut changes.alias, text()),
                "RSSI" => set(&mut self.rssi, &mut changes.rssi, small_int(value)),
                "TxPower" => set(&mut self.tx_power, &mut changes.tx_power, small_int(value)),
                "Paired" => set(&mut self.paired, &mut changes.paired, value.as_bool()),
                "Bonded" => set(&mut self.bonded, &mut changes.bonded, value.as_bool()),
                "Trusted" => set(&mut self.trusted, &mut changes.trusted, value.as_bool()),
                "Blocked" => set(&mut self.blocked, &mut changes.blocked, value.as_bool()),
                "Connected" => set(&mut self.connected, &mut changes.connected, value.as_bool()),
                "ServicesResolved" => set(
                    &mut self.services_resolved,
                    &mut changes.services_resolved,
                    value.as_bool(),
                ),
                "AddressType" => set(
                    &mut self.address_type,
                    &mut changes.address_type,
                    value.as_str().and_then(AddressType::parse),
                ),
                "Class" => set(
                    &mut self.class_of_device,
                    &mut changes.class_of_device,
                    small_int(value),
                ),
                "Icon" => set(&mut self.icon, &mut changes.icon, text()),
                "ManufacturerData" => {
                    self.manufacturer_data = manufacturer_data(value);
                    changes.manufacturer_data = self.manufacturer_data.clone();
                }
                "ServiceData" => {
                    self.service_data = service_data(value);
                    changes.service_data = Some(self.service_data.clone());
                }
                "UUIDs" => {
                    self.service_uuids = value.to_string_list();
                    changes.service_uuids = Some(self.service_uuids.clone());
                }
                _ => {}
            }
        }

        let classification = classify(self.address_type, self.class_of_device);
        if classification != self.classification {
            self.classification = classification;
            changes.classification = Some(classification);
        }

        changes
    }

    /// Update the battery level from a `Battery1` notification.
    pub fn apply_battery(&mut self, props: &PropertyMap) -> Option<u8> {
        let level = props.get("Percentage").and_then(small_int::<u8>)?;
        self.battery = Some(level);
        self.last_change = Utc::now();
        Some(level)
    }
}
