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

//! GATT service tree assembly.

use bitflags::bitflags;
use serde::Serialize;

use super::address::is_under;
use super::bus::{ManagedObject, PropertyMap, GATT_CHARACTERISTIC_IFACE, GATT_SERVICE_IFACE};
use super::value::Value;

bitflags! {
    /// Capability set of a characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CharacteristicFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const NOTIFY = 0x08;
        const INDICATE = 0x10;
    }
}

impl CharacteristicFlags {
    /// Parse the BlueZ `Flags` string list. Unknown flags are ignored.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names
            .into_iter()
            .fold(CharacteristicFlags::empty(), |acc, name| {
                acc | match name {
                    "read" => CharacteristicFlags::READ,
                    "write" => CharacteristicFlags::WRITE,
                    "write-without-response" => CharacteristicFlags::WRITE_WITHOUT_RESPONSE,
                    "notify" => CharacteristicFlags::NOTIFY,
                    "indicate" => CharacteristicFlags::INDICATE,
                    _ => CharacteristicFlags::empty(),
                }
            })
    }

    pub fn names(&self) -> Vec<&'static str> {
        [
            (CharacteristicFlags::READ, "read"),
            (CharacteristicFlags::WRITE, "write"),
            (
                CharacteristicFlags::WRITE_WITHOUT_RESPONSE,
                "write-without-response",
            ),
            (CharacteristicFlags::NOTIFY, "notify"),
            (CharacteristicFlags::INDICATE, "indicate"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

impl Serialize for CharacteristicFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.names())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GattCharacteristic {
    pub uuid: String,
    pub path: String,
    pub flags: CharacteristicFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GattService {
    pub uuid: String,
    pub path: String,
    pub characteristics: Vec<GattCharacteristic>,
}

fn uuid_of(props: &PropertyMap) -> String {
    props
        .get("UUID")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Rebuild the full service → characteristic tree of one device.
///
/// Services and characteristics are ordered by object path, which follows
/// the attribute handle order.
pub fn build_tree(device_path: &str, objects: &[ManagedObject]) -> Vec<GattService> {
    let mut nested: Vec<&ManagedObject> = objects
        .iter()
        .filter(|o| o.path != device_path && is_under(&o.path, device_path))
        .collect();
    nested.sort_by(|a, b| a.path.cmp(&b.path));

    let mut services: Vec<GattService> = nested
        .iter()
        .filter_map(|o| {
            let props = o.interfaces.get(GATT_SERVICE_IFACE)?;
            Some(GattService {
                uuid: uuid_of(props),
                path: o.path.clone(),
                characteristics: Vec::new(),
            })
        })
        .collect();

    for object in &nested {
        let Some(props) = object.interfaces.get(GATT_CHARACTERISTIC_IFACE) else {
            continue;
        };
        let service_path = props
            .get("Service")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                object
                    .path
                    .rsplit_once('/')
                    .map(|(parent, _)| parent.to_string())
            });
        let Some(service) = services
            .iter_mut()
            .find(|s| Some(&s.path) == service_path.as_ref())
        else {
            continue;
        };

        let flags = props
            .get("Flags")
            .map(|f| f.to_string_list())
            .unwrap_or_default();
        service.characteristics.push(GattCharacteristic {
            uuid: uuid_of(props),
            path: object.path.clone(),
            flags: CharacteristicFlags::from_names(flags.iter().map(String::as_str)),
        });
    }

    services
}
