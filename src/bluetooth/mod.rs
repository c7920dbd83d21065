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

//! Bluetooth device side: control-bus seam, dispatcher, device cache and GATT.

pub mod address;
pub mod bluez;
pub mod bus;
pub mod device;
pub mod dispatcher;
pub mod gatt;
pub mod manager;
pub mod registry;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use bluez::BluezBus;
pub use bus::{BusSignal, ControlBus, DeviceProxy, InterfaceMap, PropertyMap, Transport};
pub use device::{Classification, DeviceChanges, DeviceRecord};
pub use dispatcher::NotifyCallback;
pub use gatt::{CharacteristicFlags, GattCharacteristic, GattService};
pub use manager::DeviceManager;
pub use registry::DeviceRegistry;
pub use value::Value;
