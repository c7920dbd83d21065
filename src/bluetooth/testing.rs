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

//! Scripted in-memory control bus for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::bus::{
    BusSignal, ControlBus, DeviceProxy, DiscoveryFilter, InterfaceMap, ManagedObject,
    PropertyMap, DEVICE_IFACE,
};
use super::value::Value;
use crate::error::{BusErrorKind, Error, Result};

pub const ADAPTER: &str = "/org/bluez/hci0";
pub const DEV: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";

#[derive(Default)]
struct FakeState {
    powered: bool,
    discovering: bool,
    objects: Vec<ManagedObject>,
    services_resolved: HashMap<String, bool>,
    notifying: Vec<String>,
    values: HashMap<String, Vec<u8>>,
}

pub struct FakeBus {
    calls: Mutex<Vec<String>>,
    state: Mutex<FakeState>,
    signals: Mutex<Option<mpsc::UnboundedSender<BusSignal>>>,
    proxies_created: AtomicUsize,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(FakeState::default()),
            signals: Mutex::new(None),
            proxies_created: AtomicUsize::new(0),
        })
    }

    pub fn with_device(self: Arc<Self>, path: &str, props: Vec<(&str, Value)>) -> Arc<Self> {
        let props: PropertyMap = props
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(DEVICE_IFACE.to_string(), props);
        self.add_object(path, interfaces);
        self
    }

    pub fn add_object(&self, path: &str, interfaces: InterfaceMap) {
        self.state.lock().objects.push(ManagedObject {
            path: path.to_string(),
            interfaces,
        });
    }

    pub fn set_powered(&self, powered: bool) {
        self.state.lock().powered = powered;
    }

    pub fn set_services_resolved(&self, path: &str, resolved: bool) {
        self.state
            .lock()
            .services_resolved
            .insert(path.to_string(), resolved);
    }

    pub fn set_value(&self, path: &str, value: Vec<u8>) {
        self.state.lock().values.insert(path.to_string(), value);
    }

    pub fn is_notifying(&self, path: &str) -> bool {
        self.state.lock().notifying.iter().any(|p| p == path)
    }

    pub fn emit(&self, signal: BusSignal) {
        if let Some(tx) = self.signals.lock().as_ref() {
            let _ = tx.send(signal);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == name).count()
    }

    pub fn proxies_created(&self) -> usize {
        self.proxies_created.load(Ordering::SeqCst)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

struct FakeDevice {
    path: String,
    bus: Arc<FakeBus>,
}

#[async_trait]
impl DeviceProxy for FakeDevice {
    async fn connect(&self) -> Result<()> {
        self.bus.record(format!("connect {}", self.path));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.bus.record(format!("disconnect {}", self.path));
        Ok(())
    }

    async fn pair(&self) -> Result<()> {
        self.bus.record(format!("pair {}", self.path));
        Ok(())
    }

    async fn set_trusted(&self, trusted: bool) -> Result<()> {
        self.bus.record(format!("trusted {} {}", self.path, trusted));
        Ok(())
    }

    async fn set_blocked(&self, blocked: bool) -> Result<()> {
        self.bus.record(format!("blocked {} {}", self.path, blocked));
        Ok(())
    }

    async fn services_resolved(&self) -> Result<bool> {
        Ok(self
            .bus
            .state
            .lock()
            .services_resolved
            .get(&self.path)
            .copied()
            .unwrap_or(false))
    }
}

/// Wrapper so the fake can hand out proxies holding a strong reference to itself.
pub struct SharedFakeBus(pub Arc<FakeBus>);

#[async_trait]
impl ControlBus for SharedFakeBus {
    fn adapter_path(&self) -> &str {
        ADAPTER
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusSignal>> {
        self.0.record("subscribe");
        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.signals.lock() = Some(tx);
        Ok(rx)
    }

    async fn adapter_powered(&self) -> Result<bool> {
        self.0.record("adapter_powered");
        Ok(self.0.state.lock().powered)
    }

    async fn set_adapter_powered(&self, powered: bool) -> Result<()> {
        self.0.record("set_adapter_powered");
        self.0.state.lock().powered = powered;
        Ok(())
    }

    async fn set_adapter_alias(&self, alias: &str) -> Result<()> {
        self.0.record(format!("set_adapter_alias {}", alias));
        Ok(())
    }

    async fn adapter_discovering(&self) -> Result<bool> {
        Ok(self.0.state.lock().discovering)
    }

    async fn set_discovery_filter(&self, filter: &DiscoveryFilter) -> Result<()> {
        self.0.record(format!(
            "set_discovery_filter {:?} {}",
            filter.transport, filter.duplicate_data
        ));
        Ok(())
    }

    async fn start_discovery(&self) -> Result<()> {
        self.0.record("start_discovery");
        let mut state = self.0.state.lock();
        if state.discovering {
            return Err(Error::bus(BusErrorKind::InProgress, "Operation already in progress"));
        }
        state.discovering = true;
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.0.record("stop_discovery");
        let mut state = self.0.state.lock();
        if !state.discovering {
            return Err(Error::bus(BusErrorKind::NotRunning, "No discovery started"));
        }
        state.discovering = false;
        Ok(())
    }

    async fn remove_device(&self, device_path: &str) -> Result<()> {
        self.0.record(format!("remove_device {}", device_path));
        Ok(())
    }

    async fn register_agent(&self) -> Result<()> {
        self.0.record("register_agent");
        Ok(())
    }

    async fn managed_objects(&self) -> Result<Vec<ManagedObject>> {
        self.0.record("managed_objects");
        Ok(self.0.state.lock().objects.clone())
    }

    fn device_proxy(&self, path: &str) -> Result<Arc<dyn DeviceProxy>> {
        self.0.proxies_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeDevice {
            path: path.to_string(),
            bus: self.0.clone(),
        }))
    }

    async fn read_characteristic(&self, path: &str) -> Result<Vec<u8>> {
        self.0
            .state
            .lock()
            .values
            .get(path)
            .cloned()
            .ok_or_else(|| Error::bus(BusErrorKind::DoesNotExist, path))
    }

    async fn write_characteristic(
        &self,
        path: &str,
        value: &[u8],
        without_response: bool,
    ) -> Result<()> {
        self.0.record(format!(
            "write {} {} {}",
            path,
            hex::encode(value),
            without_response
        ));
        self.0.state.lock().values.insert(path.to_string(), value.to_vec());
        Ok(())
    }

    async fn start_notify(&self, path: &str) -> Result<()> {
        self.0.record(format!("start_notify {}", path));
        self.0.state.lock().notifying.push(path.to_string());
        // A value racing with the enable call.
        let value = self.0.state.lock().values.get(path).cloned();
        if let Some(value) = value {
            self.0.emit(BusSignal::PropertiesChanged {
                path: path.to_string(),
                interface: super::bus::GATT_CHARACTERISTIC_IFACE.to_string(),
                changed: [("Value".to_string(), Value::Bytes(value))]
                    .into_iter()
                    .collect(),
            });
        }
        Ok(())
    }

    async fn stop_notify(&self, path: &str) -> Result<()> {
        self.0.record(format!("stop_notify {}", path));
        self.0.state.lock().notifying.retain(|p| p != path);
        Ok(())
    }
}
