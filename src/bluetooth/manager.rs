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

//! Device & GATT manager.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::address::{is_under, mac_from_path};
use super::bus::{
    ControlBus, DeviceProxy, DiscoveryFilter, Transport, BATTERY_IFACE, DEVICE_IFACE,
};
use super::dispatcher::{Dispatcher, NotifyCallback};
use super::gatt::{build_tree, GattService};
use super::registry::DeviceRegistry;
use super::DeviceRecord;
use crate::config::{AdapterConfig, GattConfig};
use crate::error::{BusErrorKind, Error, Result};
use crate::events::DeviceEvent;

/// Owns the device cache and is the only issuer of adapter/device calls.
pub struct DeviceManager {
    bus: Arc<dyn ControlBus>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<Dispatcher>,
    handles: Mutex<HashMap<String, Arc<dyn DeviceProxy>>>,
    gatt: GattConfig,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    /// Bring the manager up.
    ///
    /// Match rules and the dispatcher are installed before the adapter is
    /// touched and before existing devices are enumerated, so nothing that
    /// appears in between is missed.
    pub async fn start(
        bus: Arc<dyn ControlBus>,
        adapter: &AdapterConfig,
        gatt: &GattConfig,
    ) -> Result<Arc<Self>> {
        info!("Starting device manager on {}", bus.adapter_path());

        let signals = bus.subscribe().await?;

        let registry = Arc::new(DeviceRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(bus.adapter_path(), registry.clone()));
        let dispatcher_task = tokio::spawn(dispatcher.clone().run(signals));

        let manager = Arc::new(Self {
            bus,
            registry,
            dispatcher,
            handles: Mutex::new(HashMap::new()),
            gatt: gatt.clone(),
            dispatcher_task: Mutex::new(Some(dispatcher_task)),
        });

        if !manager.bus.adapter_powered().await? {
            info!("Powering on Bluetooth adapter...");
            manager.bus.set_adapter_powered(true).await?;
            tokio::time::sleep(adapter.power_on_settle()).await;
        }
        manager.registry.set_powered(true);

        if let Some(alias) = &adapter.alias {
            manager.bus.set_adapter_alias(alias).await?;
            info!("Bluetooth alias set to: {}", alias);
        }

        manager.bus.register_agent().await?;
        info!("Pairing agent registered");

        manager.enumerate().await?;

        Ok(manager)
    }

    async fn enumerate(&self) -> Result<()> {
        let objects = self.bus.managed_objects().await?;
        let adapter_path = self.bus.adapter_path();
        let mut found = 0;

        for object in objects.iter().filter(|o| is_under(&o.path, adapter_path)) {
            if let Some(props) = object.interfaces.get(DEVICE_IFACE) {
                match self.registry.insert_enumerated(&object.path, props) {
                    Ok(true) => found += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Skipping device {}: {}", object.path, e),
                }
            }
            if let Some(props) = object.interfaces.get(BATTERY_IFACE) {
                if let Err(e) = self.registry.apply_battery(&object.path, props) {
                    warn!("Skipping battery {}: {}", object.path, e);
                }
            }
        }

        info!("Enumerated {} known device(s)", found);
        Ok(())
    }

    /// Stop routing notifications.
    pub fn shutdown(&self) {
        if let Some(task) = self.dispatcher_task.lock().take() {
            task.abort();
            info!("Device manager stopped");
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        self.registry.events().subscribe()
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.all()
    }

    pub fn device(&self, mac: &str) -> Option<DeviceRecord> {
        self.registry.get(mac)
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    pub fn adapter_path(&self) -> &str {
        self.bus.adapter_path()
    }

    // Discovery

    pub fn is_discovering(&self) -> bool {
        self.registry.is_discovering()
    }

    /// Start scanning. Calling this while already scanning is a no-op.
    pub async fn start_discovery(&self, transport: Transport) -> Result<()> {
        if self.registry.is_discovering() || self.bus.adapter_discovering().await? {
            debug!("Discovery already running");
            return Ok(());
        }

        match self.bus.stop_discovery().await {
            Ok(()) => debug!("Stopped stale discovery session"),
            Err(e) if e.bus_kind() == Some(BusErrorKind::NotRunning) => {}
            Err(e) => return Err(e),
        }

        self.bus
            .set_discovery_filter(&DiscoveryFilter {
                transport,
                duplicate_data: true,
            })
            .await?;

        match self.bus.start_discovery().await {
            Ok(()) => info!("Discovery started ({:?})", transport),
            Err(e) if e.bus_kind() == Some(BusErrorKind::InProgress) => {
                debug!("Discovery already in progress")
            }
            Err(e) => return Err(e),
        }
        self.registry.set_discovering(true);
        Ok(())
    }

    pub async fn stop_discovery(&self) -> Result<()> {
        match self.bus.stop_discovery().await {
            Ok(()) => info!("Discovery stopped"),
            Err(e)
                if matches!(
                    e.bus_kind(),
                    Some(BusErrorKind::NotReady | BusErrorKind::NotRunning)
                ) =>
            {
                debug!("Discovery was not running: {}", e)
            }
            Err(e) => return Err(e),
        }
        self.registry.set_discovering(false);
        Ok(())
    }

    // Device control

    fn device_proxy(&self, path: &str) -> Result<Arc<dyn DeviceProxy>> {
        let mut handles = self.handles.lock();
        if let Some(proxy) = handles.get(path) {
            return Ok(proxy.clone());
        }
        let proxy = self.bus.device_proxy(path)?;
        handles.insert(path.to_string(), proxy.clone());
        Ok(proxy)
    }

    pub async fn connect(&self, path: &str) -> Result<()> {
        info!("Connecting {}", path);
        self.device_proxy(path)?.connect().await
    }

    pub async fn disconnect(&self, path: &str) -> Result<()> {
        info!("Disconnecting {}", path);
        self.device_proxy(path)?.disconnect().await
    }

    pub async fn pair(&self, path: &str) -> Result<()> {
        info!("Pairing {}", path);
        self.device_proxy(path)?.pair().await
    }

    /// Forget the device at adapter level.
    pub async fn unpair(&self, path: &str) -> Result<()> {
        info!("Removing {}", path);
        self.bus.remove_device(path).await?;
        self.handles.lock().remove(path);
        Ok(())
    }

    pub async fn trust(&self, path: &str, trusted: bool) -> Result<()> {
        self.device_proxy(path)?.set_trusted(trusted).await
    }

    pub async fn block(&self, path: &str, blocked: bool) -> Result<()> {
        self.device_proxy(path)?.set_blocked(blocked).await
    }

    // GATT

    /// Wait for the device's services to resolve, then rebuild its GATT tree.
    pub async fn discover_services(&self, path: &str) -> Result<Vec<GattService>> {
        let mac = mac_from_path(path)
            .ok_or_else(|| Error::InvalidArgument(format!("not a device path: {}", path)))?;

        // Subscribe before reading so a flip between the read and the wait is not lost.
        let mut events = self.registry.events().subscribe();
        let resolved = self.device_proxy(path)?.services_resolved().await?;

        if !resolved {
            debug!("Waiting for services of {} to resolve", mac);
            tokio::time::timeout(
                self.gatt.services_resolved_timeout(),
                wait_services_resolved(&mut events, &mac),
            )
            .await
            .map_err(|_| Error::Timeout(format!("services of {} to resolve", mac)))??;
        }
        drop(events);

        let objects = self.bus.managed_objects().await?;
        let services = build_tree(path, &objects);
        info!("Discovered {} service(s) on {}", services.len(), mac);
        Ok(services)
    }

    pub async fn read(&self, characteristic: &str) -> Result<Vec<u8>> {
        let value = self.bus.read_characteristic(characteristic).await?;
        debug!("Read {}: {}", characteristic, hex::encode(&value));
        Ok(value)
    }

    pub async fn write(
        &self,
        characteristic: &str,
        value: &[u8],
        without_response: bool,
    ) -> Result<()> {
        debug!("Write {}: {}", characteristic, hex::encode(value));
        self.bus
            .write_characteristic(characteristic, value, without_response)
            .await
    }

    /// Enable notifications; `callback` receives every new value.
    ///
    /// The callback is registered before notifications are enabled so a
    /// value arriving during setup is delivered.
    pub async fn start_notify(&self, characteristic: &str, callback: NotifyCallback) -> Result<()> {
        self.dispatcher.register_notify(characteristic, callback);
        if let Err(e) = self.bus.start_notify(characteristic).await {
            self.dispatcher.unregister_notify(characteristic);
            return Err(e);
        }
        debug!("Notifications enabled on {}", characteristic);
        Ok(())
    }

    pub async fn stop_notify(&self, characteristic: &str) -> Result<()> {
        self.dispatcher.unregister_notify(characteristic);
        self.bus.stop_notify(characteristic).await
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn wait_services_resolved(
    events: &mut mpsc::UnboundedReceiver<DeviceEvent>,
    mac: &str,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        if let DeviceEvent::DeviceChanged { mac: m, changes } = event {
            if m == mac && changes.services_resolved == Some(true) {
                return Ok(());
            }
        }
    }
    Err(Error::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::bus::{BusSignal, PropertyMap};
    use crate::bluetooth::testing::{FakeBus, SharedFakeBus, DEV};
    use crate::bluetooth::value::Value;
    use std::time::Duration;
    use tokio::time::Instant;

    async fn start(fake: &Arc<FakeBus>) -> Result<Arc<DeviceManager>> {
        let adapter = AdapterConfig {
            alias: Some("Kitchen".into()),
            ..Default::default()
        };
        DeviceManager::start(
            Arc::new(SharedFakeBus(fake.clone())),
            &adapter,
            &GattConfig::default(),
        )
        .await
    }

    fn resolved_signal() -> BusSignal {
        let mut changed = PropertyMap::new();
        changed.insert("ServicesResolved".into(), Value::Bool(true));
        BusSignal::PropertiesChanged {
            path: DEV.into(),
            interface: DEVICE_IFACE.into(),
            changed,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_order() -> Result<()> {
        let fake = FakeBus::new().with_device(DEV, vec![("Name", Value::from("Phone"))]);
        let manager = start(&fake).await?;

        assert_eq!(
            fake.calls(),
            vec![
                "subscribe",
                "adapter_powered",
                "set_adapter_powered",
                "set_adapter_alias Kitchen",
                "register_agent",
                "managed_objects",
            ]
        );
        let device = manager.device("AA:BB:CC:DD:EE:FF").expect("enumerated");
        assert_eq!(device.name.as_deref(), Some("Phone"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_powered_adapter_left_alone() -> Result<()> {
        let fake = FakeBus::new();
        fake.set_powered(true);
        let _manager = start(&fake).await?;
        assert_eq!(fake.count("set_adapter_powered"), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_discovery_idempotent() -> Result<()> {
        let fake = FakeBus::new();
        let manager = start(&fake).await?;

        manager.start_discovery(Transport::Le).await?;
        manager.start_discovery(Transport::Le).await?;

        assert_eq!(fake.count("start_discovery"), 1);
        assert_eq!(fake.count("set_discovery_filter Le true"), 1);
        assert!(manager.is_discovering());

        manager.stop_discovery().await?;
        // Stopping again is tolerated.
        manager.stop_discovery().await?;
        assert!(!manager.is_discovering());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_proxy_cache_reused() -> Result<()> {
        let fake = FakeBus::new();
        let manager = start(&fake).await?;

        manager.connect(DEV).await?;
        manager.pair(DEV).await?;
        manager.trust(DEV, true).await?;
        manager.disconnect(DEV).await?;

        assert_eq!(fake.proxies_created(), 1);
        assert_eq!(fake.count(&format!("trusted {} true", DEV)), 1);

        manager.unpair(DEV).await?;
        assert_eq!(fake.count(&format!("remove_device {}", DEV)), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_services_already_resolved() -> Result<()> {
        let fake = FakeBus::new().with_device(DEV, vec![]);
        fake.set_services_resolved(DEV, true);
        let manager = start(&fake).await?;

        let started = Instant::now();
        let services = manager.discover_services(DEV).await?;
        assert!(services.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_services_waits_for_flip() -> Result<()> {
        let fake = FakeBus::new().with_device(DEV, vec![]);
        let manager = start(&fake).await?;

        let flipper = fake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flipper.emit(resolved_signal());
        });

        let started = Instant::now();
        manager.discover_services(DEV).await?;
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(30));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_services_times_out() -> Result<()> {
        let fake = FakeBus::new().with_device(DEV, vec![]);
        let manager = start(&fake).await?;

        let started = Instant::now();
        let err = manager.discover_services(DEV).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_registered_before_enable() -> Result<()> {
        let fake = FakeBus::new();
        let manager = start(&fake).await?;
        let characteristic = format!("{}/service000a/char000b", DEV);
        fake.set_value(&characteristic, vec![0x64]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .start_notify(
                &characteristic,
                Arc::new(move |bytes: &[u8]| {
                    let _ = tx.send(bytes.to_vec());
                }),
            )
            .await?;

        assert_eq!(rx.recv().await, Some(vec![0x64]));
        assert!(fake.is_notifying(&characteristic));

        manager.stop_notify(&characteristic).await?;
        assert!(!fake.is_notifying(&characteristic));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_write_roundtrip_through_bus() -> Result<()> {
        let fake = FakeBus::new();
        let manager = start(&fake).await?;
        let characteristic = format!("{}/service000a/char000c", DEV);

        manager.write(&characteristic, &[0xde, 0xad], true).await?;
        assert_eq!(manager.read(&characteristic).await?, vec![0xde, 0xad]);
        assert_eq!(
            fake.count(&format!("write {} dead true", characteristic)),
            1
        );
        Ok(())
    }
}
