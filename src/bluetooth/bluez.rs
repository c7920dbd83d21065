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

//! BlueZ backend for the control-bus seam, built on `bluer`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bluer::agent::{
    Agent, AgentHandle, AuthorizeService, ReqResult, RequestAuthorization, RequestConfirmation,
};
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceProperty, DiscoveryTransport,
    ErrorKind, Session,
};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::address::{device_path, mac_from_path};
use super::bus::{
    BusSignal, ControlBus, DeviceProxy, DiscoveryFilter, InterfaceMap, ManagedObject,
    PropertyMap, Transport, ADAPTER_IFACE, BATTERY_IFACE, DEVICE_IFACE,
    GATT_CHARACTERISTIC_IFACE, GATT_SERVICE_IFACE,
};
use super::value::Value;
use crate::error::{BusErrorKind, Error, Result};

impl From<bluer::Error> for Error {
    fn from(e: bluer::Error) -> Self {
        let kind = match e.kind {
            ErrorKind::NotReady => BusErrorKind::NotReady,
            ErrorKind::InProgress => BusErrorKind::InProgress,
            ErrorKind::AlreadyExists => BusErrorKind::AlreadyExists,
            ErrorKind::DoesNotExist => BusErrorKind::DoesNotExist,
            ErrorKind::AuthenticationRejected => BusErrorKind::AuthenticationRejected,
            ErrorKind::AuthenticationCanceled => BusErrorKind::AuthenticationCanceled,
            ErrorKind::AuthenticationTimeout => BusErrorKind::AuthenticationTimeout,
            ErrorKind::AuthenticationFailed => BusErrorKind::AuthenticationFailed,
            ErrorKind::NotAvailable => BusErrorKind::NotAvailable,
            ErrorKind::NotSupported => BusErrorKind::NotSupported,
            ErrorKind::Failed if e.message.contains("No discovery started") => {
                BusErrorKind::NotRunning
            }
            ErrorKind::Failed => BusErrorKind::Failed,
            _ => BusErrorKind::Other,
        };
        Error::bus(kind, e.message)
    }
}

type Watchers = Arc<Mutex<HashMap<Address, JoinHandle<()>>>>;

/// [`ControlBus`] over a live `bluetoothd`.
pub struct BluezBus {
    session: Session,
    adapter: Adapter,
    adapter_path: String,
    signals: Mutex<Option<mpsc::UnboundedSender<BusSignal>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    watchers: Watchers,
    discovery: Mutex<Option<JoinHandle<()>>>,
    notifications: Mutex<HashMap<String, JoinHandle<()>>>,
    agent: Mutex<Option<AgentHandle>>,
}

impl BluezBus {
    /// Open a session on the named adapter, or the default one.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());
        let adapter_path = format!("/org/bluez/{}", adapter.name());

        Ok(Self {
            session,
            adapter,
            adapter_path,
            signals: Mutex::new(None),
            monitor: Mutex::new(None),
            watchers: Arc::new(Mutex::new(HashMap::new())),
            discovery: Mutex::new(None),
            notifications: Mutex::new(HashMap::new()),
            agent: Mutex::new(None),
        })
    }

    /// Session handle, needed for profile registration.
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn address_of(&self, path: &str) -> Result<Address> {
        mac_from_path(path)
            .and_then(|mac| mac.parse().ok())
            .ok_or_else(|| Error::InvalidArgument(format!("not a device path: {}", path)))
    }

    async fn characteristic(&self, path: &str) -> Result<Characteristic> {
        let (service_id, char_id) = gatt_ids(path)
            .ok_or_else(|| Error::InvalidArgument(format!("not a characteristic path: {}", path)))?;
        let device = self.adapter.device(self.address_of(path)?)?;
        let service = device.service(service_id).await?;
        Ok(service.characteristic(char_id).await?)
    }
}

impl Drop for BluezBus {
    fn drop(&mut self) {
        if let Some(task) = self.monitor.lock().take() {
            task.abort();
        }
        if let Some(task) = self.discovery.lock().take() {
            task.abort();
        }
        for (_, task) in self.watchers.lock().drain() {
            task.abort();
        }
        for (_, task) in self.notifications.lock().drain() {
            task.abort();
        }
    }
}

fn object_path(adapter_path: &str, address: Address) -> String {
    device_path(adapter_path, &address.to_string()).unwrap_or_default()
}

/// Service and characteristic ids from `.../serviceXXXX/charYYYY`.
fn gatt_ids(path: &str) -> Option<(u16, u16)> {
    let mut segments = path.rsplit('/');
    let characteristic = segments.next()?.strip_prefix("char")?;
    let service = segments.next()?.strip_prefix("service")?;
    Some((
        u16::from_str_radix(service, 16).ok()?,
        u16::from_str_radix(characteristic, 16).ok()?,
    ))
}

fn address_type(t: bluer::AddressType) -> &'static str {
    match t {
        bluer::AddressType::LeRandom => "random",
        _ => "public",
    }
}

/// Decode one `bluer` property into the bus value model.
fn insert_property(interfaces: &mut InterfaceMap, property: DeviceProperty) {
    let (interface, name, value) = match property {
        DeviceProperty::Name(v) => (DEVICE_IFACE, "Name", Value::Str(v)),
        DeviceProperty::Alias(v) => (DEVICE_IFACE, "Alias", Value::Str(v)),
        DeviceProperty::RemoteAddress(a) => (DEVICE_IFACE, "Address", Value::Str(a.to_string())),
        DeviceProperty::AddressType(t) => (DEVICE_IFACE, "AddressType", Value::from(address_type(t))),
        DeviceProperty::Icon(v) => (DEVICE_IFACE, "Icon", Value::Str(v)),
        DeviceProperty::Class(c) => (DEVICE_IFACE, "Class", Value::Int(c.into())),
        DeviceProperty::Rssi(v) => (DEVICE_IFACE, "RSSI", Value::Int(v.into())),
        DeviceProperty::TxPower(v) => (DEVICE_IFACE, "TxPower", Value::Int(v.into())),
        DeviceProperty::Paired(b) => {
            // bluer exposes no separate bond flag; a paired device is bonded.
            interfaces
                .entry(DEVICE_IFACE.to_string())
                .or_default()
                .insert("Bonded".to_string(), Value::Bool(b));
            (DEVICE_IFACE, "Paired", Value::Bool(b))
        }
        DeviceProperty::Trusted(b) => (DEVICE_IFACE, "Trusted", Value::Bool(b)),
        DeviceProperty::Blocked(b) => (DEVICE_IFACE, "Blocked", Value::Bool(b)),
        DeviceProperty::Connected(b) => (DEVICE_IFACE, "Connected", Value::Bool(b)),
        DeviceProperty::ServicesResolved(b) => (DEVICE_IFACE, "ServicesResolved", Value::Bool(b)),
        DeviceProperty::Uuids(uuids) => {
            let mut uuids: Vec<String> = uuids.iter().map(|u| u.to_string()).collect();
            uuids.sort();
            (
                DEVICE_IFACE,
                "UUIDs",
                Value::Array(uuids.into_iter().map(Value::Str).collect()),
            )
        }
        DeviceProperty::ManufacturerData(data) => (
            DEVICE_IFACE,
            "ManufacturerData",
            Value::Dict(
                data.into_iter()
                    .map(|(id, bytes)| (Value::Int(id.into()), Value::Variant(Box::new(Value::Bytes(bytes)))))
                    .collect(),
            ),
        ),
        DeviceProperty::ServiceData(data) => (
            DEVICE_IFACE,
            "ServiceData",
            Value::Dict(
                data.into_iter()
                    .map(|(uuid, bytes)| (Value::Str(uuid.to_string()), Value::Variant(Box::new(Value::Bytes(bytes)))))
                    .collect(),
            ),
        ),
        DeviceProperty::BatteryPercentage(p) => (BATTERY_IFACE, "Percentage", Value::Int(p.into())),
        _ => return,
    };
    interfaces
        .entry(interface.to_string())
        .or_default()
        .insert(name.to_string(), value);
}

async fn device_interfaces(device: &Device) -> Result<InterfaceMap> {
    let mut interfaces = InterfaceMap::new();
    interfaces.insert(DEVICE_IFACE.to_string(), PropertyMap::new());
    for property in device.all_properties().await? {
        insert_property(&mut interfaces, property);
    }
    Ok(interfaces)
}

/// Forward property changes of one device until it goes away.
fn watch_device(
    adapter: &Adapter,
    adapter_path: &str,
    address: Address,
    tx: mpsc::UnboundedSender<BusSignal>,
    watchers: &Watchers,
) {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            debug!("No device object for {}: {}", address, e);
            return;
        }
    };
    let path = object_path(adapter_path, address);

    let task = tokio::spawn(async move {
        let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
                debug!("Cannot watch {}: {}", path, e);
                return;
            }
        };
        pin_mut!(events);
        while let Some(event) = events.next().await {
            if let bluer::DeviceEvent::PropertyChanged(property) = event {
                let mut interfaces = InterfaceMap::new();
                insert_property(&mut interfaces, property);
                for (interface, changed) in interfaces {
                    let signal = BusSignal::PropertiesChanged {
                        path: path.clone(),
                        interface,
                        changed,
                    };
                    if tx.send(signal).is_err() {
                        return;
                    }
                }
            }
        }
    });

    if let Some(previous) = watchers.lock().insert(address, task) {
        previous.abort();
    }
}

async fn gatt_objects(device: &Device, device_path: &str, objects: &mut Vec<ManagedObject>) -> Result<()> {
    for service in device.services().await? {
        let service_path = format!("{}/service{:04x}", device_path, service.id());
        let mut props = PropertyMap::new();
        props.insert("UUID".into(), Value::Str(service.uuid().await?.to_string()));
        objects.push(ManagedObject {
            path: service_path.clone(),
            interfaces: [(GATT_SERVICE_IFACE.to_string(), props)].into_iter().collect(),
        });

        for characteristic in service.characteristics().await? {
            let flags = characteristic.flags().await?;
            let names: Vec<Value> = [
                (flags.read, "read"),
                (flags.write, "write"),
                (flags.write_without_response, "write-without-response"),
                (flags.notify, "notify"),
                (flags.indicate, "indicate"),
            ]
            .into_iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| Value::from(name))
            .collect();

            let mut props = PropertyMap::new();
            props.insert("UUID".into(), Value::Str(characteristic.uuid().await?.to_string()));
            props.insert("Service".into(), Value::Str(service_path.clone()));
            props.insert("Flags".into(), Value::Array(names));
            objects.push(ManagedObject {
                path: format!("{}/char{:04x}", service_path, characteristic.id()),
                interfaces: [(GATT_CHARACTERISTIC_IFACE.to_string(), props)]
                    .into_iter()
                    .collect(),
            });
        }
    }
    Ok(())
}

async fn confirm_pairing(req: RequestConfirmation) -> ReqResult<()> {
    info!("Accepting pairing with {} (passkey {:06})", req.device, req.passkey);
    Ok(())
}

async fn authorize_pairing(req: RequestAuthorization) -> ReqResult<()> {
    info!("Authorizing pairing with {}", req.device);
    Ok(())
}

async fn authorize_service(req: AuthorizeService) -> ReqResult<()> {
    debug!("Authorizing service {} for {}", req.service, req.device);
    Ok(())
}

struct BluezDevice {
    device: Device,
}

#[async_trait]
impl DeviceProxy for BluezDevice {
    async fn connect(&self) -> Result<()> {
        Ok(self.device.connect().await?)
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(self.device.disconnect().await?)
    }

    async fn pair(&self) -> Result<()> {
        Ok(self.device.pair().await?)
    }

    async fn set_trusted(&self, trusted: bool) -> Result<()> {
        Ok(self.device.set_trusted(trusted).await?)
    }

    async fn set_blocked(&self, blocked: bool) -> Result<()> {
        Ok(self.device.set_blocked(blocked).await?)
    }

    async fn services_resolved(&self) -> Result<bool> {
        Ok(self.device.is_services_resolved().await?)
    }
}

#[async_trait]
impl ControlBus for BluezBus {
    fn adapter_path(&self) -> &str {
        &self.adapter_path
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusSignal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = self.adapter.events().await?;

        // Devices already known only need a watcher; enumeration reports them.
        for address in self.adapter.device_addresses().await? {
            watch_device(&self.adapter, &self.adapter_path, address, tx.clone(), &self.watchers);
        }

        let adapter = self.adapter.clone();
        let adapter_path = self.adapter_path.clone();
        let watchers = self.watchers.clone();
        let signals = tx.clone();
        let monitor = tokio::spawn(async move {
            pin_mut!(events);
            while let Some(event) = events.next().await {
                let signal = match event {
                    AdapterEvent::DeviceAdded(address) => {
                        let path = object_path(&adapter_path, address);
                        let interfaces: Result<InterfaceMap> = match adapter.device(address) {
                            Ok(device) => device_interfaces(&device).await,
                            Err(e) => Err(e.into()),
                        };
                        match interfaces {
                            Ok(interfaces) => {
                                watch_device(&adapter, &adapter_path, address, signals.clone(), &watchers);
                                BusSignal::InterfacesAdded { path, interfaces }
                            }
                            Err(e) => {
                                warn!("Failed to read properties of {}: {}", path, e);
                                continue;
                            }
                        }
                    }
                    AdapterEvent::DeviceRemoved(address) => {
                        if let Some(watcher) = watchers.lock().remove(&address) {
                            watcher.abort();
                        }
                        BusSignal::InterfacesRemoved {
                            path: object_path(&adapter_path, address),
                            interfaces: vec![DEVICE_IFACE.to_string(), BATTERY_IFACE.to_string()],
                        }
                    }
                    AdapterEvent::PropertyChanged(property) => {
                        let (name, value) = match property {
                            AdapterProperty::Powered(b) => ("Powered", Value::Bool(b)),
                            AdapterProperty::Discovering(b) => ("Discovering", Value::Bool(b)),
                            _ => continue,
                        };
                        BusSignal::PropertiesChanged {
                            path: adapter_path.clone(),
                            interface: ADAPTER_IFACE.to_string(),
                            changed: [(name.to_string(), value)].into_iter().collect(),
                        }
                    }
                };
                if signals.send(signal).is_err() {
                    break;
                }
            }
            info!("Adapter event stream ended");
        });

        *self.signals.lock() = Some(tx);
        if let Some(previous) = self.monitor.lock().replace(monitor) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn adapter_powered(&self) -> Result<bool> {
        Ok(self.adapter.is_powered().await?)
    }

    async fn set_adapter_powered(&self, powered: bool) -> Result<()> {
        Ok(self.adapter.set_powered(powered).await?)
    }

    async fn set_adapter_alias(&self, alias: &str) -> Result<()> {
        Ok(self.adapter.set_alias(alias.to_string()).await?)
    }

    async fn adapter_discovering(&self) -> Result<bool> {
        Ok(self.adapter.is_discovering().await?)
    }

    async fn set_discovery_filter(&self, filter: &DiscoveryFilter) -> Result<()> {
        let transport = match filter.transport {
            Transport::Auto => DiscoveryTransport::Auto,
            Transport::Bredr => DiscoveryTransport::BrEdr,
            Transport::Le => DiscoveryTransport::Le,
        };
        self.adapter
            .set_discovery_filter(bluer::DiscoveryFilter {
                transport,
                duplicate_data: filter.duplicate_data,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn start_discovery(&self) -> Result<()> {
        let active = self
            .discovery
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if active {
            return Err(Error::bus(BusErrorKind::InProgress, "Operation already in progress"));
        }

        // The session lasts as long as the stream is polled; events arrive
        // through the adapter monitor.
        let stream = self.adapter.discover_devices_with_changes().await?;
        let task = tokio::spawn(async move {
            pin_mut!(stream);
            while stream.next().await.is_some() {}
        });
        *self.discovery.lock() = Some(task);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        match self.discovery.lock().take() {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(Error::bus(BusErrorKind::NotRunning, "No discovery started")),
        }
    }

    async fn remove_device(&self, device_path: &str) -> Result<()> {
        let address = self.address_of(device_path)?;
        self.adapter.remove_device(address).await?;
        Ok(())
    }

    async fn register_agent(&self) -> Result<()> {
        let agent = Agent {
            request_default: true,
            request_confirmation: Some(Box::new(|req| Box::pin(confirm_pairing(req)))),
            request_authorization: Some(Box::new(|req| Box::pin(authorize_pairing(req)))),
            authorize_service: Some(Box::new(|req| Box::pin(authorize_service(req)))),
            ..Default::default()
        };
        let handle = self.session.register_agent(agent).await?;
        *self.agent.lock() = Some(handle);
        Ok(())
    }

    async fn managed_objects(&self) -> Result<Vec<ManagedObject>> {
        let mut objects = Vec::new();
        for address in self.adapter.device_addresses().await? {
            let device = self.adapter.device(address)?;
            let path = object_path(&self.adapter_path, address);
            let interfaces = match device_interfaces(&device).await {
                Ok(interfaces) => interfaces,
                Err(e) => {
                    debug!("Skipping {}: {}", path, e);
                    continue;
                }
            };
            objects.push(ManagedObject {
                path: path.clone(),
                interfaces,
            });

            if device.is_services_resolved().await.unwrap_or(false) {
                if let Err(e) = gatt_objects(&device, &path, &mut objects).await {
                    debug!("Incomplete GATT tree for {}: {}", path, e);
                }
            }
        }
        Ok(objects)
    }

    fn device_proxy(&self, path: &str) -> Result<Arc<dyn DeviceProxy>> {
        let device = self.adapter.device(self.address_of(path)?)?;
        Ok(Arc::new(BluezDevice { device }))
    }

    async fn read_characteristic(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.characteristic(path).await?.read().await?)
    }

    async fn write_characteristic(
        &self,
        path: &str,
        value: &[u8],
        without_response: bool,
    ) -> Result<()> {
        let characteristic = self.characteristic(path).await?;
        if without_response {
            let request = CharacteristicWriteRequest {
                op_type: WriteOp::Command,
                ..Default::default()
            };
            characteristic.write_ext(value, &request).await?;
        } else {
            characteristic.write(value).await?;
        }
        Ok(())
    }

    async fn start_notify(&self, path: &str) -> Result<()> {
        let tx = self
            .signals
            .lock()
            .clone()
            .ok_or_else(|| Error::bus(BusErrorKind::NotReady, "signal stream not subscribed"))?;
        let stream = self.characteristic(path).await?.notify().await?;

        let char_path = path.to_string();
        let task = tokio::spawn(async move {
            pin_mut!(stream);
            while let Some(value) = stream.next().await {
                let signal = BusSignal::PropertiesChanged {
                    path: char_path.clone(),
                    interface: GATT_CHARACTERISTIC_IFACE.to_string(),
                    changed: [("Value".to_string(), Value::Bytes(value))].into_iter().collect(),
                };
                if tx.send(signal).is_err() {
                    break;
                }
            }
            debug!("Notification stream for {} ended", char_path);
        });

        if let Some(previous) = self.notifications.lock().insert(path.to_string(), task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_notify(&self, path: &str) -> Result<()> {
        if let Some(task) = self.notifications.lock().remove(path) {
            task.abort();
        }
        Ok(())
    }
}
