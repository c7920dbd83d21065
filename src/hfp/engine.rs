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

//! Hands-free engine: connection table and outbound call control.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::at::{self, AtLine, CurrentCall};
use super::connection::{self, ConnectionHandle, ConnectionOptions};
use super::features::HfFeatures;
use super::slc;
use crate::bluetooth::address::canonical_mac;
use crate::bluetooth::DeviceRegistry;
use crate::config::HfpConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, HfpEvent};

pub struct HfpEngine {
    config: HfpConfig,
    features: HfFeatures,
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    events: Arc<EventBus<HfpEvent>>,
    /// Link state from the device manager, if one is running.
    registry: Option<Arc<DeviceRegistry>>,
    next_id: AtomicU64,
}

impl HfpEngine {
    pub fn new(config: HfpConfig, registry: Option<Arc<DeviceRegistry>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            features: HfFeatures::supported(),
            connections: Mutex::new(HashMap::new()),
            events: Arc::new(EventBus::new()),
            registry,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &HfpConfig {
        &self.config
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HfpEvent> {
        self.events.subscribe()
    }

    /// MACs with a service level connection.
    pub fn connected(&self) -> Vec<String> {
        let mut macs: Vec<String> = self
            .connections
            .lock()
            .values()
            .filter(|h| h.is_ready())
            .map(|h| h.mac().to_string())
            .collect();
        macs.sort();
        macs
    }

    pub fn is_connected(&self, mac: &str) -> bool {
        self.handle(mac).is_ok()
    }

    /// Take over a freshly accepted channel for `mac`.
    ///
    /// A connection already present for the same device is replaced.
    pub fn attach<S>(self: &Arc<Self>, mac: &str, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mac = canonical_mac(mac)
            .ok_or_else(|| Error::InvalidArgument(format!("MAC address {:?}", mac)))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        info!("[{}] New hands-free channel (#{})", mac, id);
        self.events.emit(HfpEvent::PreConnect { mac: mac.clone() });

        let engine: Weak<Self> = Arc::downgrade(self);
        let exit_mac = mac.clone();
        // Held across spawn so an actor that exits at once still finds its slot.
        let mut connections = self.connections.lock();
        let (handle, _task) = connection::spawn(
            id,
            &mac,
            stream,
            ConnectionOptions {
                command_timeout: self.config.command_timeout(),
                keepalive: self.config.keepalive_interval(),
            },
            self.events.clone(),
            move || {
                if let Some(engine) = engine.upgrade() {
                    engine.teardown(&exit_mac, id);
                }
            },
        );

        if let Some(previous) = connections.insert(mac.clone(), handle.clone()) {
            warn!("[{}] Replacing connection #{}", mac, previous.id());
            previous.close();
        }
        drop(connections);

        let features = self.features;
        tokio::spawn(async move {
            if let Err(e) = slc::establish(&handle, features).await {
                warn!("[{}] Handshake failed: {}", handle.mac(), e);
                handle.close();
            }
        });
        Ok(())
    }

    /// Disconnection requested by the profile manager.
    pub fn request_disconnection(&self, mac: &str) -> Result<()> {
        let mac = canonical_mac(mac)
            .ok_or_else(|| Error::InvalidArgument(format!("MAC address {:?}", mac)))?;
        let handle = self
            .connections
            .lock()
            .get(&mac)
            .cloned()
            .ok_or_else(|| Error::NotConnected(mac.clone()))?;
        handle.close();
        Ok(())
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        for handle in self.connections.lock().values() {
            handle.close();
        }
    }

    fn teardown(&self, mac: &str, id: u64) {
        {
            let mut connections = self.connections.lock();
            match connections.get(mac) {
                Some(handle) if handle.id() == id => {
                    connections.remove(mac);
                }
                _ => {
                    debug!("[{}] Connection #{} already replaced", mac, id);
                    return;
                }
            }
        }

        let link_connected = self
            .registry
            .as_ref()
            .is_some_and(|registry| registry.is_link_connected(mac));
        info!(
            "[{}] Hands-free connection closed (link {})",
            mac,
            if link_connected { "still up" } else { "down" }
        );
        self.events.emit(HfpEvent::Disconnected {
            mac: mac.to_string(),
            link_connected,
        });
    }

    fn handle(&self, mac: &str) -> Result<ConnectionHandle> {
        let mac = canonical_mac(mac)
            .ok_or_else(|| Error::InvalidArgument(format!("MAC address {:?}", mac)))?;
        self.connections
            .lock()
            .get(&mac)
            .filter(|h| h.is_ready())
            .cloned()
            .ok_or(Error::NotConnected(mac))
    }

    async fn send(&self, mac: &str, line: String) -> Result<Vec<String>> {
        let handle = self.handle(mac)?;
        Ok(handle.command(line).await?.info)
    }

    // Call control

    pub async fn answer(&self, mac: &str) -> Result<()> {
        self.send(mac, "ATA".into()).await.map(drop)
    }

    pub async fn hangup(&self, mac: &str) -> Result<()> {
        self.send(mac, "AT+CHUP".into()).await.map(drop)
    }

    /// Reject an incoming call.
    pub async fn reject(&self, mac: &str) -> Result<()> {
        self.send(mac, "AT+CHUP".into()).await.map(drop)
    }

    pub async fn dial(&self, mac: &str, number: &str) -> Result<()> {
        let number = at::sanitize_number(number);
        if number.is_empty() {
            return Err(Error::InvalidArgument("empty dial string".into()));
        }
        self.send(mac, format!("ATD{};", number)).await.map(drop)
    }

    pub async fn redial(&self, mac: &str) -> Result<()> {
        self.send(mac, "AT+BLDN".into()).await.map(drop)
    }

    /// Send an arbitrary command; returns the info lines of the response.
    pub async fn send_raw(&self, mac: &str, line: &str) -> Result<Vec<String>> {
        self.send(mac, line.trim().to_string()).await
    }

    pub async fn send_dtmf(&self, mac: &str, tone: char) -> Result<()> {
        let tone = at::dtmf_tone(tone)?;
        self.send(mac, format!("AT+VTS={}", tone)).await.map(drop)
    }

    pub async fn query_current_calls(&self, mac: &str) -> Result<Vec<CurrentCall>> {
        let info = self.send(mac, "AT+CLCC".into()).await?;
        Ok(info
            .iter()
            .filter_map(|line| match AtLine::parse(line) {
                Ok(AtLine::Clcc(call)) => Some(call),
                _ => None,
            })
            .collect())
    }

    pub async fn set_volume(&self, mac: &str, level: u8) -> Result<()> {
        let level = at::clamp_gain(level);
        self.send(mac, format!("AT+VGS={}", level)).await.map(drop)
    }

    pub async fn set_microphone_gain(&self, mac: &str, level: u8) -> Result<()> {
        let level = at::clamp_gain(level);
        self.send(mac, format!("AT+VGM={}", level)).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use futures::FutureExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;
    use crate::bluetooth::{PropertyMap, Value};

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    /// Scripted audio gateway. Answers every command after `delay`, and with
    /// `ERROR` for the commands listed in `fail`.
    #[derive(Clone, Copy)]
    struct Gateway {
        features: u32,
        fail: &'static [&'static str],
        delay: Duration,
    }

    impl Default for Gateway {
        /// Three-way calling and codec negotiation, no HF indicators.
        fn default() -> Self {
            Self {
                features: 513,
                fail: &[],
                delay: Duration::ZERO,
            }
        }
    }

    impl Gateway {
        fn reply(&self, command: &str) -> String {
            if self.fail.contains(&command) {
                return "\r\nERROR\r\n".to_string();
            }
            match command {
                c if c.starts_with("AT+BRSF=") => format!("\r\n+BRSF: {}\r\n\r\nOK\r\n", self.features),
                "AT+CIND=?" => "\r\n+CIND: (\"service\",(0,1)),(\"call\",(0,1)),(\"callsetup\",(0-3)),(\"callheld\",(0-2)),(\"battchg\",(0-5))\r\n\r\nOK\r\n".to_string(),
                "AT+CIND?" => "\r\n+CIND: 1,0,0,0,4\r\n\r\nOK\r\n".to_string(),
                "AT+CHLD=?" => "\r\n+CHLD: (0,1,2,3)\r\n\r\nOK\r\n".to_string(),
                "AT+COPS?" => "\r\n+COPS: 0,0,\"Carrier\"\r\n\r\nOK\r\n".to_string(),
                "AT+CLCC" => "\r\n+CLCC: 1,1,4,0,0,\"5551234\",129\r\n\r\nOK\r\n".to_string(),
                "ATD555;" => "\r\nBUSY\r\n".to_string(),
                _ => "\r\nOK\r\n".to_string(),
            }
        }

        /// Reports every command to `seen`, plus `OVERLAP` whenever the
        /// hands-free side sent more before the reply went out.
        async fn serve(self, stream: DuplexStream, seen: mpsc::UnboundedSender<String>) {
            let (mut reader, mut writer) = tokio::io::split(stream);
            let mut pending: Vec<u8> = Vec::new();
            let mut buf = [0u8; 512];
            loop {
                let Some(end) = pending.iter().position(|b| *b == b'\r') else {
                    match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => pending.extend_from_slice(&buf[..n]),
                    }
                    continue;
                };
                let raw: Vec<u8> = pending.drain(..=end).collect();
                let command = String::from_utf8_lossy(&raw).trim().to_string();
                if command.is_empty() {
                    continue;
                }
                let _ = seen.send(command.clone());

                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                    if let Some(Ok(n)) = reader.read(&mut buf).now_or_never() {
                        pending.extend_from_slice(&buf[..n]);
                    }
                    if !pending.is_empty() {
                        let _ = seen.send("OVERLAP".to_string());
                    }
                }
                if writer.write_all(self.reply(&command).as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }

    fn drain(seen: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut sent = Vec::new();
        while let Ok(command) = seen.try_recv() {
            sent.push(command);
        }
        sent
    }

    fn engine() -> Arc<HfpEngine> {
        HfpEngine::new(HfpConfig::default(), None)
    }

    async fn next_matching(
        events: &mut mpsc::UnboundedReceiver<HfpEvent>,
        wanted: impl Fn(&HfpEvent) -> bool,
    ) -> Vec<HfpEvent> {
        let mut seen = Vec::new();
        timeout(Duration::from_secs(120), async {
            while let Some(event) = events.recv().await {
                let done = wanted(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("event in time");
        seen
    }

    #[tokio::test]
    async fn test_handshake_reaches_connected() -> Result<()> {
        let engine = engine();
        let mut events = engine.subscribe();
        let (ours, theirs) = tokio::io::duplex(4096);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(Gateway::default().serve(theirs, seen_tx));

        engine.attach("aa:bb:cc:dd:ee:ff", ours)?;
        let events = next_matching(&mut events, |e| matches!(e, HfpEvent::Connected { .. })).await;

        assert_eq!(events.first(), Some(&HfpEvent::PreConnect { mac: MAC.into() }));
        assert!(events.contains(&HfpEvent::AgFeatures {
            mac: MAC.into(),
            features: 513
        }));
        assert!(events.contains(&HfpEvent::BatteryLevel {
            mac: MAC.into(),
            level: 4
        }));
        assert!(events.contains(&HfpEvent::OperatorName {
            mac: MAC.into(),
            name: "Carrier".into()
        }));
        assert!(events.iter().any(|e| matches!(e, HfpEvent::HoldModes { modes, .. } if modes.len() == 4)));

        assert_eq!(
            drain(&mut seen_rx),
            vec![
                "AT+BRSF=183",
                "AT+BAC=1,2",
                "AT+CIND=?",
                "AT+CIND?",
                "AT+CMER=3,0,0,1",
                "AT+CHLD=?",
                "AT+CLIP=1",
                "AT+CCWA=1",
                "AT+CMEE=1",
                "AT+COPS=3,0",
                "AT+COPS?",
            ]
        );
        assert_eq!(engine.connected(), vec![MAC.to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_required_step_failure_tears_down() -> Result<()> {
        let engine = engine();
        let mut events = engine.subscribe();
        let (ours, theirs) = tokio::io::duplex(4096);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let gateway = Gateway {
            fail: &["AT+CMER=3,0,0,1"],
            ..Gateway::default()
        };
        tokio::spawn(gateway.serve(theirs, seen_tx));

        engine.attach(MAC, ours)?;
        let events = next_matching(&mut events, |e| matches!(e, HfpEvent::Disconnected { .. })).await;

        assert!(!events.iter().any(|e| matches!(e, HfpEvent::Connected { .. })));
        assert_eq!(
            events.last(),
            Some(&HfpEvent::Disconnected {
                mac: MAC.into(),
                link_connected: false
            })
        );
        assert_eq!(
            drain(&mut seen_rx).last().map(String::as_str),
            Some("AT+CMER=3,0,0,1")
        );
        assert!(!engine.is_connected(MAC));
        Ok(())
    }

    #[tokio::test]
    async fn test_optional_step_failures_still_connect() -> Result<()> {
        let engine = engine();
        let mut events = engine.subscribe();
        let (ours, theirs) = tokio::io::duplex(4096);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        // Adds HF indicator support so the BIND step runs.
        let gateway = Gateway {
            features: 513 | 1024,
            fail: &["AT+BAC=1,2", "AT+CHLD=?", "AT+BIND=1,2"],
            ..Gateway::default()
        };
        tokio::spawn(gateway.serve(theirs, seen_tx));

        engine.attach(MAC, ours)?;
        let events = next_matching(&mut events, |e| {
            matches!(e, HfpEvent::Connected { .. } | HfpEvent::Disconnected { .. })
        })
        .await;

        assert_eq!(events.last(), Some(&HfpEvent::Connected { mac: MAC.into() }));
        assert!(!events.iter().any(|e| matches!(e, HfpEvent::HoldModes { .. })));
        let sent = drain(&mut seen_rx);
        assert!(sent.iter().any(|c| c == "AT+BAC=1,2"));
        assert!(sent.iter().any(|c| c == "AT+BIND=1,2"));
        assert!(!sent.iter().any(|c| c == "AT+BIND?"));
        assert_eq!(sent.last().map(String::as_str), Some("AT+COPS?"));
        assert!(engine.is_connected(MAC));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_polls_indicators() -> Result<()> {
        let engine = engine();
        let mut events = engine.subscribe();
        let (ours, theirs) = tokio::io::duplex(4096);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(Gateway::default().serve(theirs, seen_tx));

        engine.attach(MAC, ours)?;
        next_matching(&mut events, |e| matches!(e, HfpEvent::Connected { .. })).await;
        drain(&mut seen_rx);

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(drain(&mut seen_rx).is_empty());

        tokio::time::sleep(Duration::from_secs(22)).await;
        assert_eq!(drain(&mut seen_rx), vec!["AT+CIND?", "AT+CIND?"]);
        assert!(engine.is_connected(MAC));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_and_actions_never_overlap() -> Result<()> {
        let config = HfpConfig {
            keepalive_secs: 4,
            ..HfpConfig::default()
        };
        let engine = HfpEngine::new(config, None);
        let mut events = engine.subscribe();
        let (ours, theirs) = tokio::io::duplex(4096);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let gateway = Gateway {
            delay: Duration::from_secs(3),
            ..Gateway::default()
        };
        tokio::spawn(gateway.serve(theirs, seen_tx));

        engine.attach(MAC, ours)?;
        next_matching(&mut events, |e| matches!(e, HfpEvent::Connected { .. })).await;
        drain(&mut seen_rx);

        let later = |secs| tokio::time::sleep(Duration::from_secs(secs));
        let (answer, volume, calls, dial) = tokio::join!(
            engine.answer(MAC),
            async {
                later(5).await;
                engine.set_volume(MAC, 7).await
            },
            async {
                later(9).await;
                engine.query_current_calls(MAC).await
            },
            async {
                later(13).await;
                engine.dial(MAC, "123").await
            },
        );
        answer?;
        volume?;
        dial?;
        let calls = calls?;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].number.as_deref(), Some("5551234"));

        let sent = drain(&mut seen_rx);
        assert!(!sent.iter().any(|c| c == "OVERLAP"), "{:?}", sent);
        let keepalive = sent.iter().position(|c| c == "AT+CIND?");
        let clcc = sent.iter().position(|c| c == "AT+CLCC");
        assert!(keepalive.is_some() && keepalive < clcc, "{:?}", sent);
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnected_reports_link_state() -> Result<()> {
        let registry = Arc::new(DeviceRegistry::new());
        let props: PropertyMap = [("Connected".to_string(), Value::Bool(true))]
            .into_iter()
            .collect();
        registry.upsert("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF", &props)?;
        let engine = HfpEngine::new(HfpConfig::default(), Some(registry));
        let mut events = engine.subscribe();
        let (ours, theirs) = tokio::io::duplex(4096);
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(Gateway::default().serve(theirs, seen_tx));

        engine.attach(MAC, ours)?;
        next_matching(&mut events, |e| matches!(e, HfpEvent::Connected { .. })).await;
        engine.request_disconnection(MAC)?;
        let events = next_matching(&mut events, |e| matches!(e, HfpEvent::Disconnected { .. })).await;

        assert_eq!(
            events.last(),
            Some(&HfpEvent::Disconnected {
                mac: MAC.into(),
                link_connected: true
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_actions_after_handshake() -> Result<()> {
        let engine = engine();
        let mut events = engine.subscribe();
        let (ours, theirs) = tokio::io::duplex(4096);
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(Gateway::default().serve(theirs, seen_tx));

        // Not connected yet.
        assert!(matches!(engine.answer(MAC).await, Err(Error::NotConnected(_))));

        engine.attach(MAC, ours)?;
        next_matching(&mut events, |e| matches!(e, HfpEvent::Connected { .. })).await;

        engine.answer(MAC).await?;
        engine.set_volume(MAC, 99).await?;
        let calls = engine.query_current_calls(MAC).await?;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].number.as_deref(), Some("5551234"));

        match engine.dial(MAC, "5-5-5").await {
            Err(e) => assert!(e.is_transient()),
            Ok(()) => panic!("dial should report BUSY"),
        }
        assert!(engine.send_dtmf(MAC, 'x').await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_single_disconnected_on_close() -> Result<()> {
        let engine = engine();
        let mut events = engine.subscribe();
        let (ours, theirs) = tokio::io::duplex(4096);
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        let gateway = tokio::spawn(Gateway::default().serve(theirs, seen_tx));

        engine.attach(MAC, ours)?;
        next_matching(&mut events, |e| matches!(e, HfpEvent::Connected { .. })).await;

        // Peer goes away and the profile manager asks for disconnection too.
        gateway.abort();
        let _ = engine.request_disconnection(MAC);
        next_matching(&mut events, |e| matches!(e, HfpEvent::Disconnected { .. })).await;

        let _ = engine.request_disconnection(MAC);
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, HfpEvent::Disconnected { .. }));
        }
        assert!(!engine.is_connected(MAC));
        assert!(matches!(engine.hangup(MAC).await, Err(Error::NotConnected(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_replacement_keeps_new_connection() -> Result<()> {
        let engine = engine();
        let mut events = engine.subscribe();

        let (first, first_peer) = tokio::io::duplex(4096);
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(Gateway::default().serve(first_peer, seen_tx.clone()));
        engine.attach(MAC, first)?;
        next_matching(&mut events, |e| matches!(e, HfpEvent::Connected { .. })).await;

        let (second, second_peer) = tokio::io::duplex(4096);
        tokio::spawn(Gateway::default().serve(second_peer, seen_tx));
        engine.attach(MAC, second)?;
        let events = next_matching(&mut events, |e| matches!(e, HfpEvent::Connected { .. })).await;

        // The replaced actor's exit does not tear down the new slot.
        assert!(!events.iter().any(|e| matches!(e, HfpEvent::Disconnected { .. })));
        assert!(engine.is_connected(MAC));
        Ok(())
    }
}
