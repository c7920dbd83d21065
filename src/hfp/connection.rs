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

//! Per-connection actor.
//!
//! Owns the channel and the [`Session`]; everything else talks to it through
//! a [`ConnectionHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::queue::{CommandResponse, PendingCommand};
use super::session::{Outputs, Session};
use crate::error::{Error, Result};
use crate::events::{EventBus, HfpEvent};

const KEEPALIVE_COMMAND: &str = "AT+CIND?";

enum Request {
    Command {
        line: String,
        reply: oneshot::Sender<Result<CommandResponse>>,
    },
    SlcEstablished,
    Disconnect,
}

/// Cheap, cloneable reference to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    mac: String,
    tx: mpsc::UnboundedSender<Request>,
    ready: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// Whether the service level connection is up.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a command and wait for its completion.
    pub async fn command(&self, line: impl Into<String>) -> Result<CommandResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Command {
                line: line.into(),
                reply,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    pub(crate) fn slc_established(&self) {
        let _ = self.tx.send(Request::SlcEstablished);
    }

    /// Ask the actor to shut down. A no-op once it is gone.
    pub fn close(&self) {
        let _ = self.tx.send(Request::Disconnect);
    }
}

/// Settings of one connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub command_timeout: Duration,
    pub keepalive: Duration,
}

/// Start the actor for `stream`. `on_exit` runs exactly once after the
/// actor has stopped and rejected all pending commands.
pub fn spawn<S, F>(
    id: u64,
    mac: &str,
    stream: S,
    options: ConnectionOptions,
    events: Arc<EventBus<HfpEvent>>,
    on_exit: F,
) -> (ConnectionHandle, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let ready = Arc::new(AtomicBool::new(false));
    let handle = ConnectionHandle {
        id,
        mac: mac.to_string(),
        tx,
        ready: ready.clone(),
    };

    let actor = Actor {
        session: Session::new(mac, options.command_timeout),
        keepalive_period: options.keepalive,
        rx,
        ready,
        events,
    };
    let task = tokio::spawn(async move {
        actor.run(stream).await;
        on_exit();
    });
    (handle, task)
}

struct Actor {
    session: Session,
    keepalive_period: Duration,
    rx: mpsc::UnboundedReceiver<Request>,
    ready: Arc<AtomicBool>,
    events: Arc<EventBus<HfpEvent>>,
}

impl Actor {
    async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mac = self.session.mac().to_string();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = [0u8; 1024];
        let mut keepalive: Option<Interval> = None;

        loop {
            let deadline = self.session.deadline();
            let out = tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("[{}] Channel closed by peer", mac);
                        break;
                    }
                    Ok(n) => self.session.feed(&buf[..n], Instant::now()),
                    Err(e) => {
                        warn!("[{}] Channel read failed: {}", mac, e);
                        break;
                    }
                },
                request = self.rx.recv() => match request {
                    Some(Request::Command { line, reply }) => self
                        .session
                        .enqueue(PendingCommand::new(line, Some(reply)), Instant::now()),
                    Some(Request::SlcEstablished) => {
                        self.ready.store(true, Ordering::SeqCst);
                        let mut interval = tokio::time::interval_at(
                            Instant::now() + self.keepalive_period,
                            self.keepalive_period,
                        );
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        keepalive = Some(interval);
                        info!("[{}] Service level connection established", mac);
                        Outputs {
                            events: vec![HfpEvent::Connected { mac: mac.clone() }],
                            ..Default::default()
                        }
                    }
                    Some(Request::Disconnect) | None => {
                        info!("[{}] Disconnect requested", mac);
                        break;
                    }
                },
                _ = sleep_until(deadline) => self.session.expire(Instant::now()),
                _ = tick(&mut keepalive) => {
                    debug!("[{}] keepalive", mac);
                    self.session
                        .enqueue(PendingCommand::new(KEEPALIVE_COMMAND, None), Instant::now())
                }
            };

            if let Err(e) = self.flush(&mut writer, out).await {
                warn!("[{}] Channel write failed: {}", mac, e);
                break;
            }
        }

        self.ready.store(false, Ordering::SeqCst);
        self.session.close();
        // Teardown errors are irrelevant.
        let _ = writer.shutdown().await;
    }

    async fn flush<W: AsyncWrite>(&self, writer: &mut WriteHalf<W>, out: Outputs) -> Result<()> {
        for wire in out.writes {
            writer.write_all(wire.as_bytes()).await?;
        }
        writer.flush().await?;
        for event in out.events {
            self.events.emit(event);
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
