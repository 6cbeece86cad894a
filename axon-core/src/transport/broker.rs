//! Publish/subscribe client for the external broker process.
//!
//! Highest-priority transport. The broker speaks line-framed JSON: this
//! client publishes envelopes under `peer.<recipient>` topics (broadcasts
//! keep their own topic) and subscribes to its own peer topic plus the
//! advertisement channel. Reconnection — including a credential or address
//! change via [`BrokerTransport::reconnect`] — happens while holding the
//! writer lock, so concurrent senders wait out the swap instead of failing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axon_types::{topic, Envelope, BROADCAST};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use super::{StatsSnapshot, Transport, TransportError, TransportStats};

pub const NAME: &str = "broker";

const PONG_TIMEOUT: Duration = Duration::from_secs(2);

/// One line on the broker connection, either direction.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    Subscribe { topic: String },
    Publish { topic: String, envelope: Envelope },
    Message { topic: String, envelope: Envelope },
    Ping,
    Pong,
}

pub struct BrokerTransport {
    node_id: String,
    addr: Mutex<String>,
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, LinesCodec>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<HashSet<String>>,
    pong: Arc<Notify>,
    intake: mpsc::Sender<Envelope>,
    stats: Arc<TransportStats>,
}

impl BrokerTransport {
    /// Create the client and make a first connection attempt. A missing
    /// broker is not an error here — the transport just reports unhealthy
    /// until a probe succeeds.
    pub async fn start(
        node_id: impl Into<String>,
        addr: impl Into<String>,
        intake: mpsc::Sender<Envelope>,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let mut subscriptions = HashSet::new();
        subscriptions.insert(peer_topic(&node_id));
        subscriptions.insert(topic::ADVERTISE.to_string());

        let transport = Arc::new(Self {
            node_id,
            addr: Mutex::new(addr.into()),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            subscriptions: Mutex::new(subscriptions),
            pong: Arc::new(Notify::new()),
            intake,
            stats: Arc::new(TransportStats::default()),
        });

        if !transport.connect().await {
            debug!(transport = NAME, "broker unreachable at startup");
        }
        transport
    }

    /// Establish (or re-establish) the connection. Holds the writer lock
    /// for the whole handshake: concurrent senders block, they are not
    /// rejected.
    async fn connect(&self) -> bool {
        let mut writer_guard = self.writer.lock().await;
        let addr = self.addr.lock().await.clone();

        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%addr, error = %e, "broker connect failed");
                *writer_guard = None;
                return false;
            }
        };
        let (read_half, write_half) = stream.into_split();

        if let Some(old) = self.reader.lock().await.take() {
            old.abort();
        }
        let handle = tokio::spawn(read_loop(
            FramedRead::new(read_half, LinesCodec::new()),
            self.intake.clone(),
            self.stats.clone(),
            self.pong.clone(),
        ));
        *self.reader.lock().await = Some(handle);

        let mut writer = FramedWrite::new(write_half, LinesCodec::new());
        let topics: Vec<String> = self.subscriptions.lock().await.iter().cloned().collect();
        for topic in topics {
            let frame = BrokerFrame::Subscribe { topic };
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!(error = %e, "broker resubscribe failed");
                *writer_guard = None;
                return false;
            }
        }

        *writer_guard = Some(writer);
        info!(node = %self.node_id, %addr, "broker connection established");
        true
    }

    /// Swap the underlying connection, optionally to a new address.
    pub async fn reconnect(&self, new_addr: Option<String>) -> bool {
        if let Some(addr) = new_addr {
            *self.addr.lock().await = addr;
        }
        self.connect().await
    }

    /// Subscribe to an additional broker topic.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<(), TransportError> {
        let topic = topic.into();
        self.subscriptions.lock().await.insert(topic.clone());
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = write_frame(writer, &BrokerFrame::Subscribe { topic }).await {
                *guard = None;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn send_frame(&self, frame: &BrokerFrame) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(TransportError::Disconnected { transport: NAME })?;
        if let Err(e) = write_frame(writer, frame).await {
            *guard = None;
            return Err(e);
        }
        Ok(())
    }
}

fn peer_topic(node_id: &str) -> String {
    format!("peer.{node_id}")
}

async fn write_frame(
    writer: &mut FramedWrite<OwnedWriteHalf, LinesCodec>,
    frame: &BrokerFrame,
) -> Result<(), TransportError> {
    let line = serde_json::to_string(frame).map_err(|e| TransportError::Io {
        transport: NAME,
        message: e.to_string(),
    })?;
    writer.send(line).await.map_err(|e| TransportError::Io {
        transport: NAME,
        message: e.to_string(),
    })
}

async fn read_loop(
    mut framed: FramedRead<OwnedReadHalf, LinesCodec>,
    intake: mpsc::Sender<Envelope>,
    stats: Arc<TransportStats>,
    pong: Arc<Notify>,
) {
    while let Some(item) = framed.next().await {
        let line = match item {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "broker connection read failed");
                return;
            }
        };
        match serde_json::from_str::<BrokerFrame>(&line) {
            Ok(BrokerFrame::Message { envelope, .. }) => {
                stats.record_received();
                if intake.send(envelope).await.is_err() {
                    return;
                }
            }
            Ok(BrokerFrame::Pong) => {
                pong.notify_waiters();
            }
            Ok(_) => {}
            Err(e) => {
                stats.record_error();
                warn!(error = %e, "dropping malformed broker frame");
            }
        }
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let topic = if envelope.recipient_id == BROADCAST {
            envelope.topic.clone()
        } else {
            peer_topic(&envelope.recipient_id)
        };
        let frame = BrokerFrame::Publish {
            topic,
            envelope: envelope.clone(),
        };
        self.send_frame(&frame).await.map_err(|e| {
            self.stats.record_error();
            e
        })?;
        self.stats.record_sent();
        Ok(())
    }

    async fn probe(&self) -> bool {
        if self.writer.lock().await.is_none() && !self.connect().await {
            return false;
        }

        let pong = self.pong.notified();
        tokio::pin!(pong);
        if self.send_frame(&BrokerFrame::Ping).await.is_err() {
            return false;
        }
        tokio::time::timeout(PONG_TIMEOUT, pong).await.is_ok()
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        *self.writer.lock().await = None;
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
