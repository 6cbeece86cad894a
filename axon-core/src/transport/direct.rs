//! Point-to-point transport over a local TCP listener.
//!
//! No external dependency: each peer runs its own listener and envelopes
//! travel as single-line JSON frames. Outbound delivery only works when the
//! peer's address is known, so peers are registered explicitly via
//! [`DirectTransport::add_peer`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axon_types::{codec, Envelope, BROADCAST};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use super::{StatsSnapshot, Transport, TransportError, TransportStats};

pub const NAME: &str = "direct";

pub struct DirectTransport {
    local_addr: SocketAddr,
    peers: RwLock<HashMap<String, SocketAddr>>,
    stats: Arc<TransportStats>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl DirectTransport {
    /// Bind the listener and start accepting inbound connections.
    pub async fn start(
        bind_addr: &str,
        intake: mpsc::Sender<Envelope>,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(bind_addr).await.map_err(io_error)?;
        let local_addr = listener.local_addr().map_err(io_error)?;
        let stats = Arc::new(TransportStats::default());

        let handle = tokio::spawn({
            let stats = stats.clone();
            async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            tokio::spawn(read_connection(
                                stream,
                                remote,
                                intake.clone(),
                                stats.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "direct listener accept failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            local_addr,
            peers: RwLock::new(HashMap::new()),
            stats,
            acceptor: Mutex::new(Some(handle)),
        }))
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn add_peer(&self, peer_id: impl Into<String>, addr: SocketAddr) {
        self.peers.write().await.insert(peer_id.into(), addr);
    }

    pub async fn remove_peer(&self, peer_id: &str) {
        self.peers.write().await.remove(peer_id);
    }

    async fn deliver(&self, addr: SocketAddr, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = codec::encode(envelope)?;
        let line = String::from_utf8(bytes).map_err(|e| TransportError::Io {
            transport: NAME,
            message: e.to_string(),
        })?;

        let stream = TcpStream::connect(addr).await.map_err(io_error)?;
        let mut framed = FramedWrite::new(stream, LinesCodec::new());
        framed.send(line).await.map_err(|e| TransportError::Io {
            transport: NAME,
            message: e.to_string(),
        })?;
        Ok(())
    }
}

async fn read_connection(
    stream: TcpStream,
    remote: SocketAddr,
    intake: mpsc::Sender<Envelope>,
    stats: Arc<TransportStats>,
) {
    let mut framed = FramedRead::new(stream, LinesCodec::new());
    while let Some(item) = framed.next().await {
        let line = match item {
            Ok(line) => line,
            Err(e) => {
                debug!(%remote, error = %e, "direct connection read failed");
                return;
            }
        };
        match codec::decode(line.as_bytes()) {
            Ok(envelope) => {
                stats.record_received();
                if intake.send(envelope).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                stats.record_error();
                warn!(%remote, error = %e, "dropping malformed direct frame");
            }
        }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if envelope.recipient_id == BROADCAST {
            let peers: Vec<SocketAddr> = self.peers.read().await.values().copied().collect();
            // A broadcast that can reach nobody must fail so the fallback
            // coordinator tries a transport that can.
            if peers.is_empty() {
                return Err(TransportError::UnknownPeer {
                    transport: NAME,
                    peer: BROADCAST.to_string(),
                });
            }
            for addr in peers {
                if let Err(e) = self.deliver(addr, envelope).await {
                    self.stats.record_error();
                    warn!(%addr, error = %e, "direct broadcast delivery failed");
                }
            }
        } else {
            let addr = {
                let peers = self.peers.read().await;
                peers.get(&envelope.recipient_id).copied()
            };
            let addr = addr.ok_or_else(|| TransportError::UnknownPeer {
                transport: NAME,
                peer: envelope.recipient_id.clone(),
            })?;
            self.deliver(addr, envelope).await.map_err(|e| {
                self.stats.record_error();
                e
            })?;
        }
        self.stats.record_sent();
        Ok(())
    }

    async fn probe(&self) -> bool {
        // Healthy while the accept loop is running: the listener is the only
        // resource this transport owns.
        self.acceptor
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.acceptor.lock().await.take() {
            handle.abort();
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

fn io_error(e: std::io::Error) -> TransportError {
    TransportError::Io {
        transport: NAME,
        message: e.to_string(),
    }
}
