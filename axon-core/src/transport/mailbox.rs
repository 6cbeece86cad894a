//! Shared-storage mailbox transport.
//!
//! Each peer owns a subdirectory of the mailbox root; each message is one
//! file named `<message_id>.json`, written via temp-file + atomic rename so
//! the poller never observes a partial write. Lowest priority of the three
//! transports, but durable: a message survives until its recipient scans it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axon_types::{codec, Envelope, BROADCAST};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{StatsSnapshot, Transport, TransportError, TransportStats};

pub const NAME: &str = "mailbox";

pub struct MailboxTransport {
    node_id: String,
    root: PathBuf,
    stats: Arc<TransportStats>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MailboxTransport {
    /// Create the transport and start polling this node's inbox.
    pub async fn start(
        node_id: impl Into<String>,
        root: impl Into<PathBuf>,
        poll_interval: std::time::Duration,
        intake: mpsc::Sender<Envelope>,
    ) -> Result<Arc<Self>, TransportError> {
        let node_id = node_id.into();
        let root = root.into();
        let inbox = root.join(&node_id);
        tokio::fs::create_dir_all(&inbox)
            .await
            .map_err(|e| io_error(e))?;

        let stats = Arc::new(TransportStats::default());
        let transport = Arc::new(Self {
            node_id,
            root,
            stats: stats.clone(),
            poller: Mutex::new(None),
        });

        let handle = tokio::spawn({
            let stats = stats.clone();
            async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if scan_inbox(&inbox, &intake, &stats).await.is_err() {
                        break;
                    }
                }
            }
        });
        *transport.poller.lock().await = Some(handle);

        Ok(transport)
    }

    async fn write_message(&self, dir: &Path, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = codec::encode(envelope)?;
        tokio::fs::create_dir_all(dir).await.map_err(io_error)?;

        let tmp = dir.join(format!(".{}.tmp", envelope.message_id));
        let target = dir.join(format!("{}.json", envelope.message_id));
        tokio::fs::write(&tmp, &bytes).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &target).await.map_err(io_error)?;
        Ok(())
    }

    async fn peer_inboxes(&self) -> Result<Vec<PathBuf>, TransportError> {
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(io_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            if path.is_dir() && entry.file_name() != std::ffi::OsStr::new(&self.node_id) {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }
}

/// Inbox scan: decode-and-consume every complete message file, oldest id
/// first (ULIDs sort by creation time). Malformed files are logged and
/// removed, never allowed to wedge the poller.
async fn scan_inbox(
    inbox: &Path,
    intake: &mpsc::Sender<Envelope>,
    stats: &TransportStats,
) -> Result<(), ()> {
    let mut entries = match tokio::fs::read_dir(inbox).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "mailbox inbox not readable");
            return Ok(());
        }
    };

    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        files.push(path);
    }
    files.sort();

    for path in files {
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "mailbox file vanished mid-scan");
                continue;
            }
        };
        let _ = tokio::fs::remove_file(&path).await;

        match codec::decode(&bytes) {
            Ok(envelope) => {
                stats.record_received();
                if intake.send(envelope).await.is_err() {
                    // Router gone; stop polling.
                    return Err(());
                }
            }
            Err(e) => {
                stats.record_error();
                warn!(path = %path.display(), error = %e, "dropping malformed mailbox message");
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Transport for MailboxTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if envelope.recipient_id == BROADCAST {
            for dir in self.peer_inboxes().await? {
                if let Err(e) = self.write_message(&dir, envelope).await {
                    self.stats.record_error();
                    warn!(dir = %dir.display(), error = %e, "mailbox broadcast delivery failed");
                }
            }
        } else {
            let dir = self.root.join(&envelope.recipient_id);
            self.write_message(&dir, envelope).await.map_err(|e| {
                self.stats.record_error();
                e
            })?;
        }
        self.stats.record_sent();
        Ok(())
    }

    async fn probe(&self) -> bool {
        let marker = self.root.join(format!(".probe-{}", self.node_id));
        let ok = tokio::fs::write(&marker, b"probe").await.is_ok();
        let _ = tokio::fs::remove_file(&marker).await;
        ok
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.poller.lock().await.take() {
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
