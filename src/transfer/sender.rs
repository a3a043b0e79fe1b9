//! Sender half of the transfer engine (spec §4.5.2).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::protocol::types::{
    Chunk, FileInfo, Message, TransferCancelled, TransferInfo, TransferRequest, TransferResponse,
};

/// Chunk size for streamed file contents (spec §4.5.2).
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Delay after emitting `TransferInfo` before the first chunk is allowed
/// onto the bulk sub-channel. Resolves the cross-channel race documented in
/// spec §5/§9 in favor of a sender-side delay rather than receiver-side
/// buffering.
pub const INFO_TO_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Seam the Sender uses to actually deliver messages to a peer; the Node
/// supplies the real implementation backed by its `PeerConnection` map.
#[async_trait]
pub trait PeerSink: Send + Sync + 'static {
    async fn send_to(&self, peer_id: &str, msg: Message) -> Result<(), EngineError>;
}

/// A snapshot of one file's send progress.
#[derive(Debug, Clone)]
pub struct FileProgress {
    pub size: u64,
    pub sent: u64,
}

/// Progress summary for a sender-side transfer (spec §4.5.2).
#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub percentages: HashMap<String, f32>,
    pub started: bool,
    pub done: bool,
}

struct SenderFile {
    size: u64,
    path: PathBuf,
    cursor: Arc<AtomicU64>,
}

struct SenderTransfer {
    recipients: HashSet<String>,
    authorized: HashSet<String>,
    files: HashMap<String, SenderFile>,
    cancel: Arc<AtomicBool>,
    /// Files whose streaming task hasn't finished yet. The transfer is
    /// removed from `Sender::transfers` once this reaches zero (spec §3:
    /// a sender-side `Transfer` is "removed on completion or cancel").
    remaining: Arc<AtomicU64>,
}

/// One file this process wants to send, as supplied by the caller.
pub struct FileSource {
    pub name: String,
    pub path: PathBuf,
}

/// Sends one or more files to one or more recipients, gated on unanimous
/// authorization (spec §4.5.2).
pub struct Sender {
    local_name: String,
    sink: Arc<dyn PeerSink>,
    transfers: Mutex<HashMap<Uuid, SenderTransfer>>,
    /// Set by `close()`; rejects new transfers once the Node is shutting
    /// down (spec §5: hierarchical cancellation of descendant tasks).
    closed: AtomicBool,
}

impl Sender {
    pub fn new(local_name: String, sink: Arc<dyn PeerSink>) -> Self {
        Self { local_name, sink, transfers: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    /// Starts a new transfer: records it with no authorized recipients yet
    /// and sends a `TransferRequest` to each one. Returns immediately.
    pub async fn start_transfer(
        &self,
        recipients: Vec<String>,
        files: Vec<FileSource>,
    ) -> Result<Uuid, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }

        let transfer_id = Uuid::new_v4();
        let num_files = files.len() as u64;
        let mut sender_files = HashMap::new();
        for f in files {
            let size = tokio::fs::metadata(&f.path).await?.len();
            sender_files.insert(
                f.name,
                SenderFile { size, path: f.path, cursor: Arc::new(AtomicU64::new(0)) },
            );
        }

        let transfer = SenderTransfer {
            recipients: recipients.iter().cloned().collect(),
            authorized: HashSet::new(),
            files: sender_files,
            cancel: Arc::new(AtomicBool::new(false)),
            remaining: Arc::new(AtomicU64::new(num_files)),
        };
        self.transfers.lock().expect("mutex poisoned").insert(transfer_id, transfer);

        let human_message = format!("{} wants to send you files", self.local_name);
        for recipient in &recipients {
            let req = Message::Request(TransferRequest {
                transfer_id,
                sender_name: self.local_name.clone(),
                human_message: human_message.clone(),
            });
            if let Err(e) = self.sink.send_to(recipient, req).await {
                warn!(%transfer_id, peer = %recipient, error = %e, "failed to send transfer request");
            }
        }

        Ok(transfer_id)
    }

    /// Cancels a transfer: notifies every recipient and drops local state.
    pub async fn cancel_transfer(&self, transfer_id: Uuid) {
        let transfer = self.transfers.lock().expect("mutex poisoned").remove(&transfer_id);
        let Some(transfer) = transfer else { return };
        transfer.cancel.store(true, Ordering::SeqCst);
        self.notify_cancelled(transfer_id, &transfer.recipients).await;
    }

    /// Cancels every in-flight transfer and refuses new ones from this
    /// point on (spec §5: hierarchical cancellation of descendant tasks on
    /// shutdown). Spawned streaming tasks observe the per-transfer cancel
    /// flag on their next loop iteration and exit.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let transfers: Vec<SenderTransfer> = self.transfers.lock().expect("mutex poisoned").drain().map(|(_, t)| t).collect();
        for transfer in transfers {
            transfer.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Called by a streaming task once its file has been fully sent (or had
    /// nothing to send). Removes the transfer once every file is accounted
    /// for.
    async fn finish_file_sent(&self, transfer_id: Uuid) {
        let done = {
            let transfers = self.transfers.lock().expect("mutex poisoned");
            match transfers.get(&transfer_id) {
                Some(transfer) => transfer.remaining.fetch_sub(1, Ordering::SeqCst) == 1,
                None => false,
            }
        };
        if done && self.transfers.lock().expect("mutex poisoned").remove(&transfer_id).is_some() {
            info!(%transfer_id, "transfer complete (all files sent)");
        }
    }

    async fn notify_cancelled(&self, transfer_id: Uuid, recipients: &HashSet<String>) {
        for recipient in recipients {
            let msg = Message::Cancelled(TransferCancelled { transfer_id });
            if let Err(e) = self.sink.send_to(recipient, msg).await {
                warn!(%transfer_id, peer = %recipient, error = %e, "failed to send cancellation");
            }
        }
    }

    /// Handles an incoming `TransferResponse`. A rejection cancels the whole
    /// transfer; unanimous acceptance emits `TransferInfo` and starts
    /// streaming.
    pub async fn on_transfer_response(self: &Arc<Self>, from_peer: &str, response: TransferResponse) {
        if !response.authorized {
            info!(transfer_id = %response.transfer_id, peer = %from_peer, "recipient rejected transfer");
            self.cancel_transfer(response.transfer_id).await;
            return;
        }

        let ready = {
            let mut transfers = self.transfers.lock().expect("mutex poisoned");
            let Some(transfer) = transfers.get_mut(&response.transfer_id) else { return };
            transfer.authorized.insert(from_peer.to_string());
            transfer.authorized == transfer.recipients
        };

        if ready {
            self.begin_streaming(response.transfer_id).await;
        }
    }

    async fn begin_streaming(self: &Arc<Self>, transfer_id: Uuid) {
        let (recipients, files, cancel) = {
            let transfers = self.transfers.lock().expect("mutex poisoned");
            let Some(transfer) = transfers.get(&transfer_id) else { return };
            let files: Vec<(String, u64, PathBuf, Arc<AtomicU64>)> = transfer
                .files
                .iter()
                .map(|(name, f)| (name.clone(), f.size, f.path.clone(), f.cursor.clone()))
                .collect();
            (transfer.recipients.clone(), files, transfer.cancel.clone())
        };

        let info = TransferInfo {
            transfer_id,
            sender_name: self.local_name.clone(),
            files: files.iter().map(|(name, size, _, _)| FileInfo { name: name.clone(), size: *size }).collect(),
        };
        for recipient in &recipients {
            if let Err(e) = self.sink.send_to(recipient, Message::Info(info.clone())).await {
                warn!(%transfer_id, peer = %recipient, error = %e, "failed to send transfer info");
            }
        }

        if files.is_empty() {
            if self.transfers.lock().expect("mutex poisoned").remove(&transfer_id).is_some() {
                info!(%transfer_id, "transfer complete (no files)");
            }
            return;
        }

        tokio::time::sleep(INFO_TO_CHUNK_DELAY).await;

        for (name, size, path, cursor) in files {
            let sink = self.sink.clone();
            let recipients = recipients.clone();
            let cancel = cancel.clone();
            let sender = self.clone();
            tokio::spawn(async move {
                let completed = stream_file(transfer_id, name, size, path, cursor, recipients, cancel, sink).await;
                if completed {
                    sender.finish_file_sent(transfer_id).await;
                }
            });
        }
    }

    /// Progress snapshot for a live transfer (spec §4.5.2); `None` if it has
    /// already completed or been cancelled.
    pub fn progress_report(&self, transfer_id: Uuid) -> Option<ProgressReport> {
        let transfers = self.transfers.lock().expect("mutex poisoned");
        let transfer = transfers.get(&transfer_id)?;
        let mut percentages = HashMap::new();
        let mut started = true;
        let mut done = true;
        for (name, file) in &transfer.files {
            let sent = file.cursor.load(Ordering::SeqCst);
            let pct = if file.size == 0 { 100.0 } else { (sent as f32 / file.size as f32) * 100.0 };
            percentages.insert(name.clone(), pct);
            started &= sent > 0;
            done &= sent == file.size;
        }
        Some(ProgressReport { percentages, started, done })
    }
}

/// Streams one file's contents in `CHUNK_SIZE` pieces. Returns `true` once
/// every declared byte has been handed to the sink (including the trivial
/// zero-size case), `false` if streaming was cut short by cancellation or
/// an I/O error.
#[allow(clippy::too_many_arguments)]
async fn stream_file(
    transfer_id: Uuid,
    filename: String,
    size: u64,
    path: PathBuf,
    cursor: Arc<AtomicU64>,
    recipients: HashSet<String>,
    cancel: Arc<AtomicBool>,
    sink: Arc<dyn PeerSink>,
) -> bool {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(%transfer_id, file = %filename, error = %e, "failed to open file for streaming");
            return false;
        }
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let offset = cursor.load(Ordering::SeqCst);
        if offset >= size {
            return true;
        }
        let n = match file.read(&mut buf).await {
            Ok(0) => return true,
            Ok(n) => n,
            Err(e) => {
                warn!(%transfer_id, file = %filename, error = %e, "read error while streaming");
                return false;
            }
        };

        let chunk = Chunk { transfer_id, filename: filename.clone(), offset, data: buf[..n].to_vec() };
        cursor.fetch_add(n as u64, Ordering::SeqCst);

        for recipient in &recipients {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            let msg = Message::Chunk(chunk.clone());
            if let Err(e) = sink.send_to(recipient, msg).await {
                warn!(%transfer_id, peer = %recipient, error = %e, "failed to send chunk");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::NamedTempFile;

    struct RecordingSink {
        sent: Arc<StdMutex<Vec<(String, Message)>>>,
    }

    #[async_trait]
    impl PeerSink for RecordingSink {
        async fn send_to(&self, peer_id: &str, msg: Message) -> Result<(), EngineError> {
            self.sent.lock().unwrap().push((peer_id.to_string(), msg));
            Ok(())
        }
    }

    #[tokio::test]
    async fn unanimous_acceptance_emits_info_then_chunks() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { sent: sent.clone() });
        let sender = Arc::new(Sender::new("alice".into(), sink));

        let mut tmp = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, &vec![7u8; 10]).unwrap();

        let id = sender
            .start_transfer(
                vec!["bob".into()],
                vec![FileSource { name: "f.bin".into(), path: tmp.path().to_path_buf() }],
            )
            .await
            .unwrap();

        sender.on_transfer_response("bob", TransferResponse { transfer_id: id, authorized: true }).await;

        // Give the spawned chunk task and the info-to-chunk delay time to run.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let log = sent.lock().unwrap();
        assert!(matches!(log[0].1, Message::Request(_)));
        assert!(matches!(log[1].1, Message::Info(_)));
        assert!(log.iter().any(|(_, m)| matches!(m, Message::Chunk(_))));
        drop(log);

        // The completed transfer is removed, matching the receiver side.
        assert!(sender.progress_report(id).is_none());
    }

    #[tokio::test]
    async fn rejection_cancels_without_sending_info() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { sent: sent.clone() });
        let sender = Arc::new(Sender::new("alice".into(), sink));

        let mut tmp = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, &vec![1u8; 4]).unwrap();

        let id = sender
            .start_transfer(
                vec!["bob".into()],
                vec![FileSource { name: "f.bin".into(), path: tmp.path().to_path_buf() }],
            )
            .await
            .unwrap();

        sender.on_transfer_response("bob", TransferResponse { transfer_id: id, authorized: false }).await;

        let log = sent.lock().unwrap();
        assert!(log.iter().any(|(_, m)| matches!(m, Message::Cancelled(_))));
        assert!(!log.iter().any(|(_, m)| matches!(m, Message::Info(_))));
        assert!(sender.progress_report(id).is_none());
    }

    #[tokio::test]
    async fn close_cancels_in_flight_transfers() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { sent: sent.clone() });
        let sender = Arc::new(Sender::new("alice".into(), sink));

        let mut tmp = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, &vec![3u8; CHUNK_SIZE * 4]).unwrap();

        let id = sender
            .start_transfer(
                vec!["bob".into()],
                vec![FileSource { name: "f.bin".into(), path: tmp.path().to_path_buf() }],
            )
            .await
            .unwrap();
        sender.on_transfer_response("bob", TransferResponse { transfer_id: id, authorized: true }).await;

        sender.close().await;
        assert!(sender.progress_report(id).is_none());

        // Closed, so new transfers are rejected too.
        let err = sender.start_transfer(vec!["bob".into()], vec![]).await.unwrap_err();
        assert!(matches!(err, EngineError::Shutdown));
    }

    #[tokio::test]
    async fn empty_file_list_completes_immediately() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink { sent: sent.clone() });
        let sender = Arc::new(Sender::new("alice".into(), sink));

        let id = sender.start_transfer(vec!["bob".into()], vec![]).await.unwrap();
        sender.on_transfer_response("bob", TransferResponse { transfer_id: id, authorized: true }).await;

        assert!(sender.progress_report(id).is_none());
    }
}
