//! Receiver half of the transfer engine (spec §4.5.3).

use std::collections::HashMap;
use std::path::PathBuf;

use memmap2::MmapMut;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::protocol::types::{Chunk, NotifyCompletion, TransferInfo};

use super::file;

struct ReceiverFile {
    size: u64,
    received: u64,
    map: Option<MmapMut>,
    path: PathBuf,
}

impl ReceiverFile {
    fn done(&self) -> bool {
        self.size == 0 || self.received >= self.size
    }
}

struct ReceiverTransfer {
    sender: String,
    files: HashMap<String, ReceiverFile>,
}

/// Notable events the Receiver surfaces to the Node.
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    NotifyCompletion(NotifyCompletion),
}

/// Writes incoming chunks into pre-sized, memory-mapped files (spec
/// §4.5.3). All mutating operations serialize through a single internal
/// mutex, matching the shared-resource policy in spec §5.
pub struct Receiver {
    download_dir: PathBuf,
    transfers: Mutex<HashMap<Uuid, ReceiverTransfer>>,
    events: mpsc::Sender<ReceiverEvent>,
}

impl Receiver {
    pub fn new(download_dir: PathBuf, events: mpsc::Sender<ReceiverEvent>) -> Self {
        Self { download_dir, transfers: Mutex::new(HashMap::new()), events }
    }

    /// Creates the receiver-side transfer and pre-allocates every declared
    /// file.
    ///
    /// A second `TransferInfo` for an id we already know is a protocol
    /// violation (spec §9, "Open question — duplicate transfers"), not a
    /// silently-accepted retransmit: the caller is expected to close the
    /// offending peer connection.
    pub async fn on_transfer_info(&self, from_peer: &str, info: TransferInfo) -> Result<(), EngineError> {
        {
            let transfers = self.transfers.lock().await;
            if transfers.contains_key(&info.transfer_id) {
                return Err(EngineError::Protocol(format!("duplicate transfer id {}", info.transfer_id)));
            }
        }

        let mut files = HashMap::new();
        for f in &info.files {
            let path = self.download_dir.join(&f.name);
            let map = file::open_for_receive(&path, f.size)?;
            files.insert(f.name.clone(), ReceiverFile { size: f.size, received: 0, map, path });
        }

        let mut transfers = self.transfers.lock().await;
        transfers.insert(info.transfer_id, ReceiverTransfer { sender: from_peer.to_string(), files });
        drop(transfers);

        // A transfer consisting entirely of zero-byte files is done the
        // instant its info arrives, since no chunk will ever follow
        // (spec §8: "A file of size 0 ... is reported done immediately").
        self.check_completion(info.transfer_id).await;
        Ok(())
    }

    /// Writes one chunk into its file's mapped region. Silently dropped if
    /// the transfer or file is unknown (already cancelled in flight).
    /// Writing the same `[offset, offset+len)` range twice is idempotent.
    pub async fn on_chunk(&self, chunk: Chunk) {
        let mut transfers = self.transfers.lock().await;
        let Some(transfer) = transfers.get_mut(&chunk.transfer_id) else { return };
        let Some(file) = transfer.files.get_mut(&chunk.filename) else { return };
        let Some(map) = file.map.as_mut() else { return };

        let start = chunk.offset as usize;
        let end = start + chunk.data.len();
        if end > map.len() {
            warn!(transfer_id = %chunk.transfer_id, file = %chunk.filename, "chunk extends past declared file size, dropping");
            return;
        }
        map[start..end].copy_from_slice(&chunk.data);
        file.received = file.received.max(chunk.offset + chunk.data.len() as u64);

        let is_done = file.size == 0 || file.received >= file.size;
        if is_done {
            if let Err(e) = map.flush() {
                warn!(transfer_id = %chunk.transfer_id, file = %chunk.filename, error = %e, "flush failed");
            }
            file.map = None; // drop unmaps
        }

        drop(transfers);
        self.check_completion(chunk.transfer_id).await;
    }

    /// If every file in `transfer_id` is done, removes the transfer and
    /// emits `NotifyCompletion`. No-op if the transfer is unknown or still
    /// in progress.
    async fn check_completion(&self, transfer_id: Uuid) {
        let mut transfers = self.transfers.lock().await;
        let Some(transfer) = transfers.get(&transfer_id) else { return };
        if !transfer.files.values().all(ReceiverFile::done) {
            return;
        }
        let sender = transfer.sender.clone();
        let num_files = transfer.files.len() as u32;
        transfers.remove(&transfer_id);
        drop(transfers);

        info!(%transfer_id, %sender, num_files, "transfer complete");
        let _ = self
            .events
            .send(ReceiverEvent::NotifyCompletion(NotifyCompletion {
                message: format!("Received {num_files} files from {sender}"),
                sender,
                num_files,
            }))
            .await;
    }

    /// Cancels a transfer: unmaps and deletes every partial file.
    pub async fn on_cancel(&self, transfer_id: Uuid) {
        let mut transfers = self.transfers.lock().await;
        let Some(transfer) = transfers.remove(&transfer_id) else { return };
        Self::discard(transfer);
    }

    /// Equivalent to cancelling every transfer whose sender is `peer_id`
    /// (spec §4.5.3, peer-removed handling).
    pub async fn on_peer_removed(&self, peer_id: &str) {
        let mut transfers = self.transfers.lock().await;
        let stale: Vec<Uuid> =
            transfers.iter().filter(|(_, t)| t.sender == peer_id).map(|(id, _)| *id).collect();
        for id in stale {
            if let Some(t) = transfers.remove(&id) {
                Self::discard(t);
            }
        }
    }

    fn discard(transfer: ReceiverTransfer) {
        for (_, file) in transfer.files {
            drop(file.map); // unmap before removing the backing file
            let _ = std::fs::remove_file(&file.path);
        }
    }

    /// Flushes and unmaps every live file without deleting anything —
    /// partial files persist on disk (spec §4.5.3).
    pub async fn close(&self) {
        let mut transfers = self.transfers.lock().await;
        for (_, transfer) in transfers.drain() {
            for (_, mut file) in transfer.files {
                if let Some(map) = file.map.as_mut() {
                    let _ = map.flush();
                }
                file.map = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::FileInfo;
    use tempfile::tempdir;

    fn make_receiver(dir: &std::path::Path) -> (Receiver, mpsc::Receiver<ReceiverEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (Receiver::new(dir.to_path_buf(), tx), rx)
    }

    #[tokio::test]
    async fn full_file_write_emits_completion() {
        let dir = tempdir().unwrap();
        let (receiver, mut events) = make_receiver(dir.path());

        let transfer_id = Uuid::new_v4();
        receiver
            .on_transfer_info(
                "alice",
                TransferInfo {
                    transfer_id,
                    sender_name: "alice".into(),
                    files: vec![FileInfo { name: "hello.bin".into(), size: 8 }],
                },
            )
            .await
            .unwrap();

        receiver
            .on_chunk(Chunk { transfer_id, filename: "hello.bin".into(), offset: 0, data: vec![1, 2, 3, 4] })
            .await;
        receiver
            .on_chunk(Chunk { transfer_id, filename: "hello.bin".into(), offset: 4, data: vec![5, 6, 7, 8] })
            .await;

        let event = events.recv().await.unwrap();
        match event {
            ReceiverEvent::NotifyCompletion(n) => {
                assert_eq!(n.sender, "alice");
                assert_eq!(n.num_files, 1);
            }
        }

        let contents = std::fs::read(dir.path().join("hello.bin")).unwrap();
        assert_eq!(contents, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn duplicate_chunk_is_idempotent() {
        let dir = tempdir().unwrap();
        let (receiver, _events) = make_receiver(dir.path());
        let transfer_id = Uuid::new_v4();
        receiver
            .on_transfer_info(
                "alice",
                TransferInfo { transfer_id, sender_name: "alice".into(), files: vec![FileInfo { name: "f".into(), size: 4 }] },
            )
            .await
            .unwrap();
        let chunk = Chunk { transfer_id, filename: "f".into(), offset: 0, data: vec![9, 9, 9, 9] };
        receiver.on_chunk(chunk.clone()).await;
        receiver.on_chunk(chunk).await;
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), vec![9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn cancel_removes_partial_file() {
        let dir = tempdir().unwrap();
        let (receiver, _events) = make_receiver(dir.path());
        let transfer_id = Uuid::new_v4();
        receiver
            .on_transfer_info(
                "alice",
                TransferInfo { transfer_id, sender_name: "alice".into(), files: vec![FileInfo { name: "f".into(), size: 100 }] },
            )
            .await
            .unwrap();
        receiver.on_chunk(Chunk { transfer_id, filename: "f".into(), offset: 0, data: vec![1, 2] }).await;
        receiver.on_cancel(transfer_id).await;
        assert!(!dir.path().join("f").exists());
    }

    #[tokio::test]
    async fn duplicate_transfer_id_is_rejected() {
        let dir = tempdir().unwrap();
        let (receiver, _events) = make_receiver(dir.path());
        let transfer_id = Uuid::new_v4();
        let info = TransferInfo { transfer_id, sender_name: "alice".into(), files: vec![FileInfo { name: "f".into(), size: 4 }] };
        receiver.on_transfer_info("alice", info.clone()).await.unwrap();
        let err = receiver.on_transfer_info("alice", info).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn peer_removed_cancels_its_transfers() {
        let dir = tempdir().unwrap();
        let (receiver, _events) = make_receiver(dir.path());
        let transfer_id = Uuid::new_v4();
        receiver
            .on_transfer_info(
                "alice",
                TransferInfo { transfer_id, sender_name: "alice".into(), files: vec![FileInfo { name: "f".into(), size: 100 }] },
            )
            .await
            .unwrap();
        receiver.on_chunk(Chunk { transfer_id, filename: "f".into(), offset: 0, data: vec![1, 2] }).await;
        receiver.on_peer_removed("alice").await;
        assert!(!dir.path().join("f").exists());
    }

    #[tokio::test]
    async fn chunk_before_info_is_silently_dropped() {
        let dir = tempdir().unwrap();
        let (receiver, _events) = make_receiver(dir.path());
        let transfer_id = Uuid::new_v4();
        // No on_transfer_info call for this id yet.
        receiver.on_chunk(Chunk { transfer_id, filename: "f".into(), offset: 0, data: vec![1, 2] }).await;
        assert!(!dir.path().join("f").exists());
    }

    #[tokio::test]
    async fn zero_size_file_completes_immediately_on_info() {
        let dir = tempdir().unwrap();
        let (receiver, mut events) = make_receiver(dir.path());
        let transfer_id = Uuid::new_v4();
        receiver
            .on_transfer_info(
                "alice",
                TransferInfo { transfer_id, sender_name: "alice".into(), files: vec![FileInfo { name: "empty".into(), size: 0 }] },
            )
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        match event {
            ReceiverEvent::NotifyCompletion(n) => assert_eq!(n.num_files, 1),
        }
        assert_eq!(std::fs::metadata(dir.path().join("empty")).unwrap().len(), 0);
    }
}
