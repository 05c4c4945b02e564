//! Stateful wrapper around [`axterm_core::bulk::BulkTransfer`]'s pure chunk
//! tracker: file I/O, timestamps and the saved path live here, the way
//! `markho930903-rtool`'s `outgoing_pipeline.rs`/`incoming_pipeline.rs` layer
//! a pending/sending/paused/completed state machine over a plain chunk
//! accounting structure.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use axterm_core::address::Address;
use axterm_core::axdp::FileMetaInfo;
use axterm_core::bulk::{BulkTransfer, TransferStatus};

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

pub struct ManagedTransfer {
    pub transfer: BulkTransfer,
    pub direction: TransferDirection,
    pub peer: Address,
    pub saved_file_path: PathBuf,
    pub meta: FileMetaInfo,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    /// Source bytes for an outgoing transfer, or the in-progress reassembly
    /// buffer for an incoming one. Evicted on cancellation.
    data: Option<Vec<u8>>,
    /// AXDP `messageId` of the outstanding `fileMeta` send, awaiting the
    /// peer's acceptance ack (and later, on the same id, its completion ack).
    meta_message_id: Option<u32>,
    /// AXDP `messageId` of each in-flight `fileChunk` send, keyed so an
    /// `ackedMessageId` TLV on the reply can be correlated back to a chunk
    /// index without the wire format needing to carry a transfer id.
    pending_chunk_acks: HashMap<u32, u32>,
}

/// What an incoming ack/nack did to an outgoing transfer, so the actor knows
/// whether to push the next chunk, wait, or leave it alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The peer accepted the `fileMeta` - safe to start sending chunks.
    Accepted,
    /// A chunk was acked; more remain to be sent.
    ChunkAcked,
    /// The last outstanding chunk was acked; transfer is now `awaitingCompletion`.
    AllChunksAcked,
    /// The peer's final completion ack arrived; transfer is now `completed`.
    Completed,
    /// `ackedMessageId` didn't match anything this transfer is waiting on.
    Unrecognized,
}

impl ManagedTransfer {
    fn chunk_range(&self, index: u32) -> (usize, usize) {
        let chunk_size = self.transfer.chunk_size as u64;
        let start = index as u64 * chunk_size;
        let end = (start + chunk_size).min(self.transfer.transmission_size);
        (start as usize, end as usize)
    }

    pub fn chunk_bytes(&self, index: u32) -> Option<&[u8]> {
        let data = self.data.as_ref()?;
        let (start, end) = self.chunk_range(index);
        data.get(start..end)
    }
}

#[derive(Default)]
pub struct BulkTransferManager {
    transfers: HashMap<Uuid, ManagedTransfer>,
}

impl BulkTransferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<&ManagedTransfer> {
        self.transfers.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut ManagedTransfer> {
        self.transfers.get_mut(&id)
    }

    pub fn remove(&mut self, id: Uuid) -> Option<ManagedTransfer> {
        self.transfers.remove(&id)
    }

    /// Read a file off disk and register it as an outgoing transfer, hashing
    /// its contents for the `fileMeta` message the caller sends next.
    pub fn start_outgoing(
        &mut self,
        peer: Address,
        file_path: &Path,
        chunk_size: u32,
        description: Option<String>,
    ) -> Result<Uuid, RuntimeError> {
        let data = fs::read(file_path).map_err(|_| RuntimeError::InvalidPath(file_path.to_path_buf()))?;
        let sha256: [u8; 32] = Sha256::digest(&data).into();
        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let transmission_size = data.len() as u64;

        let id = Uuid::new_v4();
        let transfer = BulkTransfer::new(id, transmission_size, chunk_size);
        let mut meta = FileMetaInfo::new(filename, transmission_size, sha256);
        meta.chunk_size = Some(chunk_size.min(u16::MAX as u32) as u16);
        meta.description = description;

        self.transfers.insert(
            id,
            ManagedTransfer {
                transfer,
                direction: TransferDirection::Outgoing,
                peer,
                saved_file_path: file_path.to_path_buf(),
                meta,
                started_at: Some(Instant::now()),
                completed_at: None,
                data: Some(data),
                meta_message_id: None,
                pending_chunk_acks: HashMap::new(),
            },
        );
        Ok(id)
    }

    /// Register an incoming transfer after receiving its `fileMeta` message.
    pub fn begin_incoming(&mut self, peer: Address, meta: FileMetaInfo, save_path: PathBuf) -> Uuid {
        let chunk_size = meta.chunk_size.unwrap_or(128) as u32;
        let id = Uuid::new_v4();
        let transfer = BulkTransfer::new(id, meta.file_size, chunk_size);
        let data = vec![0u8; meta.file_size as usize];
        self.transfers.insert(
            id,
            ManagedTransfer {
                transfer,
                direction: TransferDirection::Incoming,
                peer,
                saved_file_path: save_path,
                meta,
                started_at: Some(Instant::now()),
                completed_at: None,
                data: Some(data),
                meta_message_id: None,
                pending_chunk_acks: HashMap::new(),
            },
        );
        id
    }

    /// The `messageId` the `fileMeta` for `id` was announced under, if any -
    /// used by the receiving side to build its final completion ack.
    pub fn meta_message_id(&self, id: Uuid) -> Option<u32> {
        self.transfers.get(&id).and_then(|m| m.meta_message_id)
    }

    /// Remember which AXDP `messageId` announced this transfer's `fileMeta`,
    /// without touching `status` - used on the receiving side, where the
    /// Pending/AwaitingAcceptance/Sending progression is the sender's alone.
    pub fn record_meta_message_id(&mut self, id: Uuid, message_id: u32) {
        if let Some(managed) = self.transfers.get_mut(&id) {
            managed.meta_message_id = Some(message_id);
        }
    }

    /// Record that the outgoing `fileMeta` for `id` was just sent under
    /// `message_id`, moving the transfer to `awaitingAcceptance` until the
    /// peer's ack arrives.
    pub fn mark_meta_sent(&mut self, id: Uuid, message_id: u32) {
        if let Some(managed) = self.transfers.get_mut(&id) {
            managed.meta_message_id = Some(message_id);
            managed.transfer.status = TransferStatus::AwaitingAcceptance;
        }
    }

    /// Record that chunk `chunk_index` of `id` was just sent under
    /// `message_id`, so a later ack/nack referencing that id can be
    /// correlated back to this chunk.
    pub fn mark_chunk_message_sent(&mut self, id: Uuid, chunk_index: u32, message_id: u32) {
        if let Some(managed) = self.transfers.get_mut(&id) {
            managed.transfer.mark_chunk_sent(chunk_index);
            managed.pending_chunk_acks.insert(message_id, chunk_index);
        }
    }

    /// Find the outgoing transfer (if any) waiting on an ack/nack for
    /// `acked_message_id` - either its `fileMeta` send or one of its
    /// in-flight chunk sends.
    pub fn find_transfer_awaiting_message(&self, acked_message_id: u32) -> Option<Uuid> {
        self.transfers.iter().find_map(|(id, managed)| {
            let waiting = managed.meta_message_id == Some(acked_message_id)
                || managed.pending_chunk_acks.contains_key(&acked_message_id);
            (managed.direction == TransferDirection::Outgoing && waiting).then_some(*id)
        })
    }

    /// Apply an incoming ack referencing `acked_message_id` to outgoing
    /// transfer `id`. See [`AckOutcome`] for what each case means.
    pub fn ack_message(&mut self, id: Uuid, acked_message_id: u32) -> AckOutcome {
        let Some(managed) = self.transfers.get_mut(&id) else {
            return AckOutcome::Unrecognized;
        };
        if managed.meta_message_id == Some(acked_message_id) {
            return match managed.transfer.status {
                TransferStatus::Pending | TransferStatus::AwaitingAcceptance => {
                    managed.transfer.status = TransferStatus::Sending;
                    AckOutcome::Accepted
                }
                TransferStatus::AwaitingCompletion => {
                    managed.transfer.mark_completed();
                    managed.completed_at = Some(Instant::now());
                    AckOutcome::Completed
                }
                _ => AckOutcome::Unrecognized,
            };
        }
        if let Some(chunk_index) = managed.pending_chunk_acks.remove(&acked_message_id) {
            managed.transfer.mark_chunk_completed(chunk_index);
            return if managed.transfer.next_chunk_to_send().is_none() {
                managed.transfer.status = TransferStatus::AwaitingCompletion;
                AckOutcome::AllChunksAcked
            } else {
                AckOutcome::ChunkAcked
            };
        }
        AckOutcome::Unrecognized
    }

    /// Apply an incoming nack (or a chunk-ack timeout) referencing
    /// `acked_message_id` to outgoing transfer `id`. Returns `true` if a chunk
    /// was put back into the retry set, `false` if nothing matched or the
    /// nack rejected the transfer outright (`fileMeta` nack -> `failed`).
    pub fn nack_message(&mut self, id: Uuid, acked_message_id: u32) -> bool {
        let Some(managed) = self.transfers.get_mut(&id) else {
            return false;
        };
        if let Some(chunk_index) = managed.pending_chunk_acks.remove(&acked_message_id) {
            managed.transfer.mark_chunk_needs_retry(chunk_index);
            return true;
        }
        if managed.meta_message_id == Some(acked_message_id) {
            managed.transfer.status = TransferStatus::Failed;
        }
        false
    }

    /// Copy a received chunk into the reassembly buffer; once every chunk has
    /// arrived, verify the SHA-256 against `fileMeta` and flush to disk.
    pub fn receive_chunk(&mut self, id: Uuid, index: u32, bytes: &[u8]) -> Result<bool, RuntimeError> {
        let managed = self
            .transfers
            .get_mut(&id)
            .ok_or(RuntimeError::ProtocolError("unknown transfer id".to_string()))?;
        let (start, end) = managed.chunk_range(index);
        if let Some(data) = managed.data.as_mut() {
            if end - start != bytes.len() || end > data.len() {
                return Err(RuntimeError::SizeMismatch);
            }
            data[start..end].copy_from_slice(bytes);
        }
        managed.transfer.mark_chunk_completed(index);

        if managed.transfer.next_chunk_to_send().is_none() {
            self.finish_incoming(id)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn finish_incoming(&mut self, id: Uuid) -> Result<(), RuntimeError> {
        let managed = self
            .transfers
            .get_mut(&id)
            .ok_or(RuntimeError::ProtocolError("unknown transfer id".to_string()))?;
        let data = managed.data.as_ref().cloned().unwrap_or_default();
        let actual: [u8; 32] = Sha256::digest(&data).into();
        if actual != managed.meta.sha256 {
            managed.transfer.status = TransferStatus::Failed;
            return Err(RuntimeError::SizeMismatch);
        }
        fs::write(&managed.saved_file_path, &data)
            .map_err(|_| RuntimeError::InvalidPath(managed.saved_file_path.clone()))?;
        managed.transfer.mark_completed();
        managed.completed_at = Some(Instant::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, id: Uuid) {
        if let Some(managed) = self.transfers.get_mut(&id) {
            managed.transfer.mark_completed();
            managed.completed_at = Some(Instant::now());
        }
    }

    pub fn pause(&mut self, id: Uuid) {
        if let Some(managed) = self.transfers.get_mut(&id) {
            managed.transfer.status = TransferStatus::Paused;
        }
    }

    pub fn resume(&mut self, id: Uuid) {
        if let Some(managed) = self.transfers.get_mut(&id) {
            managed.transfer.status = TransferStatus::Sending;
        }
    }

    /// Cancel a transfer in any non-terminal state, evicting its buffered
    /// bytes immediately.
    pub fn cancel(&mut self, id: Uuid) {
        if let Some(managed) = self.transfers.get_mut(&id) {
            if !managed.transfer.status.is_terminal() {
                managed.transfer.status = TransferStatus::Cancelled;
                managed.data = None;
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.transfers.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn peer() -> Address {
        Address::new("VK7XT", 1).unwrap()
    }

    #[test]
    fn outgoing_transfer_hashes_file_contents() {
        let mut tmp = std::env::temp_dir();
        tmp.push(format!("axterm-bulk-test-{}.bin", Uuid::new_v4()));
        {
            let mut f = fs::File::create(&tmp).unwrap();
            f.write_all(b"hello bulk transfer").unwrap();
        }
        let mut manager = BulkTransferManager::new();
        let id = manager.start_outgoing(peer(), &tmp, 8, None).unwrap();
        let managed = manager.get(id).unwrap();
        assert_eq!(managed.meta.file_size, 20);
        assert_eq!(managed.transfer.total_chunks, 3);
        let expected: [u8; 32] = Sha256::digest(b"hello bulk transfer").into();
        assert_eq!(managed.meta.sha256, expected);
        fs::remove_file(&tmp).ok();
    }

    #[test]
    fn incoming_transfer_completes_when_hash_matches() {
        let content = b"a small file payload";
        let sha256: [u8; 32] = Sha256::digest(content).into();
        let meta = FileMetaInfo {
            filename: "x.bin".to_string(),
            file_size: content.len() as u64,
            sha256,
            chunk_size: Some(8),
            description: None,
        };
        let mut save_path = std::env::temp_dir();
        save_path.push(format!("axterm-bulk-recv-{}.bin", Uuid::new_v4()));

        let mut manager = BulkTransferManager::new();
        let id = manager.begin_incoming(peer(), meta, save_path.clone());
        for chunk_idx in 0..3u32 {
            let start = chunk_idx as usize * 8;
            let end = (start + 8).min(content.len());
            let done = manager
                .receive_chunk(id, chunk_idx, &content[start..end])
                .unwrap();
            if chunk_idx == 2 {
                assert!(done);
            } else {
                assert!(!done);
            }
        }
        assert_eq!(manager.get(id).unwrap().transfer.status, TransferStatus::Completed);
        assert_eq!(fs::read(&save_path).unwrap(), content);
        fs::remove_file(&save_path).ok();
    }

    #[test]
    fn incoming_transfer_fails_on_hash_mismatch() {
        let meta = FileMetaInfo {
            filename: "x.bin".to_string(),
            file_size: 4,
            sha256: [0u8; 32],
            chunk_size: Some(4),
            description: None,
        };
        let mut save_path = std::env::temp_dir();
        save_path.push(format!("axterm-bulk-bad-{}.bin", Uuid::new_v4()));
        let mut manager = BulkTransferManager::new();
        let id = manager.begin_incoming(peer(), meta, save_path);
        let result = manager.receive_chunk(id, 0, b"nope");
        assert!(matches!(result, Err(RuntimeError::SizeMismatch)));
    }

    #[test]
    fn cancel_evicts_buffered_bytes() {
        let mut tmp = std::env::temp_dir();
        tmp.push(format!("axterm-bulk-cancel-{}.bin", Uuid::new_v4()));
        fs::write(&tmp, b"some bytes").unwrap();
        let mut manager = BulkTransferManager::new();
        let id = manager.start_outgoing(peer(), &tmp, 4, None).unwrap();
        manager.cancel(id);
        let managed = manager.get(id).unwrap();
        assert_eq!(managed.transfer.status, TransferStatus::Cancelled);
        assert!(managed.data.is_none());
        fs::remove_file(&tmp).ok();
    }

    fn outgoing(manager: &mut BulkTransferManager, content: &[u8], chunk_size: u32) -> (Uuid, std::path::PathBuf) {
        let mut tmp = std::env::temp_dir();
        tmp.push(format!("axterm-bulk-ack-{}.bin", Uuid::new_v4()));
        fs::write(&tmp, content).unwrap();
        let id = manager.start_outgoing(peer(), &tmp, chunk_size, None).unwrap();
        (id, tmp)
    }

    #[test]
    fn ack_on_meta_message_id_moves_awaiting_acceptance_to_sending() {
        let mut manager = BulkTransferManager::new();
        let (id, tmp) = outgoing(&mut manager, b"twelve bytes", 4);
        manager.mark_meta_sent(id, 42);
        assert_eq!(manager.get(id).unwrap().transfer.status, TransferStatus::AwaitingAcceptance);

        let outcome = manager.ack_message(id, 42);
        assert_eq!(outcome, AckOutcome::Accepted);
        assert_eq!(manager.get(id).unwrap().transfer.status, TransferStatus::Sending);
        fs::remove_file(&tmp).ok();
    }

    #[test]
    fn acking_every_chunk_moves_to_awaiting_completion_then_completed() {
        let mut manager = BulkTransferManager::new();
        let (id, tmp) = outgoing(&mut manager, b"twelve bytes", 4);
        manager.mark_meta_sent(id, 1);
        manager.ack_message(id, 1);

        manager.mark_chunk_message_sent(id, 0, 10);
        manager.mark_chunk_message_sent(id, 1, 11);
        manager.mark_chunk_message_sent(id, 2, 12);

        assert_eq!(manager.ack_message(id, 10), AckOutcome::ChunkAcked);
        assert_eq!(manager.ack_message(id, 11), AckOutcome::ChunkAcked);
        assert_eq!(manager.ack_message(id, 12), AckOutcome::AllChunksAcked);
        assert_eq!(manager.get(id).unwrap().transfer.status, TransferStatus::AwaitingCompletion);

        // Final completion ack reuses the same messageId as the fileMeta send.
        assert_eq!(manager.ack_message(id, 1), AckOutcome::Completed);
        assert_eq!(manager.get(id).unwrap().transfer.status, TransferStatus::Completed);
        fs::remove_file(&tmp).ok();
    }

    #[test]
    fn nack_on_chunk_returns_it_to_the_retry_set_without_resurrecting_completed_ones() {
        let mut manager = BulkTransferManager::new();
        let (id, tmp) = outgoing(&mut manager, b"twelve bytes", 4);
        manager.mark_meta_sent(id, 1);
        manager.ack_message(id, 1);

        manager.mark_chunk_message_sent(id, 0, 10);
        manager.mark_chunk_message_sent(id, 1, 11);
        assert_eq!(manager.ack_message(id, 10), AckOutcome::ChunkAcked);

        assert!(manager.nack_message(id, 11));
        let managed = manager.get(id).unwrap();
        assert!(managed.transfer.retry_chunks().contains(&1));
        assert!(!managed.transfer.completed_chunks().contains(&1));
        // Chunk 0 already completed - a stray nack referencing its old
        // messageId (already removed from pending_chunk_acks) is unrecognized.
        assert!(!manager.nack_message(id, 10));
        fs::remove_file(&tmp).ok();
    }

    #[test]
    fn find_transfer_awaiting_message_only_matches_outgoing_transfers() {
        let mut manager = BulkTransferManager::new();
        let (id, tmp) = outgoing(&mut manager, b"twelve bytes", 4);
        manager.mark_meta_sent(id, 99);
        assert_eq!(manager.find_transfer_awaiting_message(99), Some(id));
        assert_eq!(manager.find_transfer_awaiting_message(12345), None);
        fs::remove_file(&tmp).ok();
    }
}
