//! Pure chunk bookkeeping for a bulk (file) transfer: which chunks have been
//! sent, completed (acked), or need a retry, and the derived progress/byte
//! accounting built from those three disjoint sets.
//!
//! This module never touches a filesystem or a clock - `axterm-runtime` layers
//! that on top (timestamps, `savedFilePath`, actually reading/writing file
//! bytes) around the pure tracker here, the way `m17core`'s packet-queue
//! chunking tracks "what's been sent out of a larger buffer" without owning
//! the buffer's storage itself.

use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    AwaitingAcceptance,
    Sending,
    Paused,
    AwaitingCompletion,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkTransfer {
    pub id: Uuid,
    pub transmission_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub status: TransferStatus,
    sent_chunks: BTreeSet<u32>,
    completed_chunks: BTreeSet<u32>,
    retry_chunks: BTreeSet<u32>,
    /// Bytes actually put on the air across every attempt, including retries -
    /// distinct from `bytes_sent()`, which only counts the current outstanding
    /// set and is used for progress against `transmission_size`.
    bytes_transmitted: u64,
}

impl BulkTransfer {
    pub fn new(id: Uuid, transmission_size: u64, chunk_size: u32) -> Self {
        let total_chunks = transmission_size.div_ceil(chunk_size as u64) as u32;
        Self {
            id,
            transmission_size,
            chunk_size,
            total_chunks,
            status: TransferStatus::Pending,
            sent_chunks: BTreeSet::new(),
            completed_chunks: BTreeSet::new(),
            retry_chunks: BTreeSet::new(),
            bytes_transmitted: 0,
        }
    }

    pub fn sent_chunks(&self) -> &BTreeSet<u32> {
        &self.sent_chunks
    }

    pub fn completed_chunks(&self) -> &BTreeSet<u32> {
        &self.completed_chunks
    }

    pub fn retry_chunks(&self) -> &BTreeSet<u32> {
        &self.retry_chunks
    }

    /// Number of bytes this chunk index actually contributes, given that the
    /// last chunk is ordinarily shorter than `chunk_size`.
    fn chunk_bytes(&self, index: u32) -> u64 {
        let offset = index as u64 * self.chunk_size as u64;
        let remaining = self.transmission_size.saturating_sub(offset);
        remaining.min(self.chunk_size as u64)
    }

    /// Bytes accounted for by chunks currently sent or completed. Marking the
    /// transfer completed snaps this to `transmission_size` exactly (see
    /// `mark_completed`), which overcounts a short final chunk by design.
    pub fn bytes_sent(&self) -> u64 {
        if self.status == TransferStatus::Completed {
            return self.transmission_size;
        }
        self.sent_chunks
            .union(&self.completed_chunks)
            .map(|&idx| self.chunk_bytes(idx))
            .sum()
    }

    pub fn bytes_transmitted(&self) -> u64 {
        self.bytes_transmitted
    }

    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.completed_chunks.len() as f64 / self.total_chunks as f64
    }

    /// Pick the next chunk to transmit: a chunk awaiting retry takes priority
    /// over an untouched one, and once every chunk has been sent at least
    /// once with none outstanding for retry, returns `None`.
    pub fn next_chunk_to_send(&self) -> Option<u32> {
        if let Some(&idx) = self.retry_chunks.iter().next() {
            return Some(idx);
        }
        (0..self.total_chunks).find(|idx| {
            !self.sent_chunks.contains(idx) && !self.completed_chunks.contains(idx)
        })
    }

    pub fn mark_chunk_sent(&mut self, index: u32) {
        self.retry_chunks.remove(&index);
        self.sent_chunks.insert(index);
        self.bytes_transmitted += self.chunk_bytes(index);
    }

    pub fn mark_chunk_completed(&mut self, index: u32) {
        self.sent_chunks.remove(&index);
        self.retry_chunks.remove(&index);
        self.completed_chunks.insert(index);
    }

    pub fn mark_chunk_needs_retry(&mut self, index: u32) {
        self.sent_chunks.remove(&index);
        if !self.completed_chunks.contains(&index) {
            self.retry_chunks.insert(index);
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = TransferStatus::Completed;
    }

    pub fn data_rate(&self, elapsed: Duration) -> f64 {
        rate(self.bytes_sent(), elapsed)
    }

    pub fn air_rate(&self, elapsed: Duration) -> f64 {
        rate(self.bytes_transmitted, elapsed)
    }

    pub fn bandwidth_efficiency(&self, elapsed: Duration) -> f64 {
        let air = self.air_rate(elapsed);
        if air == 0.0 {
            return 0.0;
        }
        self.data_rate(elapsed) / air
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / secs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_transfer() -> BulkTransfer {
        BulkTransfer::new(Uuid::nil(), 250, 100)
    }

    #[test]
    fn total_chunks_rounds_up() {
        let t = new_transfer();
        assert_eq!(t.total_chunks, 3);
    }

    #[test]
    fn chunk_progress_invariant() {
        let mut t = new_transfer();
        assert_eq!(t.progress(), 0.0);
        t.mark_chunk_sent(0);
        t.mark_chunk_completed(0);
        assert!((t.progress() - 1.0 / 3.0).abs() < 1e-9);
        t.mark_chunk_sent(1);
        t.mark_chunk_completed(1);
        t.mark_chunk_sent(2);
        t.mark_chunk_completed(2);
        assert_eq!(t.progress(), 1.0);
    }

    #[test]
    fn bytes_sent_accounts_for_short_last_chunk() {
        let mut t = new_transfer();
        t.mark_chunk_sent(0);
        t.mark_chunk_sent(1);
        t.mark_chunk_sent(2);
        // chunks 0,1 are 100 bytes, chunk 2 is only 50 (250 - 200)
        assert_eq!(t.bytes_sent(), 250);
    }

    #[test]
    fn mark_completed_snaps_bytes_sent_to_transmission_size() {
        let mut t = new_transfer();
        t.mark_chunk_sent(0);
        t.mark_completed();
        assert_eq!(t.bytes_sent(), 250);
    }

    #[test]
    fn retry_takes_priority_over_new_chunk() {
        let mut t = new_transfer();
        t.mark_chunk_sent(0);
        t.mark_chunk_needs_retry(0);
        assert_eq!(t.next_chunk_to_send(), Some(0));
        t.mark_chunk_sent(0);
        assert_eq!(t.next_chunk_to_send(), Some(1));
    }

    #[test]
    fn next_chunk_to_send_exhausts_then_none() {
        let mut t = new_transfer();
        for i in 0..3 {
            assert_eq!(t.next_chunk_to_send(), Some(i));
            t.mark_chunk_sent(i);
        }
        assert_eq!(t.next_chunk_to_send(), None);
    }

    #[test]
    fn sent_completed_retry_sets_stay_disjoint() {
        let mut t = new_transfer();
        t.mark_chunk_sent(0);
        t.mark_chunk_needs_retry(0);
        assert!(!t.sent_chunks().contains(&0));
        assert!(t.retry_chunks().contains(&0));
        t.mark_chunk_sent(0);
        t.mark_chunk_completed(0);
        assert!(!t.sent_chunks().contains(&0));
        assert!(!t.retry_chunks().contains(&0));
        assert!(t.completed_chunks().contains(&0));
    }

    #[test]
    fn needs_retry_is_a_no_op_once_completed() {
        let mut t = new_transfer();
        t.mark_chunk_sent(0);
        t.mark_chunk_completed(0);
        t.mark_chunk_needs_retry(0);
        assert!(!t.retry_chunks().contains(&0));
        assert!(t.completed_chunks().contains(&0));
        assert!(t.completed_chunks().is_disjoint(t.retry_chunks()));
    }

    #[test]
    fn bandwidth_efficiency_reflects_retries() {
        let mut t = new_transfer();
        t.mark_chunk_sent(0);
        t.mark_chunk_needs_retry(0);
        t.mark_chunk_sent(0); // retransmitted once
        t.mark_chunk_completed(0);
        let elapsed = Duration::from_secs(1);
        // bytes_sent counts chunk 0 once (100), bytes_transmitted counts it twice (200)
        assert_eq!(t.bytes_sent(), 100);
        assert_eq!(t.bytes_transmitted(), 200);
        assert!((t.bandwidth_efficiency(elapsed) - 0.5).abs() < 1e-9);
    }
}
