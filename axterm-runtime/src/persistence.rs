//! Outbound-queue persistence across restarts: `OutboundFrame`/`TxFrameState`
//! are the serializable boundary (§3/§6); everything else about the
//! scheduler - token buckets, heap ordering, enqueue counters - is rebuilt
//! fresh each run. Implemented as an explicit `save_to`/`load_from` pair
//! rather than automatic hooks (see DESIGN.md).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use axterm_core::scheduler::{OutboundFrame, TxFrameState};

use crate::error::RuntimeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    pub frame: OutboundFrame,
    pub state: TxFrameState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub entries: Vec<QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn capture(entries: Vec<(OutboundFrame, TxFrameState)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(frame, state)| QueueSnapshotEntry { frame, state })
                .collect(),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), RuntimeError> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self, RuntimeError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axterm_core::address::Address;
    use axterm_core::scheduler::{TxFrameStatus, PRIORITY_NORMAL};
    use uuid::Uuid;

    #[test]
    fn round_trips_through_a_file() {
        let mut path = std::env::temp_dir();
        path.push(format!("axterm-queue-{}.json", Uuid::new_v4()));

        let snapshot = QueueSnapshot::capture(vec![(
            OutboundFrame {
                id: Uuid::new_v4(),
                destination: Address::new("VK7XT", 0).unwrap(),
                priority: PRIORITY_NORMAL,
                bytes: vec![1, 2, 3],
            },
            TxFrameState {
                status: TxFrameStatus::Queued,
                attempts: 2,
            },
        )]);

        snapshot.save_to(&path).unwrap();
        let loaded = QueueSnapshot::load_from(&path).unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].state.attempts, 2);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn loading_a_missing_file_is_an_io_error() {
        let path = std::env::temp_dir().join("axterm-queue-does-not-exist.json");
        assert!(matches!(
            QueueSnapshot::load_from(&path),
            Err(RuntimeError::Io(_))
        ));
    }
}
