//! Resumable read position within one split

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::split::SplitId;

/// Read checkpoint for a single split.
///
/// Serialized as a flat JSON object with a fixed field order, so the bytes
/// of a persisted checkpoint are reproduced exactly by
/// `from_bytes(..).to_bytes()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Split this checkpoint belongs to
    pub split_id: SplitId,
    /// Last emitted partition key, in the key's integer domain
    pub last_key: Option<i64>,
    /// Rows emitted so far whose key equals `last_key`
    #[serde(default)]
    pub emitted_at_last_key: u64,
    /// Absolute offset of the last emitted row (offset windows)
    pub last_offset: Option<u64>,
    /// Rows emitted so far
    pub rows_emitted: u64,
}

impl Checkpoint {
    /// Checkpoint at the start of a split
    pub fn new(split_id: SplitId) -> Self {
        Self {
            split_id,
            last_key: None,
            emitted_at_last_key: 0,
            last_offset: None,
            rows_emitted: 0,
        }
    }

    /// Record an emitted row carrying partition key `key`.
    ///
    /// Keys never move backwards. Repeated keys are counted so a resumed
    /// read can skip exactly the rows of that key it already emitted.
    pub fn advance_key(&mut self, key: i64) -> Result<()> {
        match self.last_key {
            Some(last) if key < last => {
                return Err(Error::internal(format!(
                    "checkpoint for split {} cannot move from key {} to {}",
                    self.split_id, last, key
                )));
            }
            Some(last) if key == last => self.emitted_at_last_key += 1,
            _ => {
                self.last_key = Some(key);
                self.emitted_at_last_key = 1;
            }
        }
        self.rows_emitted += 1;
        Ok(())
    }

    /// Record an emitted row at absolute offset `window_offset + rows_emitted`
    pub fn advance_offset(&mut self, window_offset: u64) {
        self.last_offset = Some(window_offset + self.rows_emitted);
        self.rows_emitted += 1;
    }

    /// Record an emitted row without key or offset tracking
    pub fn advance(&mut self) {
        self.rows_emitted += 1;
    }

    /// Serialize to bytes for persistence
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Restore a checkpoint persisted with [`Checkpoint::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::serialization(e.to_string()))
    }
}
