//! Checkpoint types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resume position of a split run
///
/// `last_consumed_byte_offset` always points at the first byte of the
/// boundary line of message `last_written_message_index + 1`, or at the end
/// of the input once everything is consumed. It never points mid-message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Number of messages fully written to parts (0 if none)
    pub last_written_message_index: u64,
    /// Absolute input offset of the next unconsumed message boundary
    pub last_consumed_byte_offset: u64,
    /// Length of the active part file covered by this checkpoint
    pub part_bytes_written: u64,
    /// Part capacity the run was using
    pub messages_per_part: u64,
    /// When the checkpoint was taken
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        messages_per_part: u64,
        last_written_message_index: u64,
        last_consumed_byte_offset: u64,
        part_bytes_written: u64,
    ) -> Self {
        Checkpoint {
            last_written_message_index,
            last_consumed_byte_offset,
            part_bytes_written,
            messages_per_part,
            updated_at: Utc::now(),
        }
    }

    /// Checkpoint of a run that has not written anything yet
    pub fn fresh(messages_per_part: u64) -> Self {
        Checkpoint::new(messages_per_part, 0, 0, 0)
    }

    /// 1-based index of the part that receives the next message
    pub fn active_part_index(&self) -> u64 {
        self.last_written_message_index / self.messages_per_part.max(1) + 1
    }

    /// Messages already present in the active part
    pub fn messages_in_active_part(&self) -> u64 {
        self.last_written_message_index % self.messages_per_part.max(1)
    }

    /// Ordering key used to pick the most advanced of two records
    pub(crate) fn progress_key(&self) -> (u64, u64) {
        (self.last_written_message_index, self.last_consumed_byte_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_part_index() {
        assert_eq!(Checkpoint::new(1000, 0, 0, 0).active_part_index(), 1);
        assert_eq!(Checkpoint::new(1000, 999, 10, 10).active_part_index(), 1);
        assert_eq!(Checkpoint::new(1000, 1000, 10, 0).active_part_index(), 2);
        assert_eq!(Checkpoint::new(1000, 1734, 10, 10).active_part_index(), 2);
        assert_eq!(Checkpoint::new(1000, 2500, 10, 10).active_part_index(), 3);
    }

    #[test]
    fn test_messages_in_active_part() {
        assert_eq!(Checkpoint::new(1000, 1734, 0, 0).messages_in_active_part(), 734);
        assert_eq!(Checkpoint::new(1000, 2000, 0, 0).messages_in_active_part(), 0);
        assert_eq!(Checkpoint::new(1, 7, 0, 0).messages_in_active_part(), 0);
    }

    #[test]
    fn test_checkpoint_json_round_trip() {
        let checkpoint = Checkpoint::new(1000, 2500, 1_048_576, 4096);
        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, checkpoint);
        assert!(json.contains("\"last_written_message_index\":2500"));
        assert!(json.contains("\"last_consumed_byte_offset\":1048576"));
    }

    #[test]
    fn test_record_without_part_bytes_is_rejected() {
        let json = r#"{"last_written_message_index":5,"last_consumed_byte_offset":10,"messages_per_part":1000,"updated_at":"2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<Checkpoint>(json).is_err());
    }
}
