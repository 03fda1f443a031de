use crate::model::UploadName;
use chrono::{DateTime, Utc};

/// Sequence number for ordering notifications
pub type EventSequence = u64;

/// "The status of this upload changed"; subscribers re-query the status itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChanged {
    pub sequence: EventSequence,
    pub timestamp: DateTime<Utc>,
    pub name: UploadName,
}
