use crate::fields::Fields;
use crate::id::EntityId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A local write that has been sent but not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Entity being written.
    pub entity_id: EntityId,
    #[serde(with = "time::serde::rfc3339")]
    /// Wall-clock time the write was submitted.
    pub submitted_at: OffsetDateTime,
    /// Fields the local edit touched, with their new values.
    pub local_value: Fields,
}

impl PendingMutation {
    /// Register a mutation submitted now.
    #[must_use]
    pub fn new(entity_id: EntityId, local_value: Fields) -> Self {
        Self {
            entity_id,
            submitted_at: OffsetDateTime::now_utc(),
            local_value,
        }
    }

    /// Override the submission timestamp.
    #[must_use]
    pub const fn at(mut self, submitted_at: OffsetDateTime) -> Self {
        self.submitted_at = submitted_at;
        self
    }
}
