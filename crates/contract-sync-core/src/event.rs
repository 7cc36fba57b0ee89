use crate::fields::Fields;
use crate::id::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;

/// Kind of change pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A new row was inserted.
    Create,
    /// An existing row was modified.
    Update,
    /// A row was removed.
    Delete,
}

impl ChangeKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a pushed payload cannot describe a change.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} event for {entity_id} carries no serverValue")]
pub struct MissingServerValue {
    /// Kind announced by the payload.
    pub kind: ChangeKind,
    /// Entity the payload targeted.
    pub entity_id: EntityId,
}

/// Envelope delivered by the realtime push channel.
///
/// Inserts and updates without a `serverValue` are rejected while decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawChangeEvent")]
pub struct ChangeEvent {
    /// What happened to the entity.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Target entity.
    pub entity_id: EntityId,
    /// Server-side row after the change (`None` for deletes).
    #[serde(default)]
    pub server_value: Option<Fields>,
    #[serde(with = "time::serde::rfc3339")]
    /// Server commit timestamp in UTC.
    pub timestamp: OffsetDateTime,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeEvent {
    #[serde(rename = "type")]
    kind: ChangeKind,
    entity_id: EntityId,
    #[serde(default)]
    server_value: Option<Fields>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = MissingServerValue;

    fn try_from(raw: RawChangeEvent) -> Result<Self, Self::Error> {
        let event = Self {
            kind: raw.kind,
            entity_id: raw.entity_id,
            server_value: raw.server_value,
            timestamp: raw.timestamp,
        };
        event.check()?;
        Ok(event)
    }
}

impl ChangeEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(kind: ChangeKind, entity_id: EntityId, server_value: Option<Fields>) -> Self {
        Self {
            kind,
            entity_id,
            server_value,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Convenience constructor for inserts.
    #[must_use]
    pub fn created(entity_id: EntityId, value: Fields) -> Self {
        Self::new(ChangeKind::Create, entity_id, Some(value))
    }

    /// Convenience constructor for updates.
    #[must_use]
    pub fn updated(entity_id: EntityId, value: Fields) -> Self {
        Self::new(ChangeKind::Update, entity_id, Some(value))
    }

    /// Convenience constructor for deletes.
    #[must_use]
    pub fn deleted(entity_id: EntityId) -> Self {
        Self::new(ChangeKind::Delete, entity_id, None)
    }

    /// Override the server timestamp.
    #[must_use]
    pub const fn at(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns true when the event removes the entity.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(self.kind, ChangeKind::Delete)
    }

    /// Ensure an insert or update carries the row it announces.
    ///
    /// # Errors
    /// Returns [`MissingServerValue`] for a create or update without a payload.
    pub fn check(&self) -> Result<(), MissingServerValue> {
        if self.is_delete() || self.server_value.is_some() {
            return Ok(());
        }
        Err(MissingServerValue {
            kind: self.kind,
            entity_id: self.entity_id.clone(),
        })
    }
}
