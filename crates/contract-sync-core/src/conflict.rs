use crate::event::ChangeEvent;
use crate::fields::{FieldKind, Fields, overlapping_differences, overlay};
use crate::id::EntityId;
use crate::mutation::PendingMutation;
use crdts::lwwreg::LWWReg;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;

/// How a collision between a server push and a pending local write is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Discard the local edit.
    ServerWins,
    /// Keep the fields the local edit touched.
    ClientWins,
    /// Per field, keep whichever side wrote last.
    #[default]
    SmartMerge,
    /// Hold the conflict open until the caller decides.
    UserPrompt,
}

impl ConflictStrategy {
    /// String representation used in configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerWins => "server-wins",
            Self::ClientWins => "client-wins",
            Self::SmartMerge => "smart-merge",
            Self::UserPrompt => "user-prompt",
        }
    }

    /// Returns true for strategies that produce a value without caller input.
    #[must_use]
    pub const fn is_automatic(self) -> bool {
        !matches!(self, Self::UserPrompt)
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = ConflictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "server-wins" => Ok(Self::ServerWins),
            "client-wins" => Ok(Self::ClientWins),
            "smart-merge" => Ok(Self::SmartMerge),
            "user-prompt" => Ok(Self::UserPrompt),
            other => Err(ConflictError::UnknownStrategy(other.to_owned())),
        }
    }
}

/// Errors raised while reconciling a conflict.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// A conflicting field is absent from the resolved value.
    #[error("resolved value for {entity} is missing conflicting field '{field}'")]
    MissingField {
        /// Entity under resolution.
        entity: EntityId,
        /// Field that disappeared.
        field: String,
    },

    /// A conflicting field changed its structural kind.
    #[error("field '{field}' of {entity} resolved to {found}, expected {expected}")]
    KindMismatch {
        /// Entity under resolution.
        entity: EntityId,
        /// Offending field.
        field: String,
        /// Kind(s) seen on the server or client side.
        expected: String,
        /// Kind found in the resolved value.
        found: &'static str,
    },

    /// `user-prompt` was supplied where a concrete choice is required.
    #[error("a manual resolution must name an automatic strategy or supply a value")]
    ManualChoiceRequired,

    /// No open conflict exists for the entity.
    #[error("no open conflict for {0}")]
    NotFound(EntityId),

    /// Unrecognized strategy name.
    #[error("unknown conflict strategy '{0}'")]
    UnknownStrategy(String),
}

/// Field-level diff between a pending local write and an incoming server value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Entity both sides wrote.
    pub entity_id: EntityId,
    /// Server row (empty when the server deleted the entity).
    pub server_value: Fields,
    /// Fields of the pending local write.
    pub client_value: Fields,
    /// Fields on which the two sides disagree.
    pub conflicting_fields: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    /// Server commit time.
    pub server_timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    /// Local submission time.
    pub client_timestamp: OffsetDateTime,
    /// The server removed the entity while the local edit was in flight.
    pub server_deleted: bool,
}

impl ConflictRecord {
    /// Compare a server event against a pending mutation on the same entity.
    ///
    /// Returns `None` when the event is an echo of the local write (every
    /// overlapping field already carries the local value), or when an insert
    /// or update fails [`ChangeEvent::check`].
    #[must_use]
    pub fn detect(mutation: &PendingMutation, event: &ChangeEvent) -> Option<Self> {
        let server = if event.is_delete() {
            None
        } else {
            Some(event.server_value.as_ref()?)
        };
        Self::diff(mutation, server, event.timestamp)
    }

    /// Re-diff the server side of this conflict against a newer local write.
    ///
    /// Returns `None` when the newer write already agrees with the server.
    #[must_use]
    pub fn rebase(&self, mutation: &PendingMutation) -> Option<Self> {
        let server = (!self.server_deleted).then_some(&self.server_value);
        Self::diff(mutation, server, self.server_timestamp)
    }

    fn diff(
        mutation: &PendingMutation,
        server: Option<&Fields>,
        server_timestamp: OffsetDateTime,
    ) -> Option<Self> {
        let (server_value, conflicting_fields, server_deleted) = match server {
            Some(server) => {
                let diff = overlapping_differences(&mutation.local_value, server);
                if diff.is_empty() {
                    return None;
                }
                (server.clone(), diff, false)
            }
            None => (
                Fields::new(),
                mutation.local_value.keys().cloned().collect(),
                true,
            ),
        };

        Some(Self {
            entity_id: mutation.entity_id.clone(),
            server_value,
            client_value: mutation.local_value.clone(),
            conflicting_fields,
            server_timestamp,
            client_timestamp: mutation.submitted_at,
            server_deleted,
        })
    }
}

/// Final value to commit for a resolved conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Store this payload.
    Upsert(Fields),
    /// Remove the entity.
    Remove,
}

/// Outcome of running the configured strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A validated value is ready to commit.
    Resolved(Resolved),
    /// The conflict stays open for an explicit caller decision.
    Deferred,
}

/// Caller-supplied decision for a deferred conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualResolution {
    /// Apply one of the automatic strategies.
    Strategy(ConflictStrategy),
    /// Commit a hand-edited payload.
    Value(Fields),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Side {
    Client,
    Server,
}

/// Last-writer-wins marker. Ties go to the server (`Side::Server` sorts last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct MergeStamp {
    at: OffsetDateTime,
    side: Side,
}

/// Deterministic reconciliation of [`ConflictRecord`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    /// Create a resolver bound to the configured strategy.
    #[must_use]
    pub const fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    /// Configured strategy.
    #[must_use]
    pub const fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Run the configured strategy.
    ///
    /// # Errors
    /// Returns a validation error when the produced value would drop or
    /// retype a conflicting field.
    pub fn resolve(&self, record: &ConflictRecord) -> Result<Resolution, ConflictError> {
        if !self.strategy.is_automatic() {
            return Ok(Resolution::Deferred);
        }
        let resolved = apply_strategy(record, self.strategy);
        validate(record, &resolved)?;
        Ok(Resolution::Resolved(resolved))
    }

    /// Settle a deferred conflict with an explicit caller choice.
    ///
    /// # Errors
    /// Returns [`ConflictError::ManualChoiceRequired`] for `user-prompt`, or a
    /// validation error for a structurally invalid value.
    pub fn resolve_manual(
        &self,
        record: &ConflictRecord,
        choice: ManualResolution,
    ) -> Result<Resolved, ConflictError> {
        let resolved = match choice {
            ManualResolution::Strategy(strategy) if strategy.is_automatic() => {
                apply_strategy(record, strategy)
            }
            ManualResolution::Strategy(_) => return Err(ConflictError::ManualChoiceRequired),
            ManualResolution::Value(fields) => Resolved::Upsert(fields),
        };
        validate(record, &resolved)?;
        Ok(resolved)
    }
}

fn apply_strategy(record: &ConflictRecord, strategy: ConflictStrategy) -> Resolved {
    match strategy {
        ConflictStrategy::ServerWins | ConflictStrategy::UserPrompt => {
            if record.server_deleted {
                Resolved::Remove
            } else {
                Resolved::Upsert(record.server_value.clone())
            }
        }
        ConflictStrategy::ClientWins => {
            Resolved::Upsert(overlay(&record.server_value, &record.client_value))
        }
        ConflictStrategy::SmartMerge => smart_merge(record),
    }
}

fn smart_merge(record: &ConflictRecord) -> Resolved {
    let server_stamp = MergeStamp {
        at: record.server_timestamp,
        side: Side::Server,
    };
    let client_stamp = MergeStamp {
        at: record.client_timestamp,
        side: Side::Client,
    };

    if record.server_deleted {
        return if client_stamp > server_stamp {
            Resolved::Upsert(record.client_value.clone())
        } else {
            Resolved::Remove
        };
    }

    let mut merged = record.server_value.clone();
    for (name, client_value) in &record.client_value {
        let Some(server_value) = record.server_value.get(name) else {
            merged.insert(name.clone(), client_value.clone());
            continue;
        };
        let mut register = LWWReg {
            val: server_value.clone(),
            marker: server_stamp,
        };
        register.update(client_value.clone(), client_stamp);
        merged.insert(name.clone(), register.val);
    }
    Resolved::Upsert(merged)
}

fn validate(record: &ConflictRecord, resolved: &Resolved) -> Result<(), ConflictError> {
    let Resolved::Upsert(value) = resolved else {
        return Ok(());
    };

    for field in &record.conflicting_fields {
        let Some(candidate) = value.get(field) else {
            return Err(ConflictError::MissingField {
                entity: record.entity_id.clone(),
                field: field.clone(),
            });
        };
        let expected: BTreeSet<FieldKind> = [record.server_value.get(field), record.client_value.get(field)]
            .into_iter()
            .flatten()
            .map(FieldKind::of)
            .collect();
        let found = FieldKind::of(candidate);
        if !expected.is_empty() && !expected.contains(&found) {
            return Err(ConflictError::KindMismatch {
                entity: record.entity_id.clone(),
                field: field.clone(),
                expected: describe_kinds(&expected),
                found: found.as_str(),
            });
        }
    }
    Ok(())
}

fn describe_kinds(kinds: &BTreeSet<FieldKind>) -> String {
    kinds
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(" or ")
}
