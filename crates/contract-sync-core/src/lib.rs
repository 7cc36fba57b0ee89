//! Domain types & conflict reconciliation for contract-sync.

/// Push-channel change events.
pub mod event;
/// Field-level payload helpers.
pub mod fields;
/// Identifier types.
pub mod id;
/// Locally pending writes.
pub mod mutation;
/// Conflict detection and resolution strategies.
pub mod conflict;

pub use conflict::{
    ConflictError, ConflictRecord, ConflictResolver, ConflictStrategy, ManualResolution, Resolution,
    Resolved,
};
pub use event::{ChangeEvent, ChangeKind, MissingServerValue};
pub use fields::{FieldKind, Fields};
pub use id::EntityId;
pub use mutation::PendingMutation;
