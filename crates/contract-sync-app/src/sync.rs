//! Realtime sync consumer.
//!
//! Applies server-pushed change events to the shared cache while protecting
//! local writes that are still awaiting acknowledgment.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use contract_sync_cache::CacheStore;
use contract_sync_core::{
    ChangeEvent, ChangeKind, ConflictError, ConflictRecord, ConflictResolver, ConflictStrategy,
    EntityId, Fields, ManualResolution, PendingMutation, Resolution, Resolved,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;

/// Change observed by subscribers of a [`SyncConsumer`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    /// An event was written to the cache without a conflict.
    Applied {
        /// Entity the event targeted.
        entity_id: EntityId,
        /// Kind of change applied.
        kind: ChangeKind,
        /// The event confirmed a pending local write.
        echo: bool,
    },
    /// A push collided with a pending local write.
    ConflictDetected(ConflictRecord),
    /// A conflict was settled and its value committed.
    ConflictResolved {
        /// Entity whose conflict closed.
        entity_id: EntityId,
        /// The committed resolution removed the entity.
        removed: bool,
    },
    /// A resolution failed validation; the conflict stays open.
    ResolutionRejected {
        /// Entity whose conflict stays open.
        entity_id: EntityId,
        /// Validation failure.
        reason: ConflictError,
    },
}

/// What [`SyncConsumer::handle`] did with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// No local write was pending; the event was applied as-is.
    Applied,
    /// The event echoed the pending local write, which is now cleared.
    Echo,
    /// A conflict was resolved automatically and the result committed.
    Resolved(Resolved),
    /// A conflict is waiting for [`SyncConsumer::resolve_conflict`].
    Deferred,
    /// The configured strategy produced an invalid value; nothing was applied.
    Rejected(ConflictError),
    /// An insert or update arrived without its row; the cache was left alone.
    Ignored,
}

#[derive(Debug, Default)]
struct SyncState {
    pending: HashMap<EntityId, PendingMutation>,
    conflicts: BTreeMap<EntityId, ConflictRecord>,
}

/// Bridges a push stream into the cache.
#[derive(Debug)]
pub struct SyncConsumer {
    cache: Arc<CacheStore<Fields>>,
    stream: String,
    resolver: ConflictResolver,
    state: Mutex<SyncState>,
    notifications: broadcast::Sender<SyncNotification>,
}

impl SyncConsumer {
    /// Create a consumer writing into `cache` under the configured stream.
    #[must_use]
    pub fn new(cache: Arc<CacheStore<Fields>>, settings: &SyncSettings) -> Self {
        let (notifications, _) = broadcast::channel(settings.notification_capacity.max(1));
        Self {
            cache,
            stream: settings.stream.clone(),
            resolver: ConflictResolver::new(settings.conflict_strategy),
            state: Mutex::new(SyncState::default()),
            notifications,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stream name used as the cache key prefix.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Strategy applied to new conflicts.
    #[must_use]
    pub const fn strategy(&self) -> ConflictStrategy {
        self.resolver.strategy()
    }

    /// Cache key of an entity in this stream (`"{stream}:{id}"`).
    #[must_use]
    pub fn entity_key(&self, entity_id: &EntityId) -> String {
        format!("{}:{entity_id}", self.stream)
    }

    /// Current cached value of an entity.
    #[must_use]
    pub fn cached(&self, entity_id: &EntityId) -> Option<Fields> {
        self.cache.get(&self.entity_key(entity_id))
    }

    /// Subscribe to notifications emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.notifications.subscribe()
    }

    /// Track a local write before it is sent.
    ///
    /// A second write on the same entity supersedes the first, which is returned.
    /// An open conflict is re-diffed against the newer write and dropped when
    /// the two sides now agree.
    pub fn register_mutation(&self, mutation: PendingMutation) -> Option<PendingMutation> {
        let entity_id = mutation.entity_id.clone();
        let mut state = self.lock();
        if let Some(record) = state.conflicts.remove(&entity_id) {
            let rebased = record.rebase(&mutation);
            debug!(
                entity = %entity_id,
                still_open = rebased.is_some(),
                "open conflict re-diffed against newer write"
            );
            if let Some(rebased) = rebased {
                state.conflicts.insert(entity_id.clone(), rebased);
            }
        }
        let superseded = state.pending.insert(entity_id.clone(), mutation);
        if superseded.is_some() {
            debug!(entity = %entity_id, "pending mutation superseded");
        }
        superseded
    }

    /// Clear a pending write after a direct server acknowledgment.
    ///
    /// Any conflict still open for the entity is discarded with it; later
    /// pushes carry the server's current row.
    pub fn acknowledge(&self, entity_id: &EntityId) -> Option<PendingMutation> {
        let mut state = self.lock();
        if state.conflicts.remove(entity_id).is_some() {
            debug!(entity = %entity_id, "acknowledged write closes open conflict");
        }
        state.pending.remove(entity_id)
    }

    /// Pending write for an entity, if any.
    #[must_use]
    pub fn pending_mutation(&self, entity_id: &EntityId) -> Option<PendingMutation> {
        self.lock().pending.get(entity_id).cloned()
    }

    /// Conflicts waiting for a caller decision, ordered by entity.
    #[must_use]
    pub fn open_conflicts(&self) -> Vec<ConflictRecord> {
        self.lock().conflicts.values().cloned().collect()
    }

    /// Process one pushed event.
    pub fn handle(&self, event: ChangeEvent) -> SyncOutcome {
        if let Err(err) = event.check() {
            warn!(error = %err, "push ignored");
            return SyncOutcome::Ignored;
        }
        let mut state = self.lock();
        let entity_id = event.entity_id.clone();

        let Some(mutation) = state.pending.get(&entity_id) else {
            self.apply(&event);
            self.notify(SyncNotification::Applied {
                entity_id,
                kind: event.kind,
                echo: false,
            });
            return SyncOutcome::Applied;
        };

        let Some(record) = ConflictRecord::detect(mutation, &event) else {
            state.pending.remove(&entity_id);
            state.conflicts.remove(&entity_id);
            self.apply(&event);
            debug!(entity = %entity_id, "echo of local write confirmed");
            self.notify(SyncNotification::Applied {
                entity_id,
                kind: event.kind,
                echo: true,
            });
            return SyncOutcome::Echo;
        };

        info!(
            entity = %entity_id,
            fields = record.conflicting_fields.len(),
            strategy = %self.resolver.strategy(),
            "conflict detected"
        );
        self.notify(SyncNotification::ConflictDetected(record.clone()));

        match self.resolver.resolve(&record) {
            Ok(Resolution::Resolved(resolved)) => {
                state.pending.remove(&entity_id);
                state.conflicts.remove(&entity_id);
                self.commit(&entity_id, &resolved);
                SyncOutcome::Resolved(resolved)
            }
            Ok(Resolution::Deferred) => {
                state.conflicts.insert(entity_id, record);
                SyncOutcome::Deferred
            }
            Err(err) => {
                warn!(entity = %entity_id, error = %err, "automatic resolution rejected");
                state.conflicts.insert(entity_id.clone(), record);
                self.notify(SyncNotification::ResolutionRejected {
                    entity_id,
                    reason: err.clone(),
                });
                SyncOutcome::Rejected(err)
            }
        }
    }

    /// Settle an open conflict with an explicit choice.
    ///
    /// # Errors
    /// [`ConflictError::NotFound`] when no conflict is open for the entity, or a
    /// validation error; in the latter case the conflict stays open.
    pub fn resolve_conflict(
        &self,
        entity_id: &EntityId,
        choice: ManualResolution,
    ) -> Result<Resolved, ConflictError> {
        let mut state = self.lock();
        let Some(record) = state.conflicts.get(entity_id) else {
            return Err(ConflictError::NotFound(entity_id.clone()));
        };

        match self.resolver.resolve_manual(record, choice) {
            Ok(resolved) => {
                state.conflicts.remove(entity_id);
                state.pending.remove(entity_id);
                self.commit(entity_id, &resolved);
                Ok(resolved)
            }
            Err(err) => {
                warn!(entity = %entity_id, error = %err, "manual resolution rejected");
                self.notify(SyncNotification::ResolutionRejected {
                    entity_id: entity_id.clone(),
                    reason: err.clone(),
                });
                Err(err)
            }
        }
    }

    /// Drain `events` in arrival order until the sender side closes.
    ///
    /// Returns the number of events processed.
    pub async fn run(&self, mut events: mpsc::Receiver<ChangeEvent>) -> usize {
        let mut processed = 0;
        while let Some(event) = events.recv().await {
            self.handle(event);
            processed += 1;
        }
        debug!(stream = %self.stream, processed, "push stream closed");
        processed
    }

    /// Run the consumer on its own task.
    pub fn spawn(self: &Arc<Self>, events: mpsc::Receiver<ChangeEvent>) -> JoinHandle<usize> {
        let consumer = Arc::clone(self);
        tokio::spawn(async move { consumer.run(events).await })
    }

    fn apply(&self, event: &ChangeEvent) {
        let key = self.entity_key(&event.entity_id);
        if event.is_delete() {
            self.cache.delete(&key);
        } else if let Some(value) = &event.server_value {
            self.cache.set(key, value.clone());
        }
    }

    fn commit(&self, entity_id: &EntityId, resolved: &Resolved) {
        let key = self.entity_key(entity_id);
        let removed = match resolved {
            Resolved::Upsert(value) => {
                self.cache.set(key, value.clone());
                false
            }
            Resolved::Remove => {
                self.cache.delete(&key);
                true
            }
        };
        info!(entity = %entity_id, removed, "conflict resolved");
        self.notify(SyncNotification::ConflictResolved {
            entity_id: entity_id.clone(),
            removed,
        });
    }

    fn notify(&self, notification: SyncNotification) {
        // Having no subscribers is not an error.
        let _ = self.notifications.send(notification);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use contract_sync_cache::CacheConfig;
    use serde_json::{Value, json};
    use time::macros::datetime;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    fn entity(id: &str) -> EntityId {
        id.parse().unwrap()
    }

    fn consumer(strategy: ConflictStrategy) -> SyncConsumer {
        let settings = SyncSettings {
            conflict_strategy: strategy,
            ..SyncSettings::default()
        };
        SyncConsumer::new(Arc::new(CacheStore::new(CacheConfig::default())), &settings)
    }

    #[test]
    fn event_without_pending_write_is_applied() {
        let consumer = consumer(ConflictStrategy::SmartMerge);
        let mut notifications = consumer.subscribe();
        let id = entity("c-1");

        let outcome = consumer.handle(ChangeEvent::created(id.clone(), fields(json!({"name": "A"}))));

        assert_eq!(outcome, SyncOutcome::Applied);
        assert_eq!(consumer.cached(&id), Some(fields(json!({"name": "A"}))));
        assert_eq!(consumer.entity_key(&id), "contracts:c-1");
        assert_eq!(
            notifications.try_recv().unwrap(),
            SyncNotification::Applied {
                entity_id: id,
                kind: ChangeKind::Create,
                echo: false,
            }
        );
    }

    #[test]
    fn echo_of_own_write_is_not_a_conflict() {
        let consumer = consumer(ConflictStrategy::UserPrompt);
        let id = entity("c-1");
        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "X"}))));

        let outcome = consumer.handle(ChangeEvent::updated(
            id.clone(),
            fields(json!({"name": "X", "amount": 10})),
        ));

        assert_eq!(outcome, SyncOutcome::Echo);
        assert!(consumer.open_conflicts().is_empty());
        assert!(consumer.pending_mutation(&id).is_none());
        assert_eq!(
            consumer.cached(&id),
            Some(fields(json!({"name": "X", "amount": 10})))
        );
    }

    #[test]
    fn server_wins_keeps_server_value() {
        let consumer = consumer(ConflictStrategy::ServerWins);
        let id = entity("c-1");
        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "A"}))));

        let outcome = consumer.handle(ChangeEvent::updated(id.clone(), fields(json!({"name": "B"}))));

        assert!(matches!(outcome, SyncOutcome::Resolved(Resolved::Upsert(_))));
        assert_eq!(consumer.cached(&id), Some(fields(json!({"name": "B"}))));
        assert!(consumer.pending_mutation(&id).is_none());
    }

    #[test]
    fn client_wins_keeps_local_value() {
        let consumer = consumer(ConflictStrategy::ClientWins);
        let id = entity("c-1");
        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "A"}))));

        consumer.handle(ChangeEvent::updated(id.clone(), fields(json!({"name": "B"}))));

        assert_eq!(consumer.cached(&id), Some(fields(json!({"name": "A"}))));
    }

    #[test]
    fn smart_merge_prefers_newer_side_per_field() {
        let consumer = consumer(ConflictStrategy::SmartMerge);
        let id = entity("c-1");
        consumer.register_mutation(
            PendingMutation::new(id.clone(), fields(json!({"name": "A", "status": "draft"})))
                .at(datetime!(2024-05-01 10:00 UTC)),
        );

        let event = ChangeEvent::updated(
            id.clone(),
            fields(json!({"name": "B", "status": "draft", "amount": 5})),
        )
        .at(datetime!(2024-05-01 09:00 UTC));
        consumer.handle(event);

        assert_eq!(
            consumer.cached(&id),
            Some(fields(json!({"name": "A", "status": "draft", "amount": 5})))
        );
    }

    #[test]
    fn user_prompt_defers_until_manual_choice() {
        let consumer = consumer(ConflictStrategy::UserPrompt);
        let id = entity("c-1");
        consumer.handle(ChangeEvent::created(id.clone(), fields(json!({"name": "Z"}))));
        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "A"}))));

        let outcome = consumer.handle(ChangeEvent::updated(id.clone(), fields(json!({"name": "B"}))));

        assert_eq!(outcome, SyncOutcome::Deferred);
        assert_eq!(consumer.cached(&id), Some(fields(json!({"name": "Z"}))));
        let open = consumer.open_conflicts();
        assert_eq!(open.len(), 1);
        assert!(open[0].conflicting_fields.contains("name"));
        assert!(consumer.pending_mutation(&id).is_some());

        let resolved = consumer
            .resolve_conflict(&id, ManualResolution::Strategy(ConflictStrategy::ClientWins))
            .unwrap();
        assert_eq!(resolved, Resolved::Upsert(fields(json!({"name": "A"}))));
        assert_eq!(consumer.cached(&id), Some(fields(json!({"name": "A"}))));
        assert!(consumer.open_conflicts().is_empty());
        assert!(consumer.pending_mutation(&id).is_none());
    }

    #[test]
    fn invalid_manual_value_keeps_conflict_open() {
        let consumer = consumer(ConflictStrategy::UserPrompt);
        let mut notifications = consumer.subscribe();
        let id = entity("c-1");
        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "A"}))));
        consumer.handle(ChangeEvent::updated(id.clone(), fields(json!({"name": "B"}))));

        let err = consumer
            .resolve_conflict(&id, ManualResolution::Value(fields(json!({"other": 1}))))
            .unwrap_err();

        assert!(matches!(err, ConflictError::MissingField { ref field, .. } if field == "name"));
        assert_eq!(consumer.open_conflicts().len(), 1);
        assert!(consumer.cached(&id).is_none());

        assert!(matches!(
            notifications.try_recv().unwrap(),
            SyncNotification::ConflictDetected(_)
        ));
        assert!(matches!(
            notifications.try_recv().unwrap(),
            SyncNotification::ResolutionRejected { .. }
        ));
    }

    #[test]
    fn resolving_unknown_conflict_is_not_found() {
        let consumer = consumer(ConflictStrategy::UserPrompt);
        let id = entity("missing");
        assert_eq!(
            consumer.resolve_conflict(&id, ManualResolution::Strategy(ConflictStrategy::ServerWins)),
            Err(ConflictError::NotFound(id))
        );
    }

    #[test]
    fn server_delete_over_pending_write_removes_under_server_wins() {
        let consumer = consumer(ConflictStrategy::ServerWins);
        let id = entity("c-1");
        consumer.handle(ChangeEvent::created(id.clone(), fields(json!({"name": "Z"}))));
        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "A"}))));

        let outcome = consumer.handle(ChangeEvent::deleted(id.clone()));

        assert_eq!(outcome, SyncOutcome::Resolved(Resolved::Remove));
        assert!(consumer.cached(&id).is_none());
    }

    #[test]
    fn second_mutation_supersedes_first() {
        let consumer = consumer(ConflictStrategy::SmartMerge);
        let id = entity("c-1");
        assert!(
            consumer
                .register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "A"}))))
                .is_none()
        );
        let superseded = consumer
            .register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "B"}))))
            .unwrap();
        assert_eq!(superseded.local_value, fields(json!({"name": "A"})));

        assert!(consumer.acknowledge(&id).is_some());
        assert!(consumer.pending_mutation(&id).is_none());
    }

    #[test]
    fn acknowledge_discards_open_conflict() {
        let consumer = consumer(ConflictStrategy::UserPrompt);
        let id = entity("c-1");
        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "A"}))));
        assert_eq!(
            consumer.handle(ChangeEvent::updated(id.clone(), fields(json!({"name": "B"})))),
            SyncOutcome::Deferred
        );

        assert!(consumer.acknowledge(&id).is_some());
        assert!(consumer.open_conflicts().is_empty());

        let outcome = consumer.handle(ChangeEvent::updated(id.clone(), fields(json!({"name": "C"}))));
        assert_eq!(outcome, SyncOutcome::Applied);
        assert_eq!(
            consumer.resolve_conflict(&id, ManualResolution::Strategy(ConflictStrategy::ServerWins)),
            Err(ConflictError::NotFound(id.clone()))
        );
        assert_eq!(consumer.cached(&id), Some(fields(json!({"name": "C"}))));
    }

    #[test]
    fn newer_write_rebases_open_conflict() {
        let consumer = consumer(ConflictStrategy::UserPrompt);
        let id = entity("c-1");
        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "A"}))));
        consumer.handle(ChangeEvent::updated(id.clone(), fields(json!({"name": "B"}))));

        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "D"}))));
        let open = consumer.open_conflicts();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].client_value, fields(json!({"name": "D"})));

        let resolved = consumer
            .resolve_conflict(&id, ManualResolution::Strategy(ConflictStrategy::ClientWins))
            .unwrap();
        assert_eq!(resolved, Resolved::Upsert(fields(json!({"name": "D"}))));
        assert_eq!(consumer.cached(&id), Some(fields(json!({"name": "D"}))));
    }

    #[test]
    fn newer_write_matching_server_closes_conflict() {
        let consumer = consumer(ConflictStrategy::UserPrompt);
        let id = entity("c-1");
        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "A"}))));
        consumer.handle(ChangeEvent::updated(id.clone(), fields(json!({"name": "B"}))));

        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "B"}))));

        assert!(consumer.open_conflicts().is_empty());
        assert_eq!(
            consumer.pending_mutation(&id).map(|m| m.local_value),
            Some(fields(json!({"name": "B"})))
        );
    }

    #[test]
    fn update_without_server_value_leaves_cache_alone() {
        let consumer = consumer(ConflictStrategy::ServerWins);
        let mut notifications = consumer.subscribe();
        let id = entity("c-1");
        consumer.handle(ChangeEvent::created(id.clone(), fields(json!({"name": "A"}))));
        let _ = notifications.try_recv();

        let outcome = consumer.handle(ChangeEvent::new(ChangeKind::Update, id.clone(), None));
        assert_eq!(outcome, SyncOutcome::Ignored);
        assert_eq!(consumer.cached(&id), Some(fields(json!({"name": "A"}))));

        consumer.register_mutation(PendingMutation::new(id.clone(), fields(json!({"name": "X"}))));
        let outcome = consumer.handle(ChangeEvent::new(ChangeKind::Create, id.clone(), None));
        assert_eq!(outcome, SyncOutcome::Ignored);
        assert!(consumer.open_conflicts().is_empty());
        assert!(consumer.pending_mutation(&id).is_some());
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_applies_events_in_arrival_order() {
        let consumer = Arc::new(consumer(ConflictStrategy::SmartMerge));
        let (tx, rx) = mpsc::channel(8);
        let first = entity("c-1");
        let second = entity("c-2");

        tx.send(ChangeEvent::created(first.clone(), fields(json!({"v": 1})))).await.unwrap();
        tx.send(ChangeEvent::updated(second.clone(), fields(json!({"v": 1})))).await.unwrap();
        tx.send(ChangeEvent::updated(first.clone(), fields(json!({"v": 2})))).await.unwrap();
        tx.send(ChangeEvent::deleted(first.clone())).await.unwrap();
        tx.send(ChangeEvent::updated(second.clone(), fields(json!({"v": 2})))).await.unwrap();
        drop(tx);

        let processed = consumer.spawn(rx).await.unwrap();

        assert_eq!(processed, 5);
        assert!(consumer.cached(&first).is_none());
        assert_eq!(consumer.cached(&second), Some(fields(json!({"v": 2}))));
    }
}
