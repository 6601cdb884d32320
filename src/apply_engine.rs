use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::payload_resolver::{ResolvedEvent, SyncAction};
use crate::replica_storage::{RecordChange, ReplicaStore, StorageError, Transition};
use crate::types::{ApplyOutcome, LocalUserRecord, SkipReason};

#[derive(Debug, Error)]
#[error("Failed to apply {action} for external user {external_id} (event {event_id}): {source}")]
pub struct ApplyError {
    pub event_id: String,
    pub external_id: Uuid,
    pub action: &'static str,
    #[source]
    pub source: StorageError,
}

/// Applies resolved events to the local user replica.
///
/// Every transition is idempotent under redelivery: duplicate creates and
/// deletes of absent records are skipped, updates of absent records
/// materialize them.
pub struct ApplyEngine<S: ReplicaStore + ?Sized> {
    store: Arc<S>,
}

impl<S: ReplicaStore + ?Sized> Clone for ApplyEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ReplicaStore + ?Sized> ApplyEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn apply(&self, event: &ResolvedEvent) -> Result<ApplyOutcome, ApplyError> {
        let now = Utc::now();
        let external_id = event.external_id;
        let action = &event.action;

        let decide = |existing: Option<&LocalUserRecord>| {
            plan_transition(action, external_id, existing, now)
        };

        let transition = self
            .store
            .apply_transition(external_id, &decide)
            .await
            .map_err(|source| ApplyError {
                event_id: event.event_id.clone(),
                external_id,
                action: action.name(),
                source,
            })?;

        log_outcome(event, &transition.outcome);
        Ok(transition.outcome)
    }
}

/// Decide the single-row write for an action given the current record.
pub fn plan_transition(
    action: &SyncAction,
    external_id: Uuid,
    existing: Option<&LocalUserRecord>,
    now: DateTime<Utc>,
) -> Transition {
    match (action, existing) {
        (SyncAction::CreateUser(_), Some(_)) => Transition::skip(SkipReason::AlreadyPresent),
        (SyncAction::CreateUser(user) | SyncAction::UpdateUser(user), None) => {
            let record = LocalUserRecord::materialize(external_id, user, now);
            let local_id = record.local_id;
            Transition {
                change: RecordChange::Insert(record),
                outcome: ApplyOutcome::Created { local_id },
            }
        }
        (SyncAction::UpdateUser(user), Some(current)) => Transition {
            change: RecordChange::Update(current.overwritten_by(user, now)),
            outcome: ApplyOutcome::Updated {
                local_id: current.local_id,
            },
        },
        (SyncAction::DeleteUser, Some(current)) => Transition {
            change: RecordChange::Delete {
                local_id: current.local_id,
            },
            outcome: ApplyOutcome::Deleted {
                local_id: current.local_id,
            },
        },
        (SyncAction::DeleteUser, None) => Transition::skip(SkipReason::NotPresent),
        (SyncAction::AssignRoles(_) | SyncAction::ClearRole, None) => {
            Transition::skip(SkipReason::UserNotMaterialized)
        }
        (SyncAction::AssignRoles(roles), Some(current)) => {
            let role = roles
                .first()
                .map(|role| role.name.trim())
                .filter(|name| !name.is_empty());
            match role {
                Some(role) => Transition {
                    change: RecordChange::Update(current.with_role(Some(role.to_string()), now)),
                    outcome: ApplyOutcome::RoleAssigned {
                        local_id: current.local_id,
                        role: role.to_string(),
                    },
                },
                None => Transition::skip(SkipReason::EmptyRoleList),
            }
        }
        (SyncAction::ClearRole, Some(current)) => Transition {
            change: RecordChange::Update(current.with_role(None, now)),
            outcome: ApplyOutcome::RoleCleared {
                local_id: current.local_id,
            },
        },
    }
}

fn log_outcome(event: &ResolvedEvent, outcome: &ApplyOutcome) {
    let external_id = event.external_id;
    match outcome {
        ApplyOutcome::Created { local_id } => {
            tracing::info!("User {} created from external user {}", local_id, external_id)
        }
        ApplyOutcome::Updated { local_id } => {
            tracing::info!("User {} updated from external user {}", local_id, external_id)
        }
        ApplyOutcome::Deleted { local_id } => {
            tracing::info!("User {} deleted (external user {})", local_id, external_id)
        }
        ApplyOutcome::RoleAssigned { local_id, role } => {
            tracing::info!("Role '{}' assigned to user {}", role, local_id)
        }
        ApplyOutcome::RoleCleared { local_id } => {
            tracing::info!("Role removed from user {}", local_id)
        }
        ApplyOutcome::Skipped(SkipReason::AlreadyPresent) => tracing::info!(
            "External user {} already exists, skipping create (event {})",
            external_id,
            event.event_id
        ),
        ApplyOutcome::Skipped(SkipReason::NotPresent) => tracing::info!(
            "External user {} not found, nothing to delete (event {})",
            external_id,
            event.event_id
        ),
        ApplyOutcome::Skipped(SkipReason::UserNotMaterialized) => tracing::warn!(
            "External user {} not found for role mapping, event {} cannot be applied",
            external_id,
            event.event_id
        ),
        ApplyOutcome::Skipped(SkipReason::EmptyRoleList) => tracing::warn!(
            "Role mapping for external user {} carries no role name (event {})",
            external_id,
            event.event_id
        ),
    }
}
