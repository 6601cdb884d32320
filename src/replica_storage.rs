/// Local user replica storage.
///
/// `ReplicaStore` is the seam between the apply engine and the shared user
/// table. Every event transition goes through `apply_transition`, which runs
/// the read-modify-write for one external id atomically. The read methods are
/// the surface the user CRUD API consumes from the same store.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ApplyOutcome, DeadLetter, LocalUserRecord, SkipReason};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),
}

/// Single-row write decided from the current state of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    Insert(LocalUserRecord),
    Update(LocalUserRecord),
    Delete { local_id: Uuid },
    Keep,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub change: RecordChange,
    pub outcome: ApplyOutcome,
}

impl Transition {
    pub fn skip(reason: SkipReason) -> Self {
        Self {
            change: RecordChange::Keep,
            outcome: ApplyOutcome::Skipped(reason),
        }
    }
}

/// Decides a transition from the record currently stored for an external id.
pub type TransitionFn<'a> = dyn Fn(Option<&LocalUserRecord>) -> Transition + Send + Sync + 'a;

#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Atomically read the record for `external_id`, decide, and write.
    ///
    /// An insert that loses a race against another writer commits nothing
    /// and reports `Skipped(AlreadyPresent)`.
    async fn apply_transition(
        &self,
        external_id: Uuid,
        decide: &TransitionFn<'_>,
    ) -> Result<Transition, StorageError>;

    async fn get_by_external_id(
        &self,
        external_id: Uuid,
    ) -> Result<Option<LocalUserRecord>, StorageError>;

    async fn get_by_local_id(&self, local_id: Uuid)
        -> Result<Option<LocalUserRecord>, StorageError>;

    async fn find_by_username(&self, username: &str) -> Result<Vec<LocalUserRecord>, StorageError>;

    async fn list_users(&self) -> Result<Vec<LocalUserRecord>, StorageError>;

    async fn count_users(&self) -> Result<u64, StorageError>;

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), StorageError>;
}

#[derive(Default)]
struct ReplicaState {
    users: HashMap<Uuid, LocalUserRecord>,
    by_external_id: HashMap<Uuid, Uuid>,
    dead_letters: Vec<DeadLetter>,
}

/// In-process replica with the same transition semantics as PostgreSQL.
#[derive(Default)]
pub struct InMemoryReplicaStore {
    state: Mutex<ReplicaState>,
    fail_writes: AtomicBool,
    fail_dead_letters: AtomicBool,
}

impl InMemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ReplicaState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::ConnectionError(format!("Replica lock poisoned: {e}")))
    }

    /// Write a record directly, the way the CRUD API does.
    pub fn insert_user(&self, record: LocalUserRecord) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.by_external_id.contains_key(&record.external_id) {
            return Err(StorageError::WriteError(format!(
                "external id {} already exists",
                record.external_id
            )));
        }
        state.by_external_id.insert(record.external_id, record.local_id);
        state.users.insert(record.local_id, record);
        Ok(())
    }

    /// Make every subsequent transition fail, simulating an unavailable database.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make dead-letter writes fail independently of transitions.
    pub fn set_fail_dead_letters(&self, fail: bool) {
        self.fail_dead_letters.store(fail, Ordering::SeqCst);
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, StorageError> {
        Ok(self.lock()?.dead_letters.clone())
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplicaStore {
    async fn apply_transition(
        &self,
        external_id: Uuid,
        decide: &TransitionFn<'_>,
    ) -> Result<Transition, StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteError(
                "replica store is unavailable".to_string(),
            ));
        }

        let mut state = self.lock()?;
        let existing = state
            .by_external_id
            .get(&external_id)
            .and_then(|local_id| state.users.get(local_id))
            .cloned();

        let transition = decide(existing.as_ref());

        match &transition.change {
            RecordChange::Insert(record) => {
                if state.by_external_id.contains_key(&record.external_id) {
                    return Ok(Transition::skip(SkipReason::AlreadyPresent));
                }
                state.by_external_id.insert(record.external_id, record.local_id);
                state.users.insert(record.local_id, record.clone());
            }
            RecordChange::Update(record) => {
                state.users.insert(record.local_id, record.clone());
            }
            RecordChange::Delete { local_id } => {
                if let Some(removed) = state.users.remove(local_id) {
                    state.by_external_id.remove(&removed.external_id);
                }
            }
            RecordChange::Keep => {}
        }

        Ok(transition)
    }

    async fn get_by_external_id(
        &self,
        external_id: Uuid,
    ) -> Result<Option<LocalUserRecord>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .by_external_id
            .get(&external_id)
            .and_then(|local_id| state.users.get(local_id))
            .cloned())
    }

    async fn get_by_local_id(
        &self,
        local_id: Uuid,
    ) -> Result<Option<LocalUserRecord>, StorageError> {
        Ok(self.lock()?.users.get(&local_id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Vec<LocalUserRecord>, StorageError> {
        Ok(self
            .lock()?
            .users
            .values()
            .filter(|user| user.username == username)
            .cloned()
            .collect())
    }

    async fn list_users(&self) -> Result<Vec<LocalUserRecord>, StorageError> {
        let mut users: Vec<LocalUserRecord> = self.lock()?.users.values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.username.cmp(&b.username)));
        Ok(users)
    }

    async fn count_users(&self) -> Result<u64, StorageError> {
        Ok(self.lock()?.users.len() as u64)
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), StorageError> {
        if self.fail_dead_letters.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError(
                "replica store is unavailable".to_string(),
            ));
        }
        self.lock()?.dead_letters.push(letter.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExternalUserRepresentation;
    use chrono::Utc;

    fn record(username: &str) -> LocalUserRecord {
        let user = ExternalUserRepresentation {
            username: username.to_string(),
            email: Some(format!("{username}@x.com")),
            ..Default::default()
        };
        LocalUserRecord::materialize(Uuid::new_v4(), &user, Utc::now())
    }

    fn insert(record: LocalUserRecord) -> Transition {
        let local_id = record.local_id;
        Transition {
            change: RecordChange::Insert(record),
            outcome: ApplyOutcome::Created { local_id },
        }
    }

    #[tokio::test]
    async fn test_insert_then_lookup_by_both_keys() {
        let store = InMemoryReplicaStore::new();
        let alice = record("alice");

        let planned = insert(alice.clone());
        let applied = store
            .apply_transition(alice.external_id, &|_| planned.clone())
            .await
            .unwrap();
        assert_eq!(applied.outcome, ApplyOutcome::Created { local_id: alice.local_id });

        assert_eq!(
            store.get_by_external_id(alice.external_id).await.unwrap(),
            Some(alice.clone())
        );
        assert_eq!(
            store.get_by_local_id(alice.local_id).await.unwrap(),
            Some(alice.clone())
        );
        assert_eq!(store.find_by_username("alice").await.unwrap().len(), 1);
        assert_eq!(store.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_losing_race_is_skipped() {
        let store = InMemoryReplicaStore::new();
        let alice = record("alice");
        store.insert_user(alice.clone()).unwrap();

        // Decide as if the record were absent, as a concurrent writer would.
        let mut duplicate = record("alice-again");
        duplicate.external_id = alice.external_id;
        let planned = insert(duplicate);

        let applied = store
            .apply_transition(alice.external_id, &|_| planned.clone())
            .await
            .unwrap();

        assert_eq!(applied, Transition::skip(SkipReason::AlreadyPresent));
        assert_eq!(store.count_users().await.unwrap(), 1);
        assert_eq!(
            store.get_by_external_id(alice.external_id).await.unwrap().unwrap().username,
            "alice"
        );
    }

    #[tokio::test]
    async fn test_delete_removes_both_indexes() {
        let store = InMemoryReplicaStore::new();
        let alice = record("alice");
        store.insert_user(alice.clone()).unwrap();

        store
            .apply_transition(alice.external_id, &|existing| {
                let local_id = existing.map(|r| r.local_id).unwrap_or_default();
                Transition {
                    change: RecordChange::Delete { local_id },
                    outcome: ApplyOutcome::Deleted { local_id },
                }
            })
            .await
            .unwrap();

        assert!(store.get_by_external_id(alice.external_id).await.unwrap().is_none());
        assert!(store.get_by_local_id(alice.local_id).await.unwrap().is_none());
        assert!(store.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_store_rejects_transitions() {
        let store = InMemoryReplicaStore::new();
        store.set_fail_writes(true);

        let result = store
            .apply_transition(Uuid::new_v4(), &|_| Transition::skip(SkipReason::NotPresent))
            .await;
        assert!(matches!(result, Err(StorageError::WriteError(_))));

        store.set_fail_writes(false);
        assert!(store
            .apply_transition(Uuid::new_v4(), &|_| Transition::skip(SkipReason::NotPresent))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_dead_letters_are_kept() {
        let store = InMemoryReplicaStore::new();
        let letter = DeadLetter::new("subject", Some("evt".into()), b"{}", "boom", 5);
        store.record_dead_letter(&letter).await.unwrap();

        assert_eq!(store.dead_letters().unwrap(), vec![letter]);
    }

    #[tokio::test]
    async fn test_dead_letter_write_can_fail() {
        let store = InMemoryReplicaStore::new();
        store.set_fail_dead_letters(true);
        let letter = DeadLetter::new("subject", None, b"{}", "boom", 5);

        assert!(matches!(
            store.record_dead_letter(&letter).await,
            Err(StorageError::ConnectionError(_))
        ));
        assert!(store.dead_letters().unwrap().is_empty());
    }

    #[test]
    fn test_poisoned_lock_is_reported() {
        let store = std::sync::Arc::new(InMemoryReplicaStore::new());
        let poisoner = std::sync::Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.state.lock().unwrap();
            panic!("poison the replica lock");
        })
        .join();

        assert!(matches!(
            store.dead_letters(),
            Err(StorageError::ConnectionError(_))
        ));
    }
}
