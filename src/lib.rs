pub mod apply_engine;
pub mod broker;
pub mod config;
pub mod envelope_decoder;
pub mod error_handling;
pub mod logging;
pub mod nats_broker;
pub mod payload_resolver;
pub mod postgres_replica;
pub mod replica_storage;
pub mod sync_worker;
pub mod types;

pub use apply_engine::{plan_transition, ApplyEngine, ApplyError};
pub use broker::{
    channel_subscription, BrokerError, ChannelPublisher, ChannelSubscription, ConsumerDefinition,
    Delivery, DeliveryAcker, EventSubscription, Settlement, SettlementRecord,
};
pub use config::{ConfigError, SyncConfig};
pub use envelope_decoder::DecodeError;
pub use error_handling::*;
pub use logging::*;
pub use nats_broker::{ConnectionManager, NatsSubscription};
pub use payload_resolver::{
    Resolution, ResolutionError, ResolvedEvent, SyncAction, UnsupportedEvent,
};
pub use postgres_replica::PostgresReplicaStore;
pub use replica_storage::{
    InMemoryReplicaStore, RecordChange, ReplicaStore, StorageError, Transition, TransitionFn,
};
pub use sync_worker::{ApplyFailurePolicy, SyncStats, SyncWorker, SyncWorkerHandle, WorkerOptions};
pub use types::*;
