//! Abstract `Storage` and `Bus`/`BusFactory` contracts,
//! plus concrete backends: an in-memory pair for tests and local runs
//! ([`local`]), a Postgres-backed `Storage` ([`postgres`]), and a
//! NATS-backed `BusFactory` ([`nats`]).

pub mod local;
pub mod nats;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use imgtag_core::{ErrorCode, Info, Tag};

pub use local::{LocalBusFactory, LocalStorage};
pub use nats::NatsBusFactory;
pub use postgres::PgStorage;

/// The durable job queue. Every method is atomic with respect to
/// concurrent callers.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn push(&self, url: String, priority: i32) -> anyhow::Result<Info>;

    /// Atomically dequeues up to `n` highest-priority pending jobs
    /// (ties broken FIFO), transitioning each to `Processing`.
    async fn pop(&self, n: usize) -> anyhow::Result<Vec<Info>>;

    async fn reset(&self, ids: &[i64]) -> anyhow::Result<()>;

    /// Atomic scan-and-reset of `Processing` jobs whose `last_activity`
    /// is older than `threshold`.
    async fn abort_stalled(&self, threshold: Duration) -> anyhow::Result<Vec<Info>>;

    async fn beat(&self, id: i64) -> anyhow::Result<()>;
    async fn done(&self, id: i64, tags: Vec<Tag>) -> anyhow::Result<()>;
    async fn error(&self, id: i64, code: ErrorCode, reason: String) -> anyhow::Result<()>;
    async fn get(&self, id: i64) -> anyhow::Result<Option<Info>>;
    async fn position(&self, id: i64) -> anyhow::Result<Option<usize>>;
    async fn queue_size(&self) -> anyhow::Result<usize>;
    async fn list_active(&self) -> anyhow::Result<Vec<Info>>;
}

/// Canonical bus topic names.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Topic {
    Beat,
    Cancel,
    Done,
    Error,
    Deschedule,
    Schedule,
    WakeUp,
    WorkerStatus,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Beat => "beat",
            Topic::Cancel => "cancel",
            Topic::Done => "done",
            Topic::Error => "error",
            Topic::Deschedule => "deschedule",
            Topic::Schedule => "schedule",
            Topic::WakeUp => "wakeup",
            Topic::WorkerStatus => "worker_status",
        }
    }
}

/// A bus event, tagged with the id it concerns where one exists (used for
/// `SubscribeOne` filtering). Serializable so transports like NATS can put
/// it on the wire as a single JSON envelope.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum Event {
    Beat { id: i64 },
    Cancel { id: i64 },
    Done { id: i64, tags: Vec<Tag> },
    Error { id: i64, code: ErrorCode, reason: String },
    Deschedule { ids: Vec<i64> },
    Schedule { node: String, tasks: Vec<Info> },
    WakeUp,
    WorkerStatus { node: String, capacity: usize },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Beat {.. } => Topic::Beat,
            Event::Cancel {.. } => Topic::Cancel,
            Event::Done {.. } => Topic::Done,
            Event::Error {.. } => Topic::Error,
            Event::Deschedule {.. } => Topic::Deschedule,
            Event::Schedule {.. } => Topic::Schedule,
            Event::WakeUp => Topic::WakeUp,
            Event::WorkerStatus {.. } => Topic::WorkerStatus,
        }
    }

    /// The job id this event concerns, for `SubscribeOne` filtering.
    /// `None` for events that aren't about a single job.
    pub fn job_id(&self) -> Option<i64> {
        match self {
            Event::Beat { id } | Event::Cancel { id } | Event::Done { id,.. } | Event::Error { id,.. } => {
                Some(*id)
            }
            Event::Deschedule {.. } | Event::Schedule {.. } | Event::WakeUp | Event::WorkerStatus {.. } => {
                None
            }
        }
    }
}

/// A one-shot publisher, as returned by `BusFactory::publish`. One method
/// per event type.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn beat(&self, id: i64) -> anyhow::Result<()>;
    async fn cancel(&self, id: i64) -> anyhow::Result<()>;
    async fn done(&self, id: i64, tags: Vec<Tag>) -> anyhow::Result<()>;
    async fn error(&self, id: i64, code: ErrorCode, reason: String) -> anyhow::Result<()>;
    async fn deschedule(&self, ids: Vec<i64>) -> anyhow::Result<()>;
    async fn schedule(&self, node: String, tasks: Vec<Info>) -> anyhow::Result<()>;
    async fn wake_up(&self) -> anyhow::Result<()>;
    async fn worker_status(&self, node: String, capacity: usize) -> anyhow::Result<()>;
}

/// Receives events dispatched by a subscription.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: Event);
}

/// Cancels a subscription created by `BusFactory::subscribe_all` or
/// `subscribe_one`.
#[async_trait]
pub trait Unsubscribe: Send + Sync {
    async fn unsubscribe(&self);
}

/// Produces publishers and subscriptions. `consume = true` puts the
/// subscriber in a competing group shared by every other consuming
/// subscriber of the same topic (at most one delivery per publish);
/// `consume = false` is broadcast (every subscriber is delivered every
/// event).
#[async_trait]
pub trait BusFactory: Send + Sync {
    fn publish(&self) -> Box<dyn Bus>;

    async fn subscribe_all(
        &self,
        handler: std::sync::Arc<dyn Handler>,
        consume: bool,
        topics: &[Topic],
    ) -> anyhow::Result<Box<dyn Unsubscribe>>;

    async fn subscribe_one(
        &self,
        handler: std::sync::Arc<dyn Handler>,
        consume: bool,
        id: i64,
        topics: &[Topic],
    ) -> anyhow::Result<Box<dyn Unsubscribe>>;
}
