//! In-memory `Storage` and `BusFactory`, for tests and local runs without
//! Postgres or NATS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use imgtag_core::{ErrorCode, Info, Status, Tag};
use tokio::sync::Mutex;

use crate::{Bus, BusFactory, Event, Handler, Storage, Topic, Unsubscribe};

struct StorageInner {
    jobs: HashMap<i64, Info>,
    order: HashMap<i64, u64>, // insertion sequence, for FIFO tie-break
    next_id: i64,
    next_seq: u64,
}

/// A single-process, mutex-protected `Storage`. Priority-then-FIFO
/// ordering on `Pop`/`Position` pins the tie-break left open in the
/// original source.
pub struct LocalStorage {
    inner: Mutex<StorageInner>,
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StorageInner {
                jobs: HashMap::new(),
                order: HashMap::new(),
                next_id: 1,
                next_seq: 0,
            }),
        }
    }

    fn pending_rank(info: &Info, seq: u64) -> (i32, std::cmp::Reverse<u64>) {
        (info.priority, std::cmp::Reverse(seq))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn push(&self, url: String, priority: i32) -> anyhow::Result<Info> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let info = Info::new(id, url, priority);
        inner.jobs.insert(id, info.clone());
        inner.order.insert(id, seq);
        Ok(info)
    }

    async fn pop(&self, n: usize) -> anyhow::Result<Vec<Info>> {
        let mut inner = self.inner.lock().await;

        let mut candidates: Vec<i64> = inner
            .jobs
            .iter()
            .filter(|(_, info)| info.status == Status::Pending)
            .map(|(id, _)| *id)
            .collect();

        candidates.sort_by_key(|id| {
            let info = &inner.jobs[id];
            let seq = inner.order[id];
            std::cmp::Reverse(Self::pending_rank(info, seq))
        });

        let mut popped = Vec::new();
        for id in candidates.into_iter().take(n) {
            let info = inner.jobs.get_mut(&id).expect("id came from jobs map");
            info.status = Status::Processing;
            info.last_activity = Instant::now();
            popped.push(info.clone());
        }
        Ok(popped)
    }

    async fn reset(&self, ids: &[i64]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            if let Some(info) = inner.jobs.get_mut(id) {
                info.status = Status::Pending;
            }
        }
        Ok(())
    }

    async fn abort_stalled(&self, threshold: Duration) -> anyhow::Result<Vec<Info>> {
        let mut inner = self.inner.lock().await;
        let mut stalled = Vec::new();
        for info in inner.jobs.values_mut() {
            if info.status == Status::Processing && info.last_activity.elapsed() >= threshold {
                info.status = Status::Pending;
                stalled.push(info.clone());
            }
        }
        Ok(stalled)
    }

    async fn beat(&self, id: i64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(info) = inner.jobs.get_mut(&id) {
            info.last_activity = Instant::now();
        }
        Ok(())
    }

    async fn done(&self, id: i64, tags: Vec<Tag>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(info) = inner.jobs.get_mut(&id) {
            info.status = Status::Done;
            info.tags = tags;
            info.last_activity = Instant::now();
        }
        Ok(())
    }

    async fn error(&self, id: i64, code: ErrorCode, reason: String) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(info) = inner.jobs.get_mut(&id) {
            info.status = Status::Failed;
            info.error_code = code;
            info.error_reason = reason;
            info.last_activity = Instant::now();
        }
        Ok(())
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Info>> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn position(&self, id: i64) -> anyhow::Result<Option<usize>> {
        let inner = self.inner.lock().await;
        if !matches!(inner.jobs.get(&id).map(|i| i.status), Some(Status::Pending)) {
            return Ok(None);
        }

        let mut pending: Vec<i64> = inner
            .jobs
            .iter()
            .filter(|(_, info)| info.status == Status::Pending)
            .map(|(id, _)| *id)
            .collect();
        pending.sort_by_key(|candidate| {
            let info = &inner.jobs[candidate];
            let seq = inner.order[candidate];
            std::cmp::Reverse(Self::pending_rank(info, seq))
        });

        Ok(pending.iter().position(|candidate| *candidate == id))
    }

    async fn queue_size(&self) -> anyhow::Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|info| info.status == Status::Pending)
            .count())
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Info>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|info| info.status == Status::Processing)
            .cloned()
            .collect())
    }
}

struct Subscription {
    consuming: bool,
    id_filter: Option<i64>,
    handler: Arc<dyn Handler>,
}

struct BusInner {
    subs: HashMap<Topic, Vec<(u64, Subscription)>>,
    round_robin: HashMap<Topic, usize>,
    next_sub_id: u64,
}

/// An in-memory pub/sub bus. Consuming subscribers of the same topic form
/// one competing group (round-robin, at most one delivery per publish);
/// non-consuming subscribers all receive every event.
pub struct LocalBusFactory {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for LocalBusFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBusFactory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subs: HashMap::new(),
                round_robin: HashMap::new(),
                next_sub_id: 0,
            })),
        }
    }

    async fn dispatch(inner: &Mutex<BusInner>, event: Event) {
        let topic = event.topic();
        let mut guard = inner.lock().await;
        let Some(subs) = guard.subs.get(&topic) else {
            return;
        };

        let eligible: Vec<(u64, bool, Arc<dyn Handler>)> = subs
            .iter()
            .filter(|(_, sub)| match (sub.id_filter, event.job_id()) {
                (Some(filter), Some(id)) => filter == id,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .map(|(sub_id, sub)| (*sub_id, sub.consuming, sub.handler.clone()))
            .collect();

        let (consuming, broadcast): (Vec<_>, Vec<_>) = eligible.into_iter().partition(|(_, c, _)| *c);

        let chosen_consumer = if consuming.is_empty() {
            None
        } else {
            let cursor = guard.round_robin.entry(topic).or_insert(0);
            let pick = *cursor % consuming.len();
            *cursor = cursor.wrapping_add(1);
            Some(consuming[pick].2.clone())
        };
        drop(guard);

        for (_, _, handler) in broadcast {
            handler.handle(event.clone()).await;
        }
        if let Some(handler) = chosen_consumer {
            handler.handle(event.clone()).await;
        }
    }
}

struct LocalBus {
    inner: Arc<Mutex<BusInner>>,
}

#[async_trait]
impl Bus for LocalBus {
    async fn beat(&self, id: i64) -> anyhow::Result<()> {
        LocalBusFactory::dispatch(&self.inner, Event::Beat { id }).await;
        Ok(())
    }

    async fn cancel(&self, id: i64) -> anyhow::Result<()> {
        LocalBusFactory::dispatch(&self.inner, Event::Cancel { id }).await;
        Ok(())
    }

    async fn done(&self, id: i64, tags: Vec<Tag>) -> anyhow::Result<()> {
        LocalBusFactory::dispatch(&self.inner, Event::Done { id, tags }).await;
        Ok(())
    }

    async fn error(&self, id: i64, code: ErrorCode, reason: String) -> anyhow::Result<()> {
        LocalBusFactory::dispatch(&self.inner, Event::Error { id, code, reason }).await;
        Ok(())
    }

    async fn deschedule(&self, ids: Vec<i64>) -> anyhow::Result<()> {
        LocalBusFactory::dispatch(&self.inner, Event::Deschedule { ids }).await;
        Ok(())
    }

    async fn schedule(&self, node: String, tasks: Vec<Info>) -> anyhow::Result<()> {
        LocalBusFactory::dispatch(&self.inner, Event::Schedule { node, tasks }).await;
        Ok(())
    }

    async fn wake_up(&self) -> anyhow::Result<()> {
        LocalBusFactory::dispatch(&self.inner, Event::WakeUp).await;
        Ok(())
    }

    async fn worker_status(&self, node: String, capacity: usize) -> anyhow::Result<()> {
        LocalBusFactory::dispatch(&self.inner, Event::WorkerStatus { node, capacity }).await;
        Ok(())
    }
}

struct LocalUnsubscribe {
    inner: Arc<Mutex<BusInner>>,
    sub_id: u64,
    topics: Vec<Topic>,
}

#[async_trait]
impl Unsubscribe for LocalUnsubscribe {
    async fn unsubscribe(&self) {
        let mut guard = self.inner.lock().await;
        for topic in &self.topics {
            if let Some(subs) = guard.subs.get_mut(topic) {
                subs.retain(|(id, _)| *id != self.sub_id);
            }
        }
    }
}

#[async_trait]
impl BusFactory for LocalBusFactory {
    fn publish(&self) -> Box<dyn Bus> {
        Box::new(LocalBus {
            inner: self.inner.clone(),
        })
    }

    async fn subscribe_all(
        &self,
        handler: Arc<dyn Handler>,
        consume: bool,
        topics: &[Topic],
    ) -> anyhow::Result<Box<dyn Unsubscribe>> {
        let mut guard = self.inner.lock().await;
        let sub_id = guard.next_sub_id;
        guard.next_sub_id += 1;

        for topic in topics {
            guard.subs.entry(*topic).or_default().push((
                sub_id,
                Subscription {
                    consuming: consume,
                    id_filter: None,
                    handler: handler.clone(),
                },
            ));
        }
        drop(guard);

        Ok(Box::new(LocalUnsubscribe {
            inner: self.inner.clone(),
            sub_id,
            topics: topics.to_vec(),
        }))
    }

    async fn subscribe_one(
        &self,
        handler: Arc<dyn Handler>,
        consume: bool,
        id: i64,
        topics: &[Topic],
    ) -> anyhow::Result<Box<dyn Unsubscribe>> {
        let mut guard = self.inner.lock().await;
        let sub_id = guard.next_sub_id;
        guard.next_sub_id += 1;

        for topic in topics {
            guard.subs.entry(*topic).or_default().push((
                sub_id,
                Subscription {
                    consuming: consume,
                    id_filter: Some(id),
                    handler: handler.clone(),
                },
            ));
        }
        drop(guard);

        Ok(Box::new(LocalUnsubscribe {
            inner: self.inner.clone(),
            sub_id,
            topics: topics.to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_pop_transitions_to_processing() {
        let storage = LocalStorage::new();
        let info = storage.push("http://x/1.jpg".into(), 0).await.unwrap();
        assert_eq!(info.status, Status::Pending);

        let popped = storage.pop(10).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].status, Status::Processing);
        assert_eq!(storage.queue_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pop_orders_by_priority_then_fifo() {
        let storage = LocalStorage::new();
        storage.push("http://x/a.jpg".into(), 0).await.unwrap();
        let high = storage.push("http://x/b.jpg".into(), 5).await.unwrap();
        storage.push("http://x/c.jpg".into(), 0).await.unwrap();

        let popped = storage.pop(10).await.unwrap();
        assert_eq!(popped[0].id, high.id);
        assert_eq!(popped[1].url, "http://x/a.jpg");
        assert_eq!(popped[2].url, "http://x/c.jpg");
    }

    #[tokio::test]
    async fn abort_stalled_resets_old_processing_jobs() {
        let storage = LocalStorage::new();
        storage.push("http://x/1.jpg".into(), 0).await.unwrap();
        storage.pop(1).await.unwrap();

        let stalled = storage.abort_stalled(Duration::from_millis(0)).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(storage.queue_size().await.unwrap(), 1);
    }

    struct RecordingHandler {
        events: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn handle(&self, event: Event) {
            self.events.lock().await.push(event);
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_to_every_subscriber() {
        let factory = LocalBusFactory::new();
        let events_a = Arc::new(Mutex::new(Vec::new()));
        let events_b = Arc::new(Mutex::new(Vec::new()));

        factory
            .subscribe_all(
                Arc::new(RecordingHandler { events: events_a.clone() }),
                false,
                &[Topic::Cancel],
            )
            .await
            .unwrap();
        factory
            .subscribe_all(
                Arc::new(RecordingHandler { events: events_b.clone() }),
                false,
                &[Topic::Cancel],
            )
            .await
            .unwrap();

        factory.publish().cancel(7).await.unwrap();

        assert_eq!(events_a.lock().await.len(), 1);
        assert_eq!(events_b.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn consuming_subscribers_share_one_delivery_per_publish() {
        let factory = LocalBusFactory::new();
        let events_a = Arc::new(Mutex::new(Vec::new()));
        let events_b = Arc::new(Mutex::new(Vec::new()));

        factory
            .subscribe_all(
                Arc::new(RecordingHandler { events: events_a.clone() }),
                true,
                &[Topic::Schedule],
            )
            .await
            .unwrap();
        factory
            .subscribe_all(
                Arc::new(RecordingHandler { events: events_b.clone() }),
                true,
                &[Topic::Schedule],
            )
            .await
            .unwrap();

        for _ in 0..4 {
            factory.publish().schedule("w1".into(), vec![]).await.unwrap();
        }

        let total = events_a.lock().await.len() + events_b.lock().await.len();
        assert_eq!(total, 4);
        // round-robin: both consumers get a share, neither gets all of them
        assert!(events_a.lock().await.len() > 0);
        assert!(events_b.lock().await.len() > 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_deliveries() {
        let factory = LocalBusFactory::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let unsub = factory
            .subscribe_all(
                Arc::new(RecordingHandler { events: events.clone() }),
                false,
                &[Topic::Beat],
            )
            .await
            .unwrap();

        factory.publish().beat(1).await.unwrap();
        unsub.unsubscribe().await;
        factory.publish().beat(1).await.unwrap();

        assert_eq!(events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn subscribe_one_filters_by_job_id() {
        let factory = LocalBusFactory::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        factory
            .subscribe_one(
                Arc::new(RecordingHandler { events: events.clone() }),
                false,
                42,
                &[Topic::Cancel],
            )
            .await
            .unwrap();

        factory.publish().cancel(1).await.unwrap();
        factory.publish().cancel(42).await.unwrap();

        assert_eq!(events.lock().await.len(), 1);
    }
}
