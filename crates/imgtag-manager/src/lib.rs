//! Tick loop, stalled-job reclamation, and event-driven dispatch/bookkeeping
//!, plus a `Client` facade for submitting and tracking jobs
//! restored from the original `Client` contract (not explicitly spelled
//! out in every later draft of this spec, but named in its data-flow
//! description).

mod client;

pub use client::Client;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imgtag_auth::Authorizer;
use imgtag_bus::{BusFactory, Event, Handler, Storage, Topic};
use imgtag_core::ErrorCode;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub tick_interval: Duration,
    pub stalled_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            stalled_interval: Duration::from_secs(30),
        }
    }
}

pub struct Manager {
    bus_factory: Arc<dyn BusFactory>,
    storage: Arc<dyn Storage>,
    authorizer: Arc<dyn Authorizer>,
    config: ManagerConfig,
    running: AtomicBool,
}

impl Manager {
    pub fn new(
        bus_factory: Arc<dyn BusFactory>,
        storage: Arc<dyn Storage>,
        authorizer: Arc<dyn Authorizer>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus_factory,
            storage,
            authorizer,
            config,
            running: AtomicBool::new(false),
        })
    }

    pub async fn run(self: Arc<Self>, global: CancellationToken) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Manager::run called twice");
        }

        let handler: Arc<dyn Handler> = Arc::new(ManagerHandler {
            manager: self.clone(),
        });
        let subscription = self
            .bus_factory
            .subscribe_all(
                handler,
                true,
                &[
                    Topic::Beat,
                    Topic::Cancel,
                    Topic::Done,
                    Topic::Error,
                    Topic::Deschedule,
                    Topic::WorkerStatus,
                ],
            )
            .await?;

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = global.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        subscription.unsubscribe().await;
        Ok(())
    }

    /// `Storage.AbortStalled` returns to reclaim; a publish failure aborts
    /// the rest of this tick rather than silently dropping the affected
    /// jobs — they remain `Processing` and will be re-observed by
    /// `AbortStalled` on the next tick.
    async fn tick(&self) {
        let stalled = match self.storage.abort_stalled(self.config.stalled_interval).await {
            Ok(stalled) => stalled,
            Err(err) => {
                log::warn!("abort_stalled failed, retrying next tick: {err}");
                return;
            }
        };

        for job in stalled {
            let publisher = self.bus_factory.publish();
            if let Err(err) = publisher.cancel(job.id).await {
                log::warn!(
                    "failed to publish cancel for stalled job {}, aborting this tick, will retry: {err}",
                    job.id
                );
                return;
            }
            if let Err(err) = publisher
                .error(job.id, ErrorCode::Timeout, "timeout".to_string())
                .await
            {
                log::warn!(
                    "failed to publish error for stalled job {}, aborting this tick, will retry: {err}",
                    job.id
                );
                return;
            }
        }
    }

    async fn on_beat(&self, id: i64) {
        if let Err(err) = self.storage.beat(id).await {
            log::warn!("storage.beat({id}) failed: {err}");
        }
    }

    async fn on_cancel(&self, id: i64) {
        if let Err(err) = self.storage.error(id, ErrorCode::Canceled, String::new()).await {
            log::warn!("storage.error({id}, Canceled) failed: {err}");
        }
    }

    async fn on_done(&self, id: i64, tags: Vec<imgtag_core::Tag>) {
        if let Err(err) = self.storage.done(id, tags).await {
            log::warn!("storage.done({id}) failed: {err}");
        }
    }

    async fn on_error(&self, id: i64, code: ErrorCode, reason: String) {
        if let Err(err) = self.storage.error(id, code, reason).await {
            log::warn!("storage.error({id}, {code:?}) failed: {err}");
        }
    }

    async fn on_deschedule(&self, ids: Vec<i64>) {
        if let Err(err) = self.storage.reset(&ids).await {
            log::warn!("storage.reset({ids:?}) failed: {err}");
            return;
        }
        if let Err(err) = self.bus_factory.publish().wake_up().await {
            log::warn!("failed to publish wakeup after deschedule: {err}");
        }
    }

    /// `capacity + capacity/3` (~133%) over-commits so a worker finishing
    /// its current batch already has a next one in flight; bounded because
    /// `Pop` moves jobs to `Processing`, so a worker can never be handed
    /// the same job twice.
    async fn on_worker_status(&self, node: String, capacity: usize) {
        if capacity == 0 {
            return;
        }
        let to_schedule = capacity + capacity / 3;

        let todo = match self.storage.pop(to_schedule).await {
            Ok(todo) => todo,
            Err(err) => {
                log::warn!("storage.pop({to_schedule}) for {node} failed: {err}");
                return;
            }
        };
        if todo.is_empty() {
            return;
        }

        if let Err(err) = self.bus_factory.publish().schedule(node.clone(), todo).await {
            log::warn!("failed to publish schedule for {node}: {err}");
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn bus_factory(&self) -> &Arc<dyn BusFactory> {
        &self.bus_factory
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }
}

struct ManagerHandler {
    manager: Arc<Manager>,
}

#[async_trait]
impl Handler for ManagerHandler {
    async fn handle(&self, event: Event) {
        match event {
            Event::Beat { id } => self.manager.on_beat(id).await,
            Event::Cancel { id } => self.manager.on_cancel(id).await,
            Event::Done { id, tags } => self.manager.on_done(id, tags).await,
            Event::Error { id, code, reason } => self.manager.on_error(id, code, reason).await,
            Event::Deschedule { ids } => self.manager.on_deschedule(ids).await,
            Event::WorkerStatus { node, capacity } => {
                self.manager.on_worker_status(node, capacity).await
            }
            Event::Schedule {.. } | Event::WakeUp => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgtag_auth::NoopAuthorizer;
    use imgtag_bus::{LocalBusFactory, LocalStorage};

    fn manager(config: ManagerConfig) -> (Arc<Manager>, Arc<LocalBusFactory>, Arc<LocalStorage>) {
        let bus = Arc::new(LocalBusFactory::new());
        let storage = Arc::new(LocalStorage::new());
        let manager = Manager::new(bus.clone(), storage.clone(), Arc::new(NoopAuthorizer), config);
        (manager, bus, storage)
    }

    #[tokio::test]
    async fn worker_status_dispatches_overcommitted_batch() {
        let (manager, bus, storage) = manager(ManagerConfig::default());
        for i in 0..3 {
            storage.push(format!("http://x/{i}.jpg"), 0).await.unwrap();
        }

        let scheduled = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        struct Recorder(Arc<tokio::sync::Mutex<Vec<Event>>>);
        #[async_trait]
        impl Handler for Recorder {
            async fn handle(&self, event: Event) {
                self.0.lock().await.push(event);
            }
        }
        bus.subscribe_all(Arc::new(Recorder(scheduled.clone())), false, &[Topic::Schedule])
            .await
            .unwrap();

        manager.on_worker_status("w1".to_string(), 2).await;

        let events = scheduled.lock().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Schedule { node, tasks } => {
                assert_eq!(node, "w1");
                assert_eq!(tasks.len(), 2); // capacity 2 -> pop(2 + 0) = 2, bounded by queue depth
            }
            _ => panic!("expected a schedule event"),
        }
    }

    #[tokio::test]
    async fn zero_capacity_status_does_not_dispatch() {
        let (manager, _bus, storage) = manager(ManagerConfig::default());
        storage.push("http://x/1.jpg".to_string(), 0).await.unwrap();

        manager.on_worker_status("w1".to_string(), 0).await;

        assert_eq!(storage.queue_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn on_error_persists_failed_status() {
        let (manager, _bus, storage) = manager(ManagerConfig::default());
        let info = storage.push("http://x/1.jpg".to_string(), 0).await.unwrap();
        storage.pop(1).await.unwrap();

        manager
            .on_error(info.id, ErrorCode::Timeout, "timeout".to_string())
            .await;

        let record = storage.get(info.id).await.unwrap().unwrap();
        assert_eq!(record.status, imgtag_core::Status::Failed);
        assert_eq!(record.error_code, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn tick_reclaims_stalled_jobs_and_publishes_cancel_then_error() {
        let (manager, bus, storage) = manager(ManagerConfig {
            tick_interval: Duration::from_secs(60),
            stalled_interval: Duration::from_millis(0),
        });
        let info = storage.push("http://x/1.jpg".to_string(), 0).await.unwrap();
        storage.pop(1).await.unwrap();

        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        struct Recorder(Arc<tokio::sync::Mutex<Vec<Event>>>);
        #[async_trait]
        impl Handler for Recorder {
            async fn handle(&self, event: Event) {
                self.0.lock().await.push(event);
            }
        }
        bus.subscribe_all(
            Arc::new(Recorder(events.clone())),
            false,
            &[Topic::Cancel, Topic::Error],
        )
            .await
            .unwrap();

        manager.tick().await;

        let events = events.lock().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Cancel { id } if *id == info.id));
        assert!(matches!(&events[1], Event::Error { id, code: ErrorCode::Timeout,.. } if *id == info.id));
    }
}
