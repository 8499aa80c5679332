//! A long-running actor bound to a node name: subscribes to schedule/cancel
//! events, runs each job through a `Processor`, heartbeats while in
//! flight, and drains gracefully on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use imgtag_bus::{Bus, BusFactory, Event, Handler, Topic, Unsubscribe};
use imgtag_core::{ErrorCode, Info, JobContext, ProcessError, Processor};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

/// Tunables with their production defaults.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub tick_interval: Duration,
    pub beat_interval: Duration,
    pub process_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            beat_interval: Duration::from_secs(15),
            process_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Worker {
    name: String,
    bus_factory: Arc<dyn BusFactory>,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
    jobs: Mutex<HashMap<i64, JobContext>>,
    global: OnceCell<CancellationToken>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        bus_factory: Arc<dyn BusFactory>,
        processor: Arc<dyn Processor>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            bus_factory,
            processor,
            config,
            jobs: Mutex::new(HashMap::new()),
            global: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs until `global` is canceled, then drains in-flight jobs before
    /// returning. Every in-flight job is allowed to finish; only `global`
    /// cascading into `Processor::process` can cut one short.
    pub async fn run(self: Arc<Self>, global: CancellationToken) -> anyhow::Result<()> {
        self.global
            .set(global.clone())
            .map_err(|_| anyhow::anyhow!("Worker::run called twice"))?;

        let handler: Arc<dyn Handler> = Arc::new(WorkerHandler {
            worker: self.clone(),
        });

        let schedule_sub = self
            .bus_factory
            .subscribe_all(handler.clone(), true, &[Topic::Schedule, Topic::WakeUp])
            .await?;
        let cancel_sub = self
            .bus_factory
            .subscribe_all(handler.clone(), false, &[Topic::Cancel])
            .await?;

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = global.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        schedule_sub.unsubscribe().await;
        cancel_sub.unsubscribe().await;

        self.drain().await;
        Ok(())
    }

    async fn tick(&self) {
        self.gc().await;
        if let Err(err) = self.publish_status().await {
            log::warn!("worker {}: failed to publish status: {err}", self.name);
        }
    }

    async fn gc(&self) {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|_, ctx| !ctx.cancel.is_cancelled());
    }

    async fn publish_status(&self) -> anyhow::Result<()> {
        let capacity = self.processor.capacity();
        self.bus_factory
            .publish()
            .worker_status(self.name.clone(), capacity)
            .await
    }

    async fn on_schedule(self: &Arc<Self>, node: String, tasks: Vec<Info>) {
        if node != self.name {
            return;
        }
        for task in tasks {
            self.clone().spawn_job(task).await;
        }
    }

    async fn on_cancel(&self, id: i64) {
        let cancel = {
            let mut jobs = self.jobs.lock().await;
            jobs.remove(&id).map(|ctx| ctx.cancel)
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    async fn on_wake_up(&self) {
        if let Err(err) = self.publish_status().await {
            log::warn!("worker {}: failed to publish status: {err}", self.name);
        }
    }

    async fn spawn_job(self: Arc<Self>, info: Info) {
        let id = info.id;
        let cancel = CancellationToken::new();

        {
            let mut jobs = self.jobs.lock().await;
            if jobs.contains_key(&id) {
                log::debug!("worker {}: duplicate schedule for job {id}, ignoring", self.name);
                return;
            }
            jobs.insert(
                id,
                JobContext {
                    id,
                    cancel: cancel.clone(),
                    deadline: Instant::now() + self.config.process_timeout,
                },
            );
        }

        tokio::spawn(async move {
            self.run_job(info, cancel).await;
        });
    }

    async fn run_job(self: Arc<Self>, info: Info, local: CancellationToken) {
        let id = info.id;

        let heartbeat = {
            let worker = self.clone();
            let local = local.clone();
            tokio::spawn(async move { worker.heartbeat_loop(id, local).await })
        };

        let global = self
            .global
            .get()
            .cloned()
            .unwrap_or_else(CancellationToken::new);

        let result = self
            .processor
            .process(global, local.clone(), self.config.process_timeout, &info.url)
            .await;

        let publish_result = match result {
            Ok(tags) => self.bus_factory.publish().done(id, tags).await,
            Err(ProcessError::Canceled) => Ok(()),
            Err(ProcessError::Timeout) => {
                self.bus_factory
                    .publish()
                    .error(id, ErrorCode::Timeout, "timeout".to_string())
                    .await
            }
            Err(ProcessError::Invalid(reason)) => {
                self.bus_factory
                    .publish()
                    .error(id, ErrorCode::Invalid, reason)
                    .await
            }
            Err(ProcessError::Terminated) => {
                self.bus_factory
                    .publish()
                    .error(id, ErrorCode::Terminated, "terminated".to_string())
                    .await
            }
            Err(ProcessError::InternalError(reason)) => {
                self.bus_factory
                    .publish()
                    .error(id, ErrorCode::InternalError, reason)
                    .await
            }
        };
        if let Err(err) = publish_result {
            log::warn!("worker {}: failed to publish outcome for job {id}: {err}", self.name);
        }

        local.cancel();
        let _ = heartbeat.await;

        self.jobs.lock().await.remove(&id);
    }

    async fn heartbeat_loop(&self, id: i64, local: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.beat_interval);
        interval.tick().await; // first tick is immediate; the first beat is one interval later

        loop {
            tokio::select! {
                _ = local.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.bus_factory.publish().beat(id).await {
                        log::warn!("worker {}: failed to publish beat for job {id}: {err}", self.name);
                    }
                }
            }
        }
    }

    /// Repeatedly snapshots the active job table and waits for each entry
    /// to be canceled (by its own handler, on completion) before removing
    /// it, until the table is empty. Never holds `jobs` across an await.
    async fn drain(&self) {
        loop {
            let tokens: Vec<CancellationToken> = {
                let jobs = self.jobs.lock().await;
                if jobs.is_empty() {
                    return;
                }
                jobs.values().map(|ctx| ctx.cancel.clone()).collect()
            };

            for token in tokens {
                token.cancelled().await;
            }
        }
    }
}

struct WorkerHandler {
    worker: Arc<Worker>,
}

#[async_trait]
impl Handler for WorkerHandler {
    async fn handle(&self, event: Event) {
        match event {
            Event::Schedule { node, tasks } => self.worker.on_schedule(node, tasks).await,
            Event::Cancel { id } => self.worker.on_cancel(id).await,
            Event::WakeUp => self.worker.on_wake_up().await,
            _ => {}
        }
    }
}
