//! NATS-backed `BusFactory`. Each topic is one subject (`imgtag.<topic>`);
//! consuming subscribers join a queue group named after the topic so NATS
//! itself does the competing-consumer fan-out, non-consuming subscribers
//! get a plain broadcast subscription.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use imgtag_core::Tag;

use crate::{Bus, BusFactory, Event, Handler, Topic, Unsubscribe};

fn subject(topic: Topic) -> String {
    format!("imgtag.{}", topic.as_str())
}

fn encode(event: &Event) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

fn decode(payload: &[u8]) -> anyhow::Result<Event> {
    Ok(serde_json::from_slice(payload)?)
}

pub struct NatsBusFactory {
    client: async_nats::Client,
}

impl NatsBusFactory {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

struct NatsBus {
    client: async_nats::Client,
}

#[async_trait]
impl Bus for NatsBus {
    async fn beat(&self, id: i64) -> anyhow::Result<()> {
        self.publish(Event::Beat { id }).await
    }

    async fn cancel(&self, id: i64) -> anyhow::Result<()> {
        self.publish(Event::Cancel { id }).await
    }

    async fn done(&self, id: i64, tags: Vec<Tag>) -> anyhow::Result<()> {
        self.publish(Event::Done { id, tags }).await
    }

    async fn error(&self, id: i64, code: imgtag_core::ErrorCode, reason: String) -> anyhow::Result<()> {
        self.publish(Event::Error { id, code, reason }).await
    }

    async fn deschedule(&self, ids: Vec<i64>) -> anyhow::Result<()> {
        self.publish(Event::Deschedule { ids }).await
    }

    async fn schedule(&self, node: String, tasks: Vec<imgtag_core::Info>) -> anyhow::Result<()> {
        self.publish(Event::Schedule { node, tasks }).await
    }

    async fn wake_up(&self) -> anyhow::Result<()> {
        self.publish(Event::WakeUp).await
    }

    async fn worker_status(&self, node: String, capacity: usize) -> anyhow::Result<()> {
        self.publish(Event::WorkerStatus { node, capacity }).await
    }
}

impl NatsBus {
    async fn publish(&self, event: Event) -> anyhow::Result<()> {
        let subject = subject(event.topic());
        let payload = encode(&event)?;
        self.client.publish(subject, payload.into()).await?;
        Ok(())
    }
}

struct NatsUnsubscribe {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl Unsubscribe for NatsUnsubscribe {
    async fn unsubscribe(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn spawn_subscription(
    client: async_nats::Client,
    topic: Topic,
    consume: bool,
    id_filter: Option<i64>,
    handler: Arc<dyn Handler>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let subject = subject(topic);

    let mut subscriber = if consume {
        client.queue_subscribe(subject.clone(), subject).await?
    } else {
        client.subscribe(subject.clone()).await?
    };

    Ok(tokio::spawn(async move {
        while let Some(message) = subscriber.next().await {
            let event = match decode(&message.payload) {
                Ok(event) => event,
                Err(err) => {
                    log::warn!("skipping unparseable nats payload on {subject}: {err}");
                    continue;
                }
            };

            if let Some(filter) = id_filter {
                if event.job_id() != Some(filter) {
                    continue;
                }
            }

            handler.handle(event).await;
        }
    }))
}

#[async_trait]
impl BusFactory for NatsBusFactory {
    fn publish(&self) -> Box<dyn Bus> {
        Box::new(NatsBus {
            client: self.client.clone(),
        })
    }

    async fn subscribe_all(
        &self,
        handler: Arc<dyn Handler>,
        consume: bool,
        topics: &[Topic],
    ) -> anyhow::Result<Box<dyn Unsubscribe>> {
        let mut tasks = Vec::with_capacity(topics.len());
        for topic in topics {
            tasks.push(
                spawn_subscription(self.client.clone(), *topic, consume, None, handler.clone())
                    .await?,
            );
        }
        Ok(Box::new(NatsUnsubscribe { tasks }))
    }

    async fn subscribe_one(
        &self,
        handler: Arc<dyn Handler>,
        consume: bool,
        id: i64,
        topics: &[Topic],
    ) -> anyhow::Result<Box<dyn Unsubscribe>> {
        let mut tasks = Vec::with_capacity(topics.len());
        for topic in topics {
            tasks.push(
                spawn_subscription(self.client.clone(), *topic, consume, Some(id), handler.clone())
                    .await?,
            );
        }
        Ok(Box::new(NatsUnsubscribe { tasks }))
    }
}
