//! The external-facing submission API (`Client`), grounded on the
//! `Client` interface in the original source: job submission and lookup
//! alongside the bus-event handling the `Manager` already does. Intended
//! for an HTTP or gRPC front end to sit on top of.

use async_trait::async_trait;
use imgtag_core::Info;

use crate::Manager;

#[async_trait]
pub trait Client: Send + Sync {
    async fn cancel(&self, id: i64) -> anyhow::Result<()>;
    async fn get(&self, id: i64) -> anyhow::Result<Option<Info>>;
    async fn identify(&self, url: String, priority: i32) -> anyhow::Result<i64>;
}

#[async_trait]
impl Client for Manager {
    async fn cancel(&self, id: i64) -> anyhow::Result<()> {
        self.bus_factory().publish().cancel(id).await
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Info>> {
        self.storage().get(id).await
    }

    async fn identify(&self, url: String, priority: i32) -> anyhow::Result<i64> {
        let info = self.storage().push(url, priority).await?;
        Ok(info.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgtag_auth::NoopAuthorizer;
    use imgtag_bus::{LocalBusFactory, LocalStorage};
    use std::sync::Arc;

    #[tokio::test]
    async fn identify_pushes_and_get_reads_it_back() {
        let manager = Manager::new(
            Arc::new(LocalBusFactory::new()),
            Arc::new(LocalStorage::new()),
            Arc::new(NoopAuthorizer),
            crate::ManagerConfig::default(),
        );

        let id = manager.identify("http://x/1.jpg".to_string(), 5).await.unwrap();
        let info = manager.get(id).await.unwrap().unwrap();
        assert_eq!(info.url, "http://x/1.jpg");
        assert_eq!(info.priority, 5);
    }

    #[tokio::test]
    async fn cancel_publishes_a_cancel_event() {
        let bus = Arc::new(LocalBusFactory::new());
        let manager = Manager::new(
            bus.clone(),
            Arc::new(LocalStorage::new()),
            Arc::new(NoopAuthorizer),
            crate::ManagerConfig::default(),
        );

        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        struct Recorder(Arc<tokio::sync::Mutex<Vec<imgtag_bus::Event>>>);
        #[async_trait]
        impl imgtag_bus::Handler for Recorder {
            async fn handle(&self, event: imgtag_bus::Event) {
                self.0.lock().await.push(event);
            }
        }
        bus.subscribe_all(Arc::new(Recorder(events.clone())), false, &[imgtag_bus::Topic::Cancel])
            .await
            .unwrap();

        manager.cancel(42).await.unwrap();

        let events = events.lock().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], imgtag_bus::Event::Cancel { id: 42 }));
    }
}
