use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imgtag_core::{ProcessError, Processor, Tag};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Multiplexes a fixed set of single-capacity `Processor`s behind one
/// `Processor` facade, admitting callers strictly in arrival order
///. The channel only ever holds processors that are
/// currently idle; a checked-out processor is simply absent from it until
/// returned.
pub struct PooledProcessor {
    tx: mpsc::Sender<Arc<dyn Processor>>,
    rx: Mutex<mpsc::Receiver<Arc<dyn Processor>>>,
    free: AtomicUsize,
    size: usize,
}

impl PooledProcessor {
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Self {
        let size = processors.len();
        let (tx, rx) = mpsc::channel(size.max(1));
        for processor in processors {
            tx.try_send(processor)
                .expect("channel capacity equals pool size");
        }

        Self {
            tx,
            rx: Mutex::new(rx),
            free: AtomicUsize::new(size),
            size,
        }
    }

    async fn acquire(&self) -> Arc<dyn Processor> {
        let mut guard = self.rx.lock().await;
        let processor = guard
            .recv()
            .await
            .expect("pool sender is held by self, channel never closes");
        drop(guard);
        self.free.fetch_sub(1, Ordering::SeqCst);
        processor
    }

    async fn release(&self, processor: Arc<dyn Processor>) {
        self.free.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(processor).await;
    }
}

#[async_trait]
impl Processor for PooledProcessor {
    async fn process(
        &self,
        global: CancellationToken,
        local: CancellationToken,
        timeout: Duration,
        url: &str,
    ) -> Result<Vec<Tag>, ProcessError> {
        let processor = self.acquire().await;
        let result = processor.process(global, local, timeout, url).await;
        self.release(processor).await;
        result
    }

    fn capacity(&self) -> usize {
        self.free.load(Ordering::SeqCst)
    }

    /// Non-blocking snapshot of the currently idle members. The original
    /// `range`-over-an-unclosed-channel approach blocks forever and is
    /// fixed here: drain whatever is buffered right now, probe each one,
    /// then put them all back.
    ///
    /// Checked-out (busy) members can't be probed without disturbing the
    /// in-flight call, so they're assumed ready; a pool with nothing idle
    /// and nothing checked out reports not ready.
    fn is_ready(&self) -> bool {
        let free_snapshot = self.free.load(Ordering::SeqCst);

        let Ok(mut guard) = self.rx.try_lock() else {
            // Someone is mid-acquire or mid-release; fall back to the
            // last free-count snapshot rather than blocking.
            return free_snapshot > 0 || free_snapshot < self.size;
        };

        let mut idle = Vec::new();
        while let Ok(processor) = guard.try_recv() {
            idle.push(processor);
        }
        drop(guard);

        let any_idle_ready = idle.iter().any(|p| p.is_ready());
        let had_busy = free_snapshot < self.size;

        for processor in idle {
            let _ = self.tx.try_send(processor);
        }

        any_idle_ready || had_busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct StubProcessor {
        ready: AtomicBool,
        calls: StdMutex<Vec<String>>,
    }

    impl StubProcessor {
        fn new(ready: bool) -> Self {
            Self {
                ready: AtomicBool::new(ready),
                calls: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Processor for StubProcessor {
        async fn process(
            &self,
            _global: CancellationToken,
            _local: CancellationToken,
            _timeout: Duration,
            url: &str,
        ) -> Result<Vec<Tag>, ProcessError> {
            self.calls.lock().unwrap().push(url.to_string());
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(vec![])
        }

        fn capacity(&self) -> usize {
            if self.ready.load(Ordering::SeqCst) {
                1
            } else {
                0
            }
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn admits_callers_up_to_pool_size_concurrently() {
        let pool = Arc::new(PooledProcessor::new(vec![
            Arc::new(StubProcessor::new(true)),
            Arc::new(StubProcessor::new(true)),
        ]));
        assert_eq!(pool.capacity(), 2);

        let mut tasks = Vec::new();
        for i in 0..4 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.process(
                    CancellationToken::new(),
                    CancellationToken::new(),
                    Duration::from_secs(1),
                    &format!("http://x/{i}.jpg"),
                )
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(pool.capacity(), 2);
    }

    #[tokio::test]
    async fn is_ready_false_when_sole_idle_member_is_unready() {
        let pool = PooledProcessor::new(vec![Arc::new(StubProcessor::new(false))]);
        assert!(!pool.is_ready());
    }

    #[tokio::test]
    async fn is_ready_true_when_any_idle_member_is_ready() {
        let pool = PooledProcessor::new(vec![
            Arc::new(StubProcessor::new(false)),
            Arc::new(StubProcessor::new(true)),
        ]);
        assert!(pool.is_ready());
    }

    #[tokio::test]
    async fn is_ready_does_not_deadlock_when_pool_fully_checked_out() {
        let pool = Arc::new(PooledProcessor::new(vec![Arc::new(StubProcessor::new(true))]));
        let pool2 = pool.clone();
        let task = tokio::spawn(async move {
            pool2
                .process(
                    CancellationToken::new(),
                    CancellationToken::new(),
                    Duration::from_secs(1),
                    "http://x/1.jpg",
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        // Nothing idle, one member checked out: must return promptly
        // rather than blocking on a never-closed channel.
        assert!(pool.is_ready());

        task.await.unwrap().unwrap();
    }
}
