use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imgtag_core::{ProcessError, Processor, Tag};
use imgtag_ipc::Message;
use imgtag_nurse::NurseHandle;
use tokio_util::sync::CancellationToken;

/// A `Processor` backed by a single supervised child, talked to over the
/// framed IPC protocol. Capacity is always 0 or 1: there is
/// exactly one request in flight against the underlying child at a time.
pub struct SubprocessProcessor {
    handle: Arc<NurseHandle>,
    busy: AtomicBool,
}

impl SubprocessProcessor {
    pub fn new(handle: Arc<NurseHandle>) -> Self {
        Self {
            handle,
            busy: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Processor for SubprocessProcessor {
    async fn process(
        &self,
        global: CancellationToken,
        local: CancellationToken,
        timeout: Duration,
        url: &str,
    ) -> Result<Vec<Tag>, ProcessError> {
        if !self.handle.is_ready() {
            return Err(ProcessError::Terminated);
        }

        self.busy.store(true, Ordering::SeqCst);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        if self.handle.send(Message::request(url)).await.is_err() {
            self.busy.store(false, Ordering::SeqCst);
            return Err(ProcessError::Terminated);
        }

        // Priority on simultaneous firing: deadline, then local cancel,
        // then global cancel. A timed-out request must report Timeout
        // even if a cancel landed in the same poll.
        let result = tokio::select! {
            biased;

            () = &mut deadline => {
                self.handle.interrupt();
                Err(ProcessError::Timeout)
            }

            () = local.cancelled() => {
                self.handle.interrupt();
                Err(ProcessError::Canceled)
            }

            () = global.cancelled() => {
                self.handle.interrupt();
                Err(ProcessError::Terminated)
            }

            reply = self.handle.recv() => {
                match reply {
                    Some(message) if message.is_shutdown() => Err(ProcessError::Terminated),
                    Some(message) => match message.error {
                        Some(error) => Err(ProcessError::InternalError(error)),
                        None => Ok(message.tags.unwrap_or_default()),
                    },
                    None => Err(ProcessError::Terminated),
                }
            }
        };

        self.busy.store(false, Ordering::SeqCst);
        result
    }

    fn capacity(&self) -> usize {
        if self.handle.is_ready() && !self.busy.load(Ordering::SeqCst) {
            1
        } else {
            0
        }
    }

    fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgtag_nurse::{nurse, NurseConfig};

    fn config(script: &str) -> NurseConfig {
        NurseConfig::new("sh").args(vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn returns_tags_from_a_successful_reply() {
        let script = r#"while IFS= read -r line; do echo '{"tags":[{"name":"dog","score":0.8}]}'; done"#;
        let (nurse, handle) = nurse(config(script));
        let global = CancellationToken::new();
        let run = tokio::spawn(nurse.run(global.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let processor = SubprocessProcessor::new(handle);
        assert_eq!(processor.capacity(), 1);

        let tags = processor
            .process(
                global.clone(),
                CancellationToken::new(),
                Duration::from_secs(2),
                "http://x/1.jpg",
            )
            .await
            .unwrap();
        assert_eq!(tags[0].name, "dog");

        global.cancel();
        let _ = run.await.unwrap();
    }

    #[tokio::test]
    async fn local_cancel_reports_canceled() {
        let script = "while IFS= read -r line; do sleep 5; done";
        let (nurse, handle) = nurse(config(script));
        let global = CancellationToken::new();
        let run = tokio::spawn(nurse.run(global.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let processor = SubprocessProcessor::new(handle);
        let local = CancellationToken::new();
        let local_clone = local.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            local_clone.cancel();
        });

        let result = processor
            .process(global.clone(), local, Duration::from_secs(30), "http://x/1.jpg")
            .await;
        assert!(matches!(result, Err(ProcessError::Canceled)));

        global.cancel();
        let _ = run.await.unwrap();
    }

    #[tokio::test]
    async fn deadline_wins_over_simultaneous_local_cancel() {
        let script = "while IFS= read -r line; do sleep 5; done";
        let (nurse, handle) = nurse(config(script));
        let global = CancellationToken::new();
        let run = tokio::spawn(nurse.run(global.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let processor = SubprocessProcessor::new(handle);
        let local = CancellationToken::new();
        // Cancel immediately, before the tiny deadline below, then sleep
        // long enough that by the time the task is first polled both
        // futures are already ready — exercising the tie-break branch
        // order rather than a timing race.
        local.cancel();

        let result = processor
            .process(global.clone(), local, Duration::from_millis(1), "http://x/1.jpg")
            .await;
        assert!(matches!(result, Err(ProcessError::Timeout)));

        global.cancel();
        let _ = run.await.unwrap();
    }

    #[tokio::test]
    async fn not_ready_before_child_starts_reports_terminated() {
        let (nurse, handle) = nurse(config("sleep 5"));
        let global = CancellationToken::new();
        let processor = SubprocessProcessor::new(handle);
        assert_eq!(processor.capacity(), 0);

        let result = processor
            .process(global.clone(), CancellationToken::new(), Duration::from_secs(1), "http://x/1.jpg")
            .await;
        assert!(matches!(result, Err(ProcessError::Terminated)));

        drop(nurse);
    }
}
