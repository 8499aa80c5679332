use std::sync::atomic::{AtomicBool, Ordering};

use imgtag_ipc::Message;
use tokio::sync::{mpsc, Mutex, Notify};

/// The caller-facing side of a `Nurse`: send/receive framed messages,
/// request an interrupt, and query readiness. Stable across
/// child restarts — the `Nurse`'s run loop rewires a fresh child's stdio to
/// the same channels every generation.
pub struct NurseHandle {
    pub(crate) in_tx: mpsc::Sender<Message>,
    pub(crate) out_rx: Mutex<mpsc::Receiver<Message>>,
    pub(crate) interrupt: Notify,
    pub(crate) ready: AtomicBool,
}

impl NurseHandle {
    /// Send a request to the child. Blocks if the child is slow to drain
    /// its stdin.
    pub async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.in_tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("nurse is stopped"))
    }

    /// Receive the next reply, or `None` once the nurse has torn down for
    /// good (final `{shutdown: true}` already observed, or the outbound
    /// channel closed).
    ///
    /// Only one caller may await this at a time — enforced by `Processor`
    /// capacity 1, not by this type.
    pub async fn recv(&self) -> Option<Message> {
        self.out_rx.lock().await.recv().await
    }

    /// Request that the currently-running child be sent SIGINT. Safe to
    /// call when no child is running (logged, not an error).
    pub fn interrupt(&self) {
        self.interrupt.notify_one();
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
