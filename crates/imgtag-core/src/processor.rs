use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessError;
use crate::model::Tag;

/// Anything that can turn a URL into a list of tags, with a bounded amount
/// of work it can accept at once. Implemented by the single-slot
/// subprocess processor and by the pool that multiplexes over several of
/// them.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Run one tagging request to completion or to one of three
    /// cancellation outcomes.
    ///
    /// `global` cancels for process-wide shutdown (`Terminated`), `local`
    /// cancels this one call (`Canceled`), `timeout` is this call's own
    /// deadline (`Timeout`). When `local` and the deadline both fire in the
    /// same poll, `Timeout` wins.
    async fn process(
        &self,
        global: CancellationToken,
        local: CancellationToken,
        timeout: Duration,
        url: &str,
    ) -> Result<Vec<Tag>, ProcessError>;

    /// Number of additional `process` calls that would not block right
    /// now.
    fn capacity(&self) -> usize;

    fn is_ready(&self) -> bool;
}
