use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Handed to every handler invocation.
///
/// The token is cancelled when the handler overruns its timeout or the worker
/// pool shuts down. Handlers are expected to watch it: the processor never
/// kills a running handler, it only asks.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub cancellation_token: CancellationToken,
    pub job_id: String,
    /// 1 for the first run, 2 for the first retry, and so on.
    pub attempt: u32,
    pub deadline: Instant,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Resolves once the handler should stop.
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }
}
