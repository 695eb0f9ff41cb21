use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// One progress notification on a request's server-push channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressEvent {
    pub phase: String,
    pub current: u32,
    pub total: u32,
    pub entities: usize,
    pub relations: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Bounded sink for progress notifications. A slow consumer drops events,
/// never stalls the producing pipeline.
#[derive(Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything, for callers without a channel.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(event) {
            trace!(error = %err, "progress notification dropped");
        }
    }
}
