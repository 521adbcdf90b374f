//! Background synthesis worker
//!
//! A worker runs one request on its own tokio task and reports through a
//! channel: zero or more [`WorkerEvent::Progress`] messages, then exactly one
//! [`WorkerEvent::Ready`] or [`WorkerEvent::Error`].

use crate::tts::{SpeechEngine, SynthesisRequest, TtsError};
use crate::wav::validate_artifact;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    Progress(String),
    Ready(PathBuf),
    Error(String),
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerEvent::Progress(_))
    }
}

pub struct SynthesisWorker {
    engine: Arc<SpeechEngine>,
    request: SynthesisRequest,
}

impl SynthesisWorker {
    pub fn new(engine: Arc<SpeechEngine>, request: SynthesisRequest) -> Self {
        Self { engine, request }
    }

    /// Start the worker on the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let progress_tx = tx.clone();
            let progress = move |message: String| {
                let _ = progress_tx.send(WorkerEvent::Progress(message));
            };
            progress("Starting speech synthesis".to_string());

            let min_bytes = self.engine.fallback_config().min_artifact_bytes;
            let result = self
                .engine
                .synthesize_with_progress(self.request, &task_cancel, &progress)
                .await;

            let event = match result {
                Ok(outcome) if outcome.total_failure => WorkerEvent::Error(format!(
                    "all synthesis methods failed; silence written to {}",
                    outcome.artifact.path.display()
                )),
                Ok(outcome) => match validate_artifact(&outcome.artifact.path, min_bytes) {
                    Ok(bytes) => {
                        debug!(bytes, "artifact verified");
                        WorkerEvent::Ready(outcome.artifact.path)
                    }
                    Err(e) => {
                        warn!("Produced audio failed verification: {}", e);
                        WorkerEvent::Error(format!("generated audio file is invalid: {e}"))
                    }
                },
                Err(TtsError::Cancelled) => WorkerEvent::Error("synthesis cancelled".to_string()),
                Err(e) => WorkerEvent::Error(e.to_string()),
            };
            let _ = tx.send(event);
        });

        WorkerHandle {
            events: rx,
            cancel,
            join,
        }
    }
}

pub struct WorkerHandle {
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain events until the terminal one, returning everything received.
    pub async fn wait(mut self) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        if let Err(e) = self.join.await {
            warn!("Synthesis worker task failed: {}", e);
            if events.last().map_or(true, |e| !e.is_terminal()) {
                events.push(WorkerEvent::Error(format!("worker task failed: {e}")));
            }
        }
        events
    }
}
