//! Forwards a mask stream into the worker's command queue

use crossbeam_channel::Sender;
use futures_util::future::{AbortHandle, Abortable};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::worker::Command;

use super::client::{MaskStream, MaskStreamError};

/// What a finished forwarding task delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardSummary {
    pub batches: usize,
    pub masks: usize,
    /// Parts skipped because their payload did not parse
    pub skipped: usize,
}

/// A running forwarding task. Aborting it drops the HTTP response, which
/// ends the request without touching decode or playback.
pub struct MaskStreamTask {
    abort: AbortHandle,
    join: tokio::task::JoinHandle<Result<Result<ForwardSummary, MaskStreamError>, futures_util::future::Aborted>>,
}

impl MaskStreamTask {
    pub fn abort(&self) {
        debug!("mask stream abort requested");
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Handle that aborts the task from elsewhere
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub async fn wait(self) -> Result<ForwardSummary, MaskStreamError> {
        match self.join.await {
            Ok(Ok(result)) => result,
            Ok(Err(_aborted)) => Err(MaskStreamError::Aborted),
            Err(e) => Err(MaskStreamError::Task(e.to_string())),
        }
    }
}

/// Spawn a task on the current tokio runtime that sends every batch to
/// the worker as [`Command::SetMasks`].
pub fn forward_masks(stream: MaskStream, commands: Sender<Command>) -> MaskStreamTask {
    let (abort, registration) = AbortHandle::new_pair();
    let join = tokio::spawn(Abortable::new(pump(stream, commands), registration));
    MaskStreamTask { abort, join }
}

async fn pump(mut stream: MaskStream, commands: Sender<Command>) -> Result<ForwardSummary, MaskStreamError> {
    let mut summary = ForwardSummary::default();
    while let Some(item) = stream.next().await {
        let batch = match item {
            Ok(batch) => batch,
            Err(MaskStreamError::Payload(e)) => {
                warn!(error = %e, "skipping unreadable mask batch");
                summary.skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        summary.batches += 1;
        summary.masks += batch.masks.len();
        if commands.send(Command::SetMasks(batch)).is_err() {
            debug!("worker gone, mask stream stopped");
            break;
        }
    }
    info!(batches = summary.batches, masks = summary.masks, skipped = summary.skipped, "mask stream finished");
    Ok(summary)
}
