use std::sync::Arc;

use tether_core::TaskId;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Per-task signals shared between the task, its handle, and the registry.
///
/// - `cancel`: cooperative cancellation requested by the handle or `cancel_all`.
/// - `attached`: true while the task holds the shared resource (busy indicator).
/// - `finished`: latched once the body has stopped touching the resource.
#[derive(Debug)]
pub(crate) struct TaskSignals {
    id: TaskId,
    cancel: CancellationToken,
    attached: watch::Sender<bool>,
    finished: watch::Sender<bool>,
}

impl TaskSignals {
    pub(crate) fn new(id: TaskId) -> Arc<Self> {
        Arc::new(Self {
            id,
            cancel: CancellationToken::new(),
            attached: watch::Sender::new(false),
            finished: watch::Sender::new(false),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation. Returns false if it had already been requested.
    pub(crate) fn cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub(crate) fn set_attached(&self, value: bool) {
        self.attached.send_replace(value);
    }

    pub(crate) fn subscribe_attached(&self) -> watch::Receiver<bool> {
        self.attached.subscribe()
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    pub(crate) fn subscribe_finished(&self) -> watch::Receiver<bool> {
        self.finished.subscribe()
    }
}
