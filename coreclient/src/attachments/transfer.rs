// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-attachment transfer state machine.
//!
//! A [`TransferTracker`] guards one upload or download: progress is clamped
//! and monotonic, late callbacks after completion or failure are ignored,
//! and every successful phase transition emits exactly one event to
//! subscribers.

use std::{
    future::Future,
    path::PathBuf,
    pin::Pin,
    sync::{Mutex, PoisonError},
};

use tokio::sync::watch;
use tokio_stream::{Stream, wrappers::WatchStream};
use tracing::debug;
use url::Url;
use wrencommon::identifiers::AttachmentId;

use crate::errors::TransferError;

use super::TransferPhase;

/// A transfer driven to completion by its owner task.
pub type TransferTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Init,
    Progress { bytes_transferred: u64, total: u64 },
    Completed,
    Failed,
}

/// Handle to observe the events of one transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    rx: watch::Receiver<TransferEvent>,
}

impl TransferProgress {
    pub fn stream(&self) -> impl Stream<Item = TransferEvent> + Send + 'static {
        WatchStream::new(self.rx.clone())
    }

    pub fn latest(&self) -> TransferEvent {
        self.rx.borrow().clone()
    }
}

#[derive(Debug)]
struct TrackerInner {
    phase: TransferPhase,
    total: u64,
    bytes_transferred: u64,
    local_path: Option<PathBuf>,
    remote_url: Option<Url>,
    failure: Option<TransferError>,
}

#[derive(Debug)]
pub struct TransferTracker {
    attachment_id: AttachmentId,
    inner: Mutex<TrackerInner>,
    events_tx: watch::Sender<TransferEvent>,
}

impl TransferTracker {
    pub fn new(attachment_id: AttachmentId) -> Self {
        let (events_tx, _) = watch::channel(TransferEvent::Init);
        Self {
            attachment_id,
            inner: Mutex::new(TrackerInner {
                phase: TransferPhase::Pending,
                total: 0,
                bytes_transferred: 0,
                local_path: None,
                remote_url: None,
                failure: None,
            }),
            events_tx,
        }
    }

    pub fn attachment_id(&self) -> AttachmentId {
        self.attachment_id
    }

    pub fn subscribe(&self) -> TransferProgress {
        TransferProgress {
            rx: self.events_tx.subscribe(),
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.lock().phase
    }

    pub fn failure(&self) -> Option<TransferError> {
        self.lock().failure.clone()
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.lock().local_path.clone()
    }

    pub fn remote_url(&self) -> Option<Url> {
        self.lock().remote_url.clone()
    }

    /// Fractional progress in `[0.0, 1.0]`, monotonically non-decreasing.
    pub fn fraction(&self) -> f64 {
        let inner = self.lock();
        match inner.phase {
            TransferPhase::Available => 1.0,
            _ if inner.total == 0 => 0.0,
            _ => inner.bytes_transferred as f64 / inner.total as f64,
        }
    }

    /// Starts the transfer. No-op unless the transfer is still pending.
    pub fn start(&self, total: u64) -> bool {
        let mut inner = self.lock();
        if inner.phase != TransferPhase::Pending {
            return false;
        }
        inner.phase = TransferPhase::Transferring;
        inner.total = total;
        drop(inner);
        self.events_tx.send_replace(TransferEvent::Init);
        true
    }

    /// Records a progress callback.
    ///
    /// Values are clamped to `[0, total]` and may only grow; duplicate or
    /// late reports (including any report after `complete` or `fail`) are
    /// ignored without emitting an event. Returns the clamped byte count if
    /// progress advanced.
    pub fn progress(&self, bytes_transferred: u64) -> Option<u64> {
        let mut inner = self.lock();
        if inner.phase != TransferPhase::Transferring {
            debug!(
                attachment_id =% self.attachment_id,
                phase =? inner.phase,
                "ignoring late progress callback"
            );
            return None;
        }
        let clamped = bytes_transferred.min(inner.total);
        if clamped <= inner.bytes_transferred {
            return None;
        }
        inner.bytes_transferred = clamped;
        let total = inner.total;
        drop(inner);
        self.events_tx.send_replace(TransferEvent::Progress {
            bytes_transferred: clamped,
            total,
        });
        Some(clamped)
    }

    /// Completes the transfer. No-op if the transfer already ended.
    pub fn complete(&self, local_path: PathBuf, remote_url: Option<Url>) -> bool {
        let mut inner = self.lock();
        if inner.phase.is_terminal() {
            return false;
        }
        inner.phase = TransferPhase::Available;
        inner.bytes_transferred = inner.total;
        inner.local_path = Some(local_path);
        inner.remote_url = remote_url;
        drop(inner);
        self.events_tx.send_replace(TransferEvent::Completed);
        true
    }

    /// Fails the transfer. No-op if the transfer already ended.
    pub fn fail(&self, error: TransferError) -> bool {
        let mut inner = self.lock();
        if inner.phase.is_terminal() {
            return false;
        }
        inner.phase = TransferPhase::Failed;
        inner.failure = Some(error);
        drop(inner);
        self.events_tx.send_replace(TransferEvent::Failed);
        true
    }

    pub fn cancel(&self) -> bool {
        self.fail(TransferError::cancelled())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let tracker = TransferTracker::new(AttachmentId::random());
        assert!(tracker.start(1000));
        assert_eq!(tracker.progress(300), Some(300));
        // duplicate/late smaller report keeps the reported progress at 300
        assert_eq!(tracker.progress(150), None);
        assert_eq!(tracker.fraction(), 0.3);
        assert_eq!(tracker.phase(), TransferPhase::Transferring);
        // values past the total are clamped
        assert_eq!(tracker.progress(2000), Some(1000));
    }

    #[test]
    fn late_calls_after_completion_are_ignored() {
        let tracker = TransferTracker::new(AttachmentId::random());
        tracker.start(100);
        assert!(tracker.complete(PathBuf::from("/tmp/file"), None));
        assert_eq!(tracker.progress(50), None);
        assert!(!tracker.fail(TransferError::new("late", true)));
        assert!(!tracker.complete(PathBuf::from("/tmp/other"), None));
        assert_eq!(tracker.phase(), TransferPhase::Available);
        assert_eq!(tracker.local_path(), Some(PathBuf::from("/tmp/file")));
    }

    #[test]
    fn cancel_fails_with_retryable_reason() {
        let tracker = TransferTracker::new(AttachmentId::random());
        tracker.start(100);
        assert!(tracker.cancel());
        assert_eq!(tracker.phase(), TransferPhase::Failed);
        let failure = tracker.failure().unwrap();
        assert_eq!(failure.reason(), "cancelled");
        assert!(failure.is_retryable());
        // no further progress is applied after cancellation
        assert_eq!(tracker.progress(10), None);
    }

    #[test]
    fn double_start_is_ignored() {
        let tracker = TransferTracker::new(AttachmentId::random());
        assert!(tracker.start(100));
        tracker.progress(10);
        assert!(!tracker.start(200));
        assert_eq!(tracker.fraction(), 0.1);
    }

    #[tokio::test]
    async fn each_transition_emits_one_event() {
        let tracker = TransferTracker::new(AttachmentId::random());
        let progress = tracker.subscribe();
        let mut events = progress.stream();
        // initial watch value
        assert_eq!(events.next().await, Some(TransferEvent::Init));

        tracker.start(100);
        assert_eq!(events.next().await, Some(TransferEvent::Init));
        tracker.progress(40);
        assert_eq!(
            events.next().await,
            Some(TransferEvent::Progress {
                bytes_transferred: 40,
                total: 100
            })
        );
        tracker.complete(PathBuf::from("/tmp/file"), None);
        assert_eq!(events.next().await, Some(TransferEvent::Completed));
    }
}
