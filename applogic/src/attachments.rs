// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervision of attachment transfers for one open dialog.

use std::{
    collections::{HashMap, hash_map},
    pin::pin,
    sync::Arc,
};

use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};
use wrencommon::identifiers::{AttachmentId, DialogId};
use wrencoreclient::store::Store;

use crate::util::spawn_from_sync;

type InProgressMap = Arc<Mutex<HashMap<AttachmentId, TransferTaskHandle>>>;

/// Runs the attachment transfers of one dialog.
///
/// * Listens to store notifications and starts transfers for attachments
///   that are added or pending.
/// * Deduplicates transfers per attachment id.
/// * Cancelling the repository's token (or dropping the repository) cancels
///   every transfer that is still in flight; completed transfers are
///   unaffected.
pub(crate) struct AttachmentsRepository<S>
where
    S: Store + Clone + Send + Sync + 'static,
{
    store: S,
    cancel: CancellationToken,
    in_progress: InProgressMap,
    _cancel: DropGuard,
}

impl<S> AttachmentsRepository<S>
where
    S: Store + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(store: S, dialog_id: DialogId, cancel: CancellationToken) -> Self {
        let in_progress = InProgressMap::default();
        spawn_from_sync(transfers_loop(
            store.clone(),
            dialog_id,
            in_progress.clone(),
            cancel.clone(),
        ));

        Self {
            store,
            in_progress,
            cancel: cancel.clone(),
            _cancel: cancel.drop_guard(),
        }
    }

    /// Ensures a transfer is running for the attachment.
    ///
    /// Used for explicit redownloads; a retry-eligible failed transfer is
    /// restarted, a running one is left alone.
    pub(crate) async fn ensure_transfer(&self, attachment_id: AttachmentId) -> anyhow::Result<()> {
        let mut in_progress = self.in_progress.lock().await;
        if let hash_map::Entry::Occupied(entry) = in_progress.entry(attachment_id)
            && !entry.get().cancel.is_cancelled()
        {
            return Ok(());
        }
        let (_progress, task) = self.store.start_transfer(attachment_id).await?;
        run_transfer(&self.store, &mut in_progress, &self.cancel, attachment_id, task);
        Ok(())
    }
}

async fn transfers_loop<S>(
    store: S,
    dialog_id: DialogId,
    in_progress: InProgressMap,
    cancel: CancellationToken,
) where
    S: Store + Clone + Send + Sync + 'static,
{
    info!(%dialog_id, "starting attachment transfers loop");

    let mut store_notifications = pin!(store.subscribe());
    loop {
        if cancel.is_cancelled() {
            return;
        }

        // start transfers for pending attachments of this dialog
        match store.pending_attachments().await {
            Ok(pending_attachments) => {
                for attachment_id in pending_attachments {
                    if !belongs_to_dialog(&store, attachment_id, dialog_id).await {
                        continue;
                    }
                    let mut in_progress = in_progress.lock().await;
                    spawn_transfer(&store, &mut in_progress, &cancel, attachment_id).await;
                }
            }
            Err(error) => {
                error!(%error, "failed to load pending attachments");
            }
        }

        // wait for the next store notification
        let notification = tokio::select! {
            _ = cancel.cancelled() => return,
            notification = store_notifications.next() => notification,
        };
        if notification.is_none() {
            return;
        }
    }
}

async fn belongs_to_dialog<S>(store: &S, attachment_id: AttachmentId, dialog_id: DialogId) -> bool
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Ok(Some(record)) = store.attachment(attachment_id).await else {
        return false;
    };
    let Ok(Some(message)) = store.message(record.message_id()).await else {
        return false;
    };
    message.dialog_id() == dialog_id
}

async fn spawn_transfer<S>(
    store: &S,
    in_progress: &mut HashMap<AttachmentId, TransferTaskHandle>,
    cancel: &CancellationToken,
    attachment_id: AttachmentId,
) where
    S: Store + Clone + Send + Sync + 'static,
{
    if let hash_map::Entry::Occupied(entry) = in_progress.entry(attachment_id)
        && !entry.get().cancel.is_cancelled()
    {
        return; // already running
    }
    match store.start_transfer(attachment_id).await {
        Ok((_progress, task)) => {
            debug!(%attachment_id, "starting attachment transfer");
            run_transfer(store, in_progress, cancel, attachment_id, task);
        }
        Err(error) => {
            debug!(%attachment_id, %error, "not starting attachment transfer");
        }
    }
}

fn run_transfer<S>(
    store: &S,
    in_progress: &mut HashMap<AttachmentId, TransferTaskHandle>,
    cancel: &CancellationToken,
    attachment_id: AttachmentId,
    task: wrencoreclient::attachments::TransferTask,
) where
    S: Store + Clone + Send + Sync + 'static,
{
    let cancel = cancel.child_token();
    let handle = TransferTaskHandle {
        cancel: cancel.clone(),
        _drop_guard: Arc::new(cancel.clone().drop_guard()),
    };
    in_progress.insert(attachment_id, handle);

    let store = store.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(error) = store.cancel_transfer(attachment_id).await {
                    error!(%attachment_id, %error, "failed to cancel transfer");
                }
            }
            _ = task => {
                cancel.cancel(); // mark as done
            }
        }
    });
}

#[derive(Debug, Clone)]
struct TransferTaskHandle {
    cancel: CancellationToken,
    _drop_guard: Arc<DropGuard>,
}
