// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, bail};
use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tracing::debug;
use url::Url;
use wrencommon::{
    identifiers::{AttachmentId, DialogId, MessageId, UserId},
    time::TimeStamp,
};

use crate::{
    attachments::{
        AttachmentDraft, AttachmentRecord, TransferDirection, TransferPhase, TransferProgress,
        TransferTask, TransferTracker,
    },
    dialogs::{Dialog, DialogAttributes, DialogDetails, DialogType},
    errors::TransferError,
    messages::{ContentBody, DialogMessage, StatusReport},
};

use super::{
    AttachmentTransport, Store, StoreNotification, StoreNotificationsSender, StoreNotifier,
    StoreResult, TypingEvent,
};

const TYPING_CHANNEL_SIZE: usize = 256;

/// Reference [`Store`] implementation holding all state in memory.
///
/// Attachment bytes move through the [`AttachmentTransport`] the store was
/// created with.
pub struct InMemoryStore<T> {
    user_id: UserId,
    inner: Arc<Mutex<InMemoryStoreInner>>,
    transport: Arc<T>,
    notifications_tx: StoreNotificationsSender,
    typing_tx: broadcast::Sender<TypingEvent>,
    transfers: Arc<Mutex<HashMap<AttachmentId, Arc<TransferTracker>>>>,
}

impl<T> Clone for InMemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            user_id: self.user_id,
            inner: self.inner.clone(),
            transport: self.transport.clone(),
            notifications_tx: self.notifications_tx.clone(),
            typing_tx: self.typing_tx.clone(),
            transfers: self.transfers.clone(),
        }
    }
}

#[derive(Default)]
struct InMemoryStoreInner {
    dialogs: HashMap<DialogId, Dialog>,
}

impl InMemoryStoreInner {
    fn dialog_of_message_mut(&mut self, message_id: MessageId) -> Option<&mut Dialog> {
        self.dialogs
            .values_mut()
            .find(|dialog| dialog.message(message_id).is_some())
    }

    fn dialog_of_attachment_mut(&mut self, attachment_id: AttachmentId) -> Option<&mut Dialog> {
        self.dialogs
            .values_mut()
            .find(|dialog| dialog.attachment(attachment_id).is_some())
    }

    fn attachment_record(&self, attachment_id: AttachmentId) -> Option<&AttachmentRecord> {
        self.dialogs
            .values()
            .find_map(|dialog| dialog.attachment(attachment_id))
    }
}

impl<T> InMemoryStore<T>
where
    T: AttachmentTransport + Send + Sync + 'static,
{
    pub fn new(user_id: UserId, transport: T) -> Self {
        Self {
            user_id,
            inner: Arc::default(),
            transport: Arc::new(transport),
            notifications_tx: StoreNotificationsSender::default(),
            typing_tx: broadcast::channel(TYPING_CHANNEL_SIZE).0,
            transfers: Arc::default(),
        }
    }

    fn store_notifier(&self) -> StoreNotifier {
        StoreNotifier::new(self.notifications_tx.clone())
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryStoreInner> {
        lock(&self.inner)
    }
}

fn lock(inner: &Mutex<InMemoryStoreInner>) -> MutexGuard<'_, InMemoryStoreInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn update_attachment(
    inner: &Mutex<InMemoryStoreInner>,
    tx: &StoreNotificationsSender,
    attachment_id: AttachmentId,
    f: impl FnOnce(&mut AttachmentRecord),
) {
    let mut guard = lock(inner);
    let Some(dialog) = guard.dialog_of_attachment_mut(attachment_id) else {
        debug!(%attachment_id, "attachment vanished during transfer");
        return;
    };
    let Some(record) = dialog.attachment_mut(attachment_id) else {
        return;
    };
    f(record);
    drop(guard);
    StoreNotifier::new(tx.clone()).update(attachment_id);
}

fn mark_message_sent(
    inner: &Mutex<InMemoryStoreInner>,
    tx: &StoreNotificationsSender,
    message_id: MessageId,
) {
    let mut guard = lock(inner);
    let Some(message) = guard
        .dialog_of_message_mut(message_id)
        .and_then(|dialog| dialog.message_mut(message_id))
    else {
        debug!(%message_id, "message vanished before send confirmation");
        return;
    };
    if let Err(error) = message.mark_sent(TimeStamp::now()) {
        debug!(%message_id, %error, "cannot confirm send");
        return;
    }
    drop(guard);
    StoreNotifier::new(tx.clone()).update(message_id);
}

impl<T> Store for InMemoryStore<T>
where
    T: AttachmentTransport + Send + Sync + 'static,
{
    fn user_id(&self) -> UserId {
        self.user_id
    }

    async fn create_dialog(
        &self,
        dialog_type: DialogType,
        participants: HashSet<UserId>,
        attributes: DialogAttributes,
    ) -> StoreResult<DialogId> {
        let dialog = Dialog::new(DialogId::random(), dialog_type, participants, attributes);
        let id = dialog.id();
        self.lock().dialogs.insert(id, dialog);
        self.store_notifier().add(id);
        Ok(id)
    }

    async fn dialogs(&self) -> StoreResult<Vec<DialogDetails>> {
        Ok(self.lock().dialogs.values().map(Dialog::details).collect())
    }

    async fn dialog(&self, dialog_id: DialogId) -> StoreResult<Option<DialogDetails>> {
        Ok(self.lock().dialogs.get(&dialog_id).map(Dialog::details))
    }

    async fn delete_dialog(&self, dialog_id: DialogId) -> StoreResult<()> {
        let Some(dialog) = self.lock().dialogs.remove(&dialog_id) else {
            return Ok(());
        };
        // cancel whatever was still in flight for this dialog
        let mut transfers = self.transfers.lock().unwrap_or_else(PoisonError::into_inner);
        for record in dialog.attachments() {
            if let Some(tracker) = transfers.remove(&record.attachment_id()) {
                tracker.cancel();
            }
        }
        drop(transfers);

        let mut notifier = self.store_notifier();
        notifier.remove(dialog_id);
        for message in dialog.messages() {
            notifier.remove(message.id());
        }
        for record in dialog.attachments() {
            notifier.remove(record.attachment_id());
        }
        Ok(())
    }

    async fn mark_dialog_as_read(
        &self,
        dialog_id: DialogId,
        until: TimeStamp,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let dialog = inner
            .dialogs
            .get_mut(&dialog_id)
            .context("dialog not found")?;
        let changed = dialog.set_last_read(until);
        drop(inner);
        if changed {
            self.store_notifier().update(dialog_id);
        }
        Ok(changed)
    }

    async fn messages(
        &self,
        dialog_id: DialogId,
        limit: usize,
    ) -> StoreResult<Vec<DialogMessage>> {
        let inner = self.lock();
        let Some(dialog) = inner.dialogs.get(&dialog_id) else {
            return Ok(Vec::new());
        };
        let messages = dialog.messages();
        let offset = messages.len().saturating_sub(limit);
        Ok(messages[offset..].to_vec())
    }

    async fn message(&self, message_id: MessageId) -> StoreResult<Option<DialogMessage>> {
        let inner = self.lock();
        Ok(inner
            .dialogs
            .values()
            .find_map(|dialog| dialog.message(message_id))
            .cloned())
    }

    async fn last_message(&self, dialog_id: DialogId) -> StoreResult<Option<DialogMessage>> {
        let inner = self.lock();
        Ok(inner
            .dialogs
            .get(&dialog_id)
            .and_then(|dialog| dialog.last_message())
            .cloned())
    }

    async fn unread_messages_count(&self, dialog_id: DialogId) -> StoreResult<usize> {
        let inner = self.lock();
        Ok(inner
            .dialogs
            .get(&dialog_id)
            .map(Dialog::unread_messages_count)
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        dialog_id: DialogId,
        text: String,
        attachment: Option<AttachmentDraft>,
        related_id: Option<MessageId>,
    ) -> StoreResult<DialogMessage> {
        let attachment_id = attachment.as_ref().map(|_| AttachmentId::random());
        let content = ContentBody::new(text, attachment_id, related_id)?;

        let mut notifier = self.store_notifier();
        let mut inner = self.lock();
        let dialog = inner
            .dialogs
            .get_mut(&dialog_id)
            .context("dialog not found")?;

        let mut message = DialogMessage::new_unsent(dialog_id, self.user_id, content);
        let message_id = message.id();

        if let (Some(attachment_id), Some(draft)) = (attachment_id, attachment) {
            dialog.insert_attachment(AttachmentRecord::new_upload(
                attachment_id,
                message_id,
                draft,
            ));
            notifier.add(attachment_id);
        } else {
            // plain text crosses the boundary right away
            message.mark_sent(TimeStamp::now())?;
        }

        dialog.insert_or_update(message.clone());
        notifier.add(message_id);
        Ok(message)
    }

    async fn resend_message(&self, message_id: MessageId) -> StoreResult<()> {
        let mut notifier = self.store_notifier();
        let mut inner = self.lock();
        let dialog = inner
            .dialog_of_message_mut(message_id)
            .context("message not found")?;

        let message = dialog
            .message_mut(message_id)
            .context("message not found")?;
        message.reset_for_resend()?;
        let attachment_id = message.attachment_id();

        let pending_upload = attachment_id.is_some_and(|attachment_id| {
            dialog
                .attachment_mut(attachment_id)
                .is_some_and(|record| {
                    if record.phase() == TransferPhase::Available {
                        false
                    } else {
                        record.reset_for_retry();
                        true
                    }
                })
        });
        if let Some(attachment_id) = attachment_id
            && pending_upload
        {
            // the upload restarts through the pending-attachments loop and
            // confirms the send on completion
            notifier.update(attachment_id);
        } else if let Some(message) = dialog.message_mut(message_id) {
            message.mark_sent(TimeStamp::now())?;
        }
        notifier.update(message_id);
        Ok(())
    }

    async fn remove_message(&self, message_id: MessageId) -> StoreResult<()> {
        let mut notifier = self.store_notifier();
        let mut inner = self.lock();
        let Some(dialog) = inner.dialog_of_message_mut(message_id) else {
            return Ok(());
        };
        let Some(message) = dialog.remove(message_id) else {
            return Ok(());
        };
        drop(inner);

        if let Some(attachment_id) = message.attachment_id() {
            let tracker = self
                .transfers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&attachment_id);
            if let Some(tracker) = tracker {
                tracker.cancel();
            }
            notifier.remove(attachment_id);
        }
        notifier.remove(message_id);
        Ok(())
    }

    async fn ingest_message(
        &self,
        message: DialogMessage,
        attachment: Option<AttachmentRecord>,
    ) -> StoreResult<()> {
        let mut notifier = self.store_notifier();
        let mut inner = self.lock();
        let dialog = inner
            .dialogs
            .get_mut(&message.dialog_id())
            .context("dialog not found")?;
        notifier.add(message.id());
        if let Some(record) = attachment {
            notifier.add(record.attachment_id());
            dialog.insert_attachment(record);
        }
        dialog.insert_or_update(message);
        Ok(())
    }

    async fn apply_status_report(
        &self,
        dialog_id: DialogId,
        report: StatusReport,
    ) -> StoreResult<()> {
        let mut notifier = self.store_notifier();
        let mut inner = self.lock();
        let Some(dialog) = inner.dialogs.get_mut(&dialog_id) else {
            // deletion/acknowledgement race
            debug!(%dialog_id, "dropping status report for unknown dialog");
            return Ok(());
        };
        report.apply(dialog, &mut notifier);
        Ok(())
    }

    async fn attachment(
        &self,
        attachment_id: AttachmentId,
    ) -> StoreResult<Option<AttachmentRecord>> {
        Ok(self.lock().attachment_record(attachment_id).cloned())
    }

    async fn pending_attachments(&self) -> StoreResult<Vec<AttachmentId>> {
        Ok(self
            .lock()
            .dialogs
            .values()
            .flat_map(Dialog::attachments)
            .filter(|record| record.phase() == TransferPhase::Pending)
            .map(AttachmentRecord::attachment_id)
            .collect())
    }

    async fn start_transfer(
        &self,
        attachment_id: AttachmentId,
    ) -> StoreResult<(TransferProgress, TransferTask)> {
        let record = {
            let mut inner = self.lock();
            let dialog = inner
                .dialog_of_attachment_mut(attachment_id)
                .context("attachment not found")?;
            let record = dialog
                .attachment_mut(attachment_id)
                .context("attachment not found")?;
            match record.phase() {
                TransferPhase::Pending => {}
                // an explicit retry restarts a retry-eligible failed transfer
                TransferPhase::Failed
                    if record.failure().is_some_and(TransferError::is_retryable) =>
                {
                    record.reset_for_retry();
                }
                phase => bail!("transfer cannot start from phase {phase:?}"),
            }
            record.clone()
        };

        let tracker = Arc::new(TransferTracker::new(attachment_id));
        {
            let mut transfers = self.transfers.lock().unwrap_or_else(PoisonError::into_inner);
            if transfers
                .get(&attachment_id)
                .is_some_and(|running| !running.phase().is_terminal())
            {
                bail!("transfer already in flight");
            }
            transfers.insert(attachment_id, tracker.clone());
        }
        let progress = tracker.subscribe();

        let inner = self.inner.clone();
        let transport = self.transport.clone();
        let tx = self.notifications_tx.clone();
        let transfers = self.transfers.clone();
        let task: TransferTask = Box::pin(async move {
            if !tracker.start(record.size_bytes()) {
                return; // cancelled before it began
            }
            update_attachment(&inner, &tx, attachment_id, AttachmentRecord::begin_transfer);

            let mut on_progress = |bytes: u64| {
                if let Some(clamped) = tracker.progress(bytes) {
                    update_attachment(&inner, &tx, attachment_id, |record| {
                        record.record_progress(clamped)
                    });
                }
            };
            let outcome = match record.direction() {
                TransferDirection::Download => transport
                    .download(&record, &mut on_progress)
                    .await
                    .map(|local_path| (local_path, None)),
                TransferDirection::Upload => match record.local_path().map(Path::to_path_buf) {
                    Some(local_path) => transport
                        .upload(&record, &mut on_progress)
                        .await
                        .map(|remote_url| (local_path, Some(remote_url))),
                    None => Err(TransferError::new("upload has no local file", false)),
                },
            };

            match outcome {
                Ok((local_path, remote_url)) => {
                    if tracker.complete(local_path.clone(), remote_url.clone()) {
                        update_attachment(&inner, &tx, attachment_id, |record| {
                            record.mark_available(local_path, remote_url)
                        });
                        if record.direction() == TransferDirection::Upload {
                            mark_message_sent(&inner, &tx, record.message_id());
                        }
                    }
                }
                Err(error) => {
                    if tracker.fail(error.clone()) {
                        update_attachment(&inner, &tx, attachment_id, |record| {
                            record.mark_failed(error)
                        });
                    }
                }
            }
            transfers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&attachment_id);
        });

        Ok((progress, task))
    }

    async fn cancel_transfer(&self, attachment_id: AttachmentId) -> StoreResult<bool> {
        let tracker = self
            .transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&attachment_id);
        let Some(tracker) = tracker else {
            return Ok(false);
        };
        if tracker.cancel() {
            update_attachment(&self.inner, &self.notifications_tx, attachment_id, |record| {
                record.mark_failed(TransferError::cancelled())
            });
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn send_typing(&self, dialog_id: DialogId, is_typing: bool) -> StoreResult<()> {
        self.notify_typing(TypingEvent {
            dialog_id,
            user_id: self.user_id,
            is_typing,
        });
        Ok(())
    }

    fn notify_typing(&self, event: TypingEvent) {
        let _no_receivers = self.typing_tx.send(event);
    }

    fn subscribe_typing(&self) -> impl Stream<Item = TypingEvent> + Send + 'static {
        BroadcastStream::new(self.typing_tx.subscribe()).filter_map(|event| event.ok())
    }

    fn notify(&self, notification: StoreNotification) {
        self.notifications_tx.notify(notification);
    }

    fn subscribe(&self) -> impl Stream<Item = Arc<StoreNotification>> + Send + 'static {
        self.notifications_tx.subscribe()
    }
}

/// Transport that simulates transfers without moving bytes.
///
/// Progress is reported in fixed-size chunks; downloads resolve to a path
/// under the system temp directory.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    chunk_size: u64,
}

impl InMemoryTransport {
    pub fn new(chunk_size: u64) -> Self {
        Self { chunk_size }
    }

    async fn run(&self, total: u64, on_progress: &mut (dyn FnMut(u64) + Send)) {
        let mut transferred = 0;
        while transferred < total {
            transferred = (transferred + self.chunk_size).min(total);
            on_progress(transferred);
            tokio::task::yield_now().await;
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl AttachmentTransport for InMemoryTransport {
    async fn upload(
        &self,
        record: &AttachmentRecord,
        on_progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<Url, TransferError> {
        self.run(record.size_bytes(), on_progress).await;
        Url::parse(&record.attachment_id().url())
            .map_err(|error| TransferError::new(error.to_string(), false))
    }

    async fn download(
        &self,
        record: &AttachmentRecord,
        on_progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<PathBuf, TransferError> {
        self.run(record.size_bytes(), on_progress).await;
        Ok(std::env::temp_dir().join(record.attachment_id().to_string()))
    }
}
