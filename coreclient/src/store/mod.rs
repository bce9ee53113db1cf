// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{path::PathBuf, sync::Arc};

use tokio_stream::Stream;
use url::Url;
use wrencommon::{
    identifiers::{AttachmentId, DialogId, MessageId, UserId},
    time::TimeStamp,
};

use crate::{
    attachments::{AttachmentDraft, AttachmentRecord, TransferProgress, TransferTask},
    dialogs::{DialogAttributes, DialogDetails, DialogType},
    errors::TransferError,
    messages::{DialogMessage, StatusReport},
};

pub use entity_id::StoreEntityId;
pub use memory::{InMemoryStore, InMemoryTransport};
pub use notification::{StoreNotification, StoreNotifier};
pub(crate) use notification::StoreNotificationsSender;

mod entity_id;
mod memory;
mod notification;

/// The result type of a failable [`Store`] method
pub type StoreResult<T> = anyhow::Result<T>;

/// A typing signal of one user in one dialog.
///
/// The feed gives no ordering guarantee; consumers apply last-write-wins
/// per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingEvent {
    pub dialog_id: DialogId,
    pub user_id: UserId,
    pub is_typing: bool,
}

/// Moves attachment bytes across the network boundary.
///
/// The transport reports raw transferred byte counts through the progress
/// callback; clamping and monotonicity are enforced by the caller's
/// [`crate::attachments::TransferTracker`]. Failing a stalled transfer is
/// the transport's responsibility; the core imposes no timeouts.
#[allow(async_fn_in_trait, reason = "trait is only used in the workspace")]
#[trait_variant::make(Send)]
pub trait AttachmentTransport: Sync {
    async fn upload(
        &self,
        record: &AttachmentRecord,
        on_progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<Url, TransferError>;

    async fn download(
        &self,
        record: &AttachmentRecord,
        on_progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<PathBuf, TransferError>;
}

/// Unified access to the client data
///
/// This trait is used to access dialogs, messages and attachments.
/// Additionally, it is used to listen to changes in the client data via the
/// [`Self::subscribe`] method and the [`StoreNotification`] type.
#[allow(async_fn_in_trait, reason = "trait is only used in the workspace")]
#[trait_variant::make(Send)]
pub trait Store {
    /// The user operating this store.
    fn user_id(&self) -> UserId;

    // dialogs

    /// Create a new dialog.
    ///
    /// Returns the id of the newly created dialog.
    async fn create_dialog(
        &self,
        dialog_type: DialogType,
        participants: std::collections::HashSet<UserId>,
        attributes: DialogAttributes,
    ) -> StoreResult<DialogId>;

    async fn dialogs(&self) -> StoreResult<Vec<DialogDetails>>;

    async fn dialog(&self, dialog_id: DialogId) -> StoreResult<Option<DialogDetails>>;

    /// Delete the dialog together with its messages and attachments.
    /// In-flight transfers of the dialog are cancelled.
    async fn delete_dialog(&self, dialog_id: DialogId) -> StoreResult<()>;

    /// Moves the dialog's read marker forward to `until`.
    ///
    /// Returns whether the marker moved; it never moves backwards.
    async fn mark_dialog_as_read(
        &self,
        dialog_id: DialogId,
        until: TimeStamp,
    ) -> StoreResult<bool>;

    // messages

    /// The most recent `limit` messages of the dialog, ascending.
    async fn messages(
        &self,
        dialog_id: DialogId,
        limit: usize,
    ) -> StoreResult<Vec<DialogMessage>>;

    async fn message(&self, message_id: MessageId) -> StoreResult<Option<DialogMessage>>;

    async fn last_message(&self, dialog_id: DialogId) -> StoreResult<Option<DialogMessage>>;

    async fn unread_messages_count(&self, dialog_id: DialogId) -> StoreResult<usize>;

    /// Sends a message. The message is stored locally with status `Sending`
    /// before it crosses the delivery boundary.
    async fn send_message(
        &self,
        dialog_id: DialogId,
        text: String,
        attachment: Option<AttachmentDraft>,
        related_id: Option<MessageId>,
    ) -> StoreResult<DialogMessage>;

    /// Resets a failed message and attempts to send it again.
    async fn resend_message(&self, message_id: MessageId) -> StoreResult<()>;

    /// Removes a message and its attachment. Idempotent.
    async fn remove_message(&self, message_id: MessageId) -> StoreResult<()>;

    /// Stores a message received from the delivery boundary.
    async fn ingest_message(
        &self,
        message: DialogMessage,
        attachment: Option<AttachmentRecord>,
    ) -> StoreResult<()>;

    /// Applies a batch of read/delivery acknowledgements to the dialog.
    ///
    /// Reports for unknown dialogs or messages are logged and dropped.
    async fn apply_status_report(
        &self,
        dialog_id: DialogId,
        report: StatusReport,
    ) -> StoreResult<()>;

    // attachments

    async fn attachment(
        &self,
        attachment_id: AttachmentId,
    ) -> StoreResult<Option<AttachmentRecord>>;

    /// Attachments waiting for a transfer to be started.
    async fn pending_attachments(&self) -> StoreResult<Vec<AttachmentId>>;

    /// Starts the transfer of a pending attachment.
    ///
    /// Returns a progress handle and the task driving the transfer; the
    /// caller owns the task and decides how to await or cancel it.
    async fn start_transfer(
        &self,
        attachment_id: AttachmentId,
    ) -> StoreResult<(TransferProgress, TransferTask)>;

    /// Cancels an in-flight transfer. Returns whether a transfer was
    /// cancelled; already-completed transfers are unaffected.
    async fn cancel_transfer(&self, attachment_id: AttachmentId) -> StoreResult<bool>;

    // typing signals

    /// Publishes the own user's typing state to the dialog.
    async fn send_typing(&self, dialog_id: DialogId, is_typing: bool) -> StoreResult<()>;

    /// Feeds a typing signal received from the push boundary.
    fn notify_typing(&self, event: TypingEvent);

    /// The push feed of typing signals, all dialogs.
    fn subscribe_typing(&self) -> impl Stream<Item = TypingEvent> + Send + 'static;

    // observability

    fn notify(&self, notification: StoreNotification);

    fn subscribe(&self) -> impl Stream<Item = Arc<StoreNotification>> + Send + 'static;
}
