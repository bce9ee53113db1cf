// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! View-state controller of one open dialog.
//!
//! The cubit reconciles the dialog's message log, the attachment transfer
//! phases and the typing feed into one immutable [`DialogState`] snapshot
//! per publish cycle and republishes it on every relevant change.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    pin::pin,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{sync::watch, time::sleep};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;
use wrencommon::{
    identifiers::{AttachmentId, DialogId, MessageId, UserId},
    time::TimeStamp,
};
use wrencoreclient::{
    attachments::{AttachmentDraft, TransferPhase},
    dialogs::DialogDetails,
    messages::{DialogMessage, MessageStatus},
    store::{Store, StoreEntityId, StoreNotification, TypingEvent},
};

use crate::{
    StreamSink,
    attachments::AttachmentsRepository,
    typing::TypingSet,
    util::{Cubit, CubitCore, spawn_from_sync},
};

const MAX_MESSAGES: usize = 1000;
const MARK_AS_READ_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Loading the dialog history.
    History,
    /// History is loaded; transfers known at load time are still running.
    Transfers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing {
        stage: SyncStage,
    },
    Synced,
    Error,
}

/// Transfer state of a message's attachment, as rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct UiAttachment {
    pub attachment_id: AttachmentId,
    pub content_type: String,
    pub phase: TransferPhase,
    pub fraction: f64,
    pub local_path: Option<PathBuf>,
    pub remote_url: Option<Url>,
}

/// One row of the displayed message list.
#[derive(Debug, Clone, PartialEq)]
pub struct UiMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: TimeStamp,
    pub status: MessageStatus,
    pub attachment: Option<UiAttachment>,
    pub related_id: Option<MessageId>,
    pub failure_reason: Option<String>,
}

/// Position of the audio player within a voice message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackPosition {
    pub message_id: MessageId,
    pub position_ms: u64,
    pub is_playing: bool,
}

/// Snapshot of everything the dialog screen renders.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DialogState {
    /// Copy-on-write inner ref to make the state cheaply clonable when emitting new state
    inner: Arc<DialogStateInner>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct DialogStateInner {
    sync_phase: SyncPhase,
    details: Option<DialogDetails>,
    /// displayed messages, newest first
    messages: Vec<UiMessage>,
    /// lookup index from message id to index in `messages`
    message_ids_index: HashMap<MessageId, usize>,
    typing: TypingSet,
    playback: Option<PlaybackPosition>,
    last_error: Option<String>,
}

impl DialogState {
    pub fn sync_phase(&self) -> SyncPhase {
        self.inner.sync_phase
    }

    pub fn details(&self) -> Option<&DialogDetails> {
        self.inner.details.as_ref()
    }

    pub fn loaded_messages_count(&self) -> usize {
        self.inner.messages.len()
    }

    pub fn messages(&self) -> &[UiMessage] {
        &self.inner.messages
    }

    pub fn message_at(&self, index: usize) -> Option<&UiMessage> {
        self.inner.messages.get(index)
    }

    pub fn message_index(&self, message_id: MessageId) -> Option<usize> {
        self.inner.message_ids_index.get(&message_id).copied()
    }

    pub fn typing(&self) -> &TypingSet {
        &self.inner.typing
    }

    pub fn playback(&self) -> Option<&PlaybackPosition> {
        self.inner.playback.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.inner.last_error.as_deref()
    }

    fn make_mut(&mut self) -> &mut DialogStateInner {
        Arc::make_mut(&mut self.inner)
    }

    /// Rebuild the loaded part of the state; ephemeral screen state (typing,
    /// playback) is carried over.
    fn rebuild(&mut self, details: DialogDetails, messages: Vec<UiMessage>) {
        let inner = self.make_mut();
        inner.message_ids_index = messages
            .iter()
            .enumerate()
            .map(|(index, message)| (message.message_id, index))
            .collect();
        inner.messages = messages;
        inner.details = Some(details);
    }

    fn message_ids(&self) -> HashSet<MessageId> {
        self.inner.message_ids_index.keys().copied().collect()
    }

    fn attachment_ids(&self) -> HashSet<AttachmentId> {
        self.inner
            .messages
            .iter()
            .filter_map(|message| {
                message
                    .attachment
                    .as_ref()
                    .map(|attachment| attachment.attachment_id)
            })
            .collect()
    }
}

/// The view-state controller of one open dialog.
///
/// Exactly one cubit exists per open dialog; it is torn down via
/// [`Self::unsync`] before another one may be created for the same dialog.
pub struct DialogCubit<S>
where
    S: Store + Clone + Send + Sync + 'static,
{
    context: DialogContext<S>,
    core: CubitCore<DialogState>,
    attachments: Option<AttachmentsRepository<S>>,
    sync_cancel: Option<CancellationToken>,
}

impl<S> DialogCubit<S>
where
    S: Store + Clone + Send + Sync + 'static,
{
    pub fn new(store: S, dialog_id: DialogId) -> Self {
        let core = CubitCore::new();
        let context = DialogContext::new(store, core.state_tx().clone(), dialog_id);
        Self {
            context,
            core,
            attachments: None,
            sync_cancel: None,
        }
    }

    // Cubit interface

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Tears the cubit down; see [`Self::unsync`].
    pub fn close(&mut self) {
        self.unsync();
    }

    pub fn state(&self) -> DialogState {
        self.core.state()
    }

    pub async fn stream(&mut self, sink: StreamSink<DialogState>) {
        self.core.stream(sink).await;
    }

    // Lifecycle

    /// Starts (or restarts, e.g. after a reconnect) syncing the dialog.
    pub fn sync(&mut self) {
        if self.core.is_closed() {
            warn!(dialog_id =% self.context.dialog_id, "sync on a closed dialog cubit");
            return;
        }
        if let Some(previous) = self.sync_cancel.take() {
            previous.cancel();
        }
        let stop = self.core.cancellation_token().child_token();
        self.sync_cancel = Some(stop.clone());

        self.context.set_sync_phase(SyncPhase::Syncing {
            stage: SyncStage::History,
        });

        self.attachments = Some(AttachmentsRepository::new(
            self.context.store.clone(),
            self.context.dialog_id,
            stop.child_token(),
        ));

        let store_notifications = self.context.store.subscribe();
        let typing_events = self.context.store.subscribe_typing();
        self.context
            .clone()
            .spawn(store_notifications, typing_events, stop);
    }

    /// Releases all subscriptions and cancels in-flight transfers of the
    /// dialog. Terminal: the cubit cannot be synced again afterwards.
    pub fn unsync(&mut self) {
        self.context.set_sync_phase(SyncPhase::Idle);
        self.sync_cancel = None;
        self.attachments = None;
        self.core.close();
    }

    /// Retries after a sync error.
    pub fn retry(&mut self) {
        self.sync();
    }

    // Intents

    /// Sends a message to the dialog.
    ///
    /// The not yet sent message is immediately stored locally and then
    /// crosses the delivery boundary.
    pub async fn send_message(
        &self,
        text: String,
        attachment: Option<AttachmentDraft>,
        related_id: Option<MessageId>,
    ) -> anyhow::Result<()> {
        let result = self
            .context
            .store
            .send_message(self.context.dialog_id, text, attachment, related_id)
            .await
            .map(|_| ());
        self.context.record_outcome(result, "failed to send message")
    }

    /// Resets a failed message and sends it again.
    pub async fn resend_message(&self, message_id: MessageId) -> anyhow::Result<()> {
        let result = self.context.store.resend_message(message_id).await;
        self.context
            .record_outcome(result, "failed to resend message")
    }

    /// Starts (or restarts, for a retry-eligible failure) the download of an
    /// attachment.
    pub async fn download_attachment(&self, attachment_id: AttachmentId) -> anyhow::Result<()> {
        let attachments = self
            .attachments
            .as_ref()
            .context("dialog is not synced")?;
        let result = attachments.ensure_transfer(attachment_id).await;
        self.context
            .record_outcome(result, "failed to download attachment")
    }

    /// Marks the dialog as read until the given message (including).
    ///
    /// The calls to this method are debounced with a fixed delay.
    pub async fn mark_as_read(
        &self,
        until_message_id: MessageId,
        until_timestamp: TimeStamp,
    ) -> anyhow::Result<()> {
        let scheduled = self
            .context
            .mark_as_read_tx
            .send_if_modified(|state| match state {
                MarkAsReadState::NotLoaded => {
                    error!("marking as read while the dialog is not loaded");
                    false
                }
                MarkAsReadState::Marked { at }
                | MarkAsReadState::Scheduled {
                    until_timestamp: at,
                    until_message_id: _,
                } if *at < until_timestamp => {
                    *state = MarkAsReadState::Scheduled {
                        until_timestamp,
                        until_message_id,
                    };
                    true
                }
                MarkAsReadState::Marked { .. } => {
                    false // already marked as read
                }
                MarkAsReadState::Scheduled { .. } => {
                    false // already scheduled at a later timestamp
                }
            });
        if !scheduled {
            return Ok(());
        }

        // debounce
        let mut rx = self.context.mark_as_read_tx.subscribe();
        tokio::select! {
            _ = rx.changed() => return Ok(()),
            _ = sleep(MARK_AS_READ_DEBOUNCE) => {},
        };

        // check if the scheduled state is still valid and if so, mark it as read
        let scheduled = self
            .context
            .mark_as_read_tx
            .send_if_modified(|state| match state {
                MarkAsReadState::Scheduled {
                    until_message_id: scheduled_message_id,
                    until_timestamp,
                } if *scheduled_message_id == until_message_id => {
                    *state = MarkAsReadState::Marked {
                        at: *until_timestamp,
                    };
                    true
                }
                _ => false,
            });
        if !scheduled {
            return Ok(());
        }

        self.context
            .store
            .mark_dialog_as_read(self.context.dialog_id, until_timestamp)
            .await?;
        Ok(())
    }

    /// Publishes the own user's typing state.
    pub async fn send_typing(&self) -> anyhow::Result<()> {
        self.context
            .store
            .send_typing(self.context.dialog_id, true)
            .await
    }

    pub async fn send_stop_typing(&self) -> anyhow::Result<()> {
        self.context
            .store
            .send_typing(self.context.dialog_id, false)
            .await
    }

    /// Updates the audio playback position shown on voice message rows.
    pub fn set_playback(&self, playback: Option<PlaybackPosition>) {
        self.context
            .state_tx
            .send_modify(|state| state.make_mut().playback = playback);
    }
}

/// Loads the initial state and listens to the changes
#[derive(Clone)]
struct DialogContext<S> {
    store: S,
    state_tx: watch::Sender<DialogState>,
    dialog_id: DialogId,
    mark_as_read_tx: watch::Sender<MarkAsReadState>,
}

/// What one projection pass observed about the dialog's attachments.
#[derive(Debug, Default)]
struct ProjectionInfo {
    transfer_phases: HashMap<AttachmentId, TransferPhase>,
    failures: HashMap<AttachmentId, String>,
}

impl<S> DialogContext<S>
where
    S: Store + Clone + Send + Sync + 'static,
{
    fn new(store: S, state_tx: watch::Sender<DialogState>, dialog_id: DialogId) -> Self {
        let (mark_as_read_tx, _) = watch::channel(Default::default());
        Self {
            store,
            state_tx,
            dialog_id,
            mark_as_read_tx,
        }
    }

    fn spawn(
        self,
        store_notifications: impl Stream<Item = Arc<StoreNotification>> + Send + 'static,
        typing_events: impl Stream<Item = TypingEvent> + Send + 'static,
        stop: CancellationToken,
    ) {
        spawn_from_sync(async move {
            let info = match self.load_and_emit_state().await {
                Ok(info) => info,
                Err(error) => {
                    error!(
                        dialog_id =% self.dialog_id,
                        %error,
                        "failed to load dialog history"
                    );
                    self.set_error(error.to_string());
                    return;
                }
            };
            // failures already present at load time fill the error slot
            self.track_transfers(&ProjectionInfo::default(), &info);
            // the initial fetch horizon: transfers that are not done by the
            // time the history is loaded keep the dialog in the syncing phase
            let horizon: HashSet<AttachmentId> = info
                .transfer_phases
                .iter()
                .filter(|(_, phase)| !phase.is_terminal())
                .map(|(&attachment_id, _)| attachment_id)
                .collect();
            if horizon.is_empty() {
                self.set_sync_phase(SyncPhase::Synced);
            } else {
                self.set_sync_phase(SyncPhase::Syncing {
                    stage: SyncStage::Transfers,
                });
            }
            self.event_loop(store_notifications, typing_events, info, horizon, stop)
                .await;
        });
    }

    /// Returns only when `stop` is cancelled or a stream ends
    async fn event_loop(
        &self,
        store_notifications: impl Stream<Item = Arc<StoreNotification>>,
        typing_events: impl Stream<Item = TypingEvent>,
        mut info: ProjectionInfo,
        mut horizon: HashSet<AttachmentId>,
        stop: CancellationToken,
    ) {
        let mut store_notifications = pin!(store_notifications);
        let mut typing_events = pin!(typing_events);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                notification = store_notifications.next() => {
                    let Some(notification) = notification else { return };
                    if !self.is_relevant(&notification).await {
                        continue;
                    }
                    match self.load_and_emit_state().await {
                        Ok(new_info) => {
                            self.track_transfers(&info, &new_info);
                            horizon.retain(|attachment_id| {
                                new_info
                                    .transfer_phases
                                    .get(attachment_id)
                                    .is_some_and(|phase| !phase.is_terminal())
                            });
                            if horizon.is_empty() {
                                self.leave_transfers_stage();
                            }
                            info = new_info;
                        }
                        Err(error) => {
                            error!(
                                dialog_id =% self.dialog_id,
                                %error,
                                "failed to reload dialog state"
                            );
                            self.set_error(error.to_string());
                            return;
                        }
                    }
                }
                event = typing_events.next() => {
                    let Some(event) = event else { return };
                    self.apply_typing(event);
                }
            }
        }
    }

    async fn load_and_emit_state(&self) -> anyhow::Result<ProjectionInfo> {
        let details = self
            .store
            .dialog(self.dialog_id)
            .await?
            .context("dialog not found")?;
        let messages = self.store.messages(self.dialog_id, MAX_MESSAGES).await?;
        debug!(
            dialog_id =% self.dialog_id,
            count = messages.len(),
            "DialogCubit::load_and_emit_state"
        );

        let _ = self.mark_as_read_tx.send_if_modified(|state| {
            if matches!(state, MarkAsReadState::NotLoaded) {
                *state = MarkAsReadState::Marked {
                    at: details.last_read,
                };
                true
            } else {
                false
            }
        });

        let (ui_messages, info) = self.project(messages).await;
        self.state_tx
            .send_modify(|state| state.rebuild(details, ui_messages));
        Ok(info)
    }

    /// Projects the canonical ascending message log into the displayed,
    /// newest-first message list.
    async fn project(&self, messages: Vec<DialogMessage>) -> (Vec<UiMessage>, ProjectionInfo) {
        let mut info = ProjectionInfo::default();
        let mut ui_messages = Vec::new();
        for message in messages.iter().rev().filter(|message| message.is_visible()) {
            let Some(content) = message.body().content() else {
                continue;
            };
            let mut attachment = None;
            if let Some(attachment_id) = content.attachment() {
                match self.store.attachment(attachment_id).await {
                    Ok(Some(record)) => {
                        info.transfer_phases.insert(attachment_id, record.phase());
                        if let Some(failure) = record.failure() {
                            info.failures
                                .insert(attachment_id, failure.reason().to_owned());
                        }
                        attachment = Some(UiAttachment {
                            attachment_id,
                            content_type: record.content_type().to_owned(),
                            phase: record.phase(),
                            fraction: record.fraction(),
                            local_path: record.local_path().map(PathBuf::from),
                            remote_url: record.remote_url().cloned(),
                        });
                    }
                    Ok(None) => {
                        debug!(%attachment_id, "message references an unknown attachment");
                    }
                    Err(error) => {
                        error!(%attachment_id, %error, "failed to load attachment");
                    }
                }
            }
            ui_messages.push(UiMessage {
                message_id: message.id(),
                sender_id: message.sender_id(),
                text: content.text().to_owned(),
                created_at: message.created_at(),
                status: message.status(),
                attachment,
                related_id: content.related_id(),
                failure_reason: message.failure_reason().map(str::to_owned),
            });
        }
        (ui_messages, info)
    }

    /// Maps transfer outcomes onto the last-error slot: a new failure
    /// overwrites it, a completed transfer clears it.
    fn track_transfers(&self, previous: &ProjectionInfo, current: &ProjectionInfo) {
        let mut completed = false;
        for (attachment_id, phase) in &current.transfer_phases {
            if *phase == TransferPhase::Available
                && previous
                    .transfer_phases
                    .get(attachment_id)
                    .is_some_and(|previous_phase| *previous_phase != TransferPhase::Available)
            {
                completed = true;
            }
        }
        let new_failure = current
            .failures
            .iter()
            .find(|(attachment_id, reason)| {
                previous.failures.get(*attachment_id) != Some(*reason)
            })
            .map(|(_, reason)| reason.clone());

        if let Some(reason) = new_failure {
            self.set_last_error(reason);
        } else if completed {
            self.clear_last_error();
        }
    }

    /// Relevance filter for store notifications: anything touching this
    /// dialog, one of its loaded messages or one of their attachments.
    async fn is_relevant(&self, notification: &StoreNotification) -> bool {
        let dialog_entity: StoreEntityId = self.dialog_id.into();
        if notification.contains_added(&dialog_entity)
            || notification.contains_updated(&dialog_entity)
            || notification.contains_removed(&dialog_entity)
        {
            return true;
        }

        let (known_messages, known_attachments) = {
            let state = self.state_tx.borrow();
            (state.message_ids(), state.attachment_ids())
        };

        let all_ids = notification
            .added
            .iter()
            .chain(notification.updated.iter())
            .chain(notification.removed.iter());
        for entity_id in all_ids {
            match entity_id {
                StoreEntityId::Message(message_id) => {
                    if known_messages.contains(message_id) {
                        return true;
                    }
                    if let Ok(Some(message)) = self.store.message(*message_id).await
                        && message.dialog_id() == self.dialog_id
                    {
                        return true;
                    }
                }
                StoreEntityId::Attachment(attachment_id) => {
                    if known_attachments.contains(attachment_id) {
                        return true;
                    }
                    if let Ok(Some(record)) = self.store.attachment(*attachment_id).await
                        && let Ok(Some(message)) = self.store.message(record.message_id()).await
                        && message.dialog_id() == self.dialog_id
                    {
                        return true;
                    }
                }
                StoreEntityId::Dialog(_) | StoreEntityId::User(_) => {}
            }
        }
        false
    }

    fn apply_typing(&self, event: TypingEvent) {
        if event.dialog_id != self.dialog_id || event.user_id == self.store.user_id() {
            return;
        }
        self.state_tx.send_if_modified(|state| {
            // last-write-wins per user; unchanged signals emit nothing
            state.make_mut().typing.apply(&event)
        });
    }

    fn set_sync_phase(&self, phase: SyncPhase) {
        self.state_tx
            .send_modify(|state| state.make_mut().sync_phase = phase);
    }

    /// Moves from the transfers stage to synced; other phases are kept.
    fn leave_transfers_stage(&self) {
        self.state_tx.send_if_modified(|state| {
            if state.sync_phase()
                == (SyncPhase::Syncing {
                    stage: SyncStage::Transfers,
                })
            {
                state.make_mut().sync_phase = SyncPhase::Synced;
                true
            } else {
                false
            }
        });
    }

    fn set_error(&self, message: String) {
        self.state_tx.send_modify(|state| {
            let inner = state.make_mut();
            inner.sync_phase = SyncPhase::Error;
            inner.last_error = Some(message);
        });
    }

    fn set_last_error(&self, message: String) {
        self.state_tx
            .send_modify(|state| state.make_mut().last_error = Some(message));
    }

    fn clear_last_error(&self) {
        self.state_tx.send_if_modified(|state| {
            if state.last_error().is_some() {
                state.make_mut().last_error = None;
                true
            } else {
                false
            }
        });
    }

    /// Sets or clears the last-error slot from an intent's outcome.
    fn record_outcome(&self, result: anyhow::Result<()>, message: &str) -> anyhow::Result<()> {
        match &result {
            Ok(()) => self.clear_last_error(),
            Err(error) => {
                error!(dialog_id =% self.dialog_id, %error, "{message}");
                self.set_last_error(error.to_string());
            }
        }
        result
    }
}

#[derive(Debug, Default)]
enum MarkAsReadState {
    #[default]
    NotLoaded,
    /// Dialog is marked as read until the given timestamp
    Marked { at: TimeStamp },
    /// Dialog is scheduled to be marked as read until the given timestamp and message id
    Scheduled {
        until_timestamp: TimeStamp,
        until_message_id: MessageId,
    },
}
