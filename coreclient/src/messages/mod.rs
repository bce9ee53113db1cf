// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use wrencommon::{
    identifiers::{AttachmentId, DialogId, MessageId, UserId},
    time::TimeStamp,
};

use crate::errors::{InvalidTransitionError, ValidationError};

mod status;

pub use status::{AckOutcome, PerMessageStatus, StatusReport};

/// Delivery status of a message.
///
/// The four delivery states form a fixed forward order; `Failed` is a side
/// state reachable from every non-`Read` state and left only through an
/// explicit resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MessageStatus {
    #[default]
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position in the monotonic delivery order; `None` for `Failed`.
    pub(crate) fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }
}

/// A dialog event rendered outside the regular message flow.
///
/// System messages are kept in the canonical message order but are excluded
/// from the displayed projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMessage {
    MemberJoined(UserId),
    MemberLeft(UserId),
    DialogRenamed(String),
}

/// User-visible message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBody {
    text: String,
    attachment: Option<AttachmentId>,
    related_id: Option<MessageId>,
}

impl ContentBody {
    /// Creates message content. Text may be empty only for attachment-only
    /// messages.
    pub fn new(
        text: String,
        attachment: Option<AttachmentId>,
        related_id: Option<MessageId>,
    ) -> Result<Self, ValidationError> {
        if text.is_empty() && attachment.is_none() {
            return Err(ValidationError::EmptyMessage);
        }
        Ok(Self {
            text,
            attachment,
            related_id,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attachment(&self) -> Option<AttachmentId> {
        self.attachment
    }

    pub fn related_id(&self) -> Option<MessageId> {
        self.related_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Content(ContentBody),
    System(SystemMessage),
}

impl MessageBody {
    pub fn content(&self) -> Option<&ContentBody> {
        match self {
            MessageBody::Content(content) => Some(content),
            MessageBody::System(_) => None,
        }
    }
}

/// A single message of a dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogMessage {
    dialog_id: DialogId,
    message_id: MessageId,
    sender_id: UserId,
    body: MessageBody,
    created_at: TimeStamp,
    status: MessageStatus,
    attempts: u32,
    failure_reason: Option<String>,
}

impl DialogMessage {
    /// Creates a new not yet sent message with status `Sending`.
    pub fn new_unsent(dialog_id: DialogId, sender_id: UserId, content: ContentBody) -> Self {
        Self {
            dialog_id,
            message_id: MessageId::random(),
            sender_id,
            body: MessageBody::Content(content),
            created_at: TimeStamp::now(),
            status: MessageStatus::Sending,
            attempts: 0,
            failure_reason: None,
        }
    }

    /// Creates a message from a remote event. Remote messages have already
    /// left the sender, so they start out as `Sent`.
    pub fn new_received(
        dialog_id: DialogId,
        message_id: MessageId,
        sender_id: UserId,
        body: MessageBody,
        created_at: TimeStamp,
    ) -> Self {
        Self {
            dialog_id,
            message_id,
            sender_id,
            body,
            created_at,
            status: MessageStatus::Sent,
            attempts: 0,
            failure_reason: None,
        }
    }

    pub fn id(&self) -> MessageId {
        self.message_id
    }

    pub fn dialog_id(&self) -> DialogId {
        self.dialog_id
    }

    pub fn sender_id(&self) -> UserId {
        self.sender_id
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn created_at(&self) -> TimeStamp {
        self.created_at
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn attachment_id(&self) -> Option<AttachmentId> {
        self.body.content().and_then(|content| content.attachment())
    }

    /// Whether the message is part of the displayed projection.
    pub fn is_visible(&self) -> bool {
        matches!(self.body, MessageBody::Content(_))
    }

    /// Canonical storage order: ascending by timestamp, id as tie-break.
    pub fn sort_key(&self) -> (TimeStamp, MessageId) {
        (self.created_at, self.message_id)
    }

    /// Mark the message as sent and stamp it with the server timestamp.
    pub fn mark_sent(&mut self, ds_timestamp: TimeStamp) -> Result<(), InvalidTransitionError> {
        if self.advance(MessageStatus::Sent)? {
            self.created_at = ds_timestamp;
        }
        Ok(())
    }

    pub fn mark_delivered(&mut self) -> Result<(), InvalidTransitionError> {
        self.advance(MessageStatus::Delivered)?;
        Ok(())
    }

    /// Read implies delivered: marking read is legal from any earlier state.
    pub fn mark_read(&mut self) -> Result<(), InvalidTransitionError> {
        self.advance(MessageStatus::Read)?;
        Ok(())
    }

    /// Marks the message as failed. Legal from every state except `Read`: a
    /// message confirmed read cannot regress because of a late error.
    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<(), InvalidTransitionError> {
        match self.status {
            MessageStatus::Read => Err(InvalidTransitionError {
                from: self.status,
                to: MessageStatus::Failed,
            }),
            _ => {
                self.status = MessageStatus::Failed;
                self.failure_reason = Some(reason.into());
                Ok(())
            }
        }
    }

    /// Resets a failed message for another send attempt.
    pub fn reset_for_resend(&mut self) -> Result<(), InvalidTransitionError> {
        if self.status != MessageStatus::Failed {
            return Err(InvalidTransitionError {
                from: self.status,
                to: MessageStatus::Sending,
            });
        }
        self.status = MessageStatus::Sending;
        self.failure_reason = None;
        self.attempts += 1;
        Ok(())
    }

    /// Advances the delivery status.
    ///
    /// Returns `Ok(true)` if the status moved forward, `Ok(false)` for an
    /// idempotent re-application of the current status, and an error for a
    /// regression or for any transition out of `Failed` other than
    /// [`Self::reset_for_resend`].
    fn advance(&mut self, to: MessageStatus) -> Result<bool, InvalidTransitionError> {
        let error = InvalidTransitionError {
            from: self.status,
            to,
        };
        let from_rank = self.status.rank().ok_or(error)?;
        let to_rank = to.rank().ok_or(error)?;
        if to_rank < from_rank {
            return Err(error);
        }
        if to_rank == from_rank {
            return Ok(false);
        }
        self.status = to;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> ContentBody {
        ContentBody::new(text.to_owned(), None, None).unwrap()
    }

    fn unsent_message() -> DialogMessage {
        DialogMessage::new_unsent(DialogId::random(), UserId::random(), content("hi"))
    }

    #[test]
    fn empty_content_is_rejected() {
        assert_eq!(
            ContentBody::new(String::new(), None, None),
            Err(ValidationError::EmptyMessage)
        );
        // attachment-only messages are fine
        ContentBody::new(String::new(), Some(AttachmentId::random()), None).unwrap();
    }

    #[test]
    fn forward_transitions() {
        let mut message = unsent_message();
        message.mark_sent(TimeStamp::now()).unwrap();
        assert_eq!(message.status(), MessageStatus::Sent);
        message.mark_delivered().unwrap();
        assert_eq!(message.status(), MessageStatus::Delivered);
        message.mark_read().unwrap();
        assert_eq!(message.status(), MessageStatus::Read);
    }

    #[test]
    fn read_implies_delivered() {
        let mut message = unsent_message();
        message.mark_sent(TimeStamp::now()).unwrap();
        message.mark_read().unwrap();
        assert_eq!(message.status(), MessageStatus::Read);
    }

    #[test]
    fn regression_is_rejected() {
        let mut message = unsent_message();
        message.mark_read().unwrap();
        assert_eq!(
            message.mark_delivered(),
            Err(InvalidTransitionError {
                from: MessageStatus::Read,
                to: MessageStatus::Delivered,
            })
        );
    }

    #[test]
    fn duplicate_transition_is_idempotent() {
        let mut message = unsent_message();
        message.mark_delivered().unwrap();
        message.mark_delivered().unwrap();
        assert_eq!(message.status(), MessageStatus::Delivered);
    }

    #[test]
    fn sent_stamps_server_timestamp_once() {
        let mut message = unsent_message();
        let ds_timestamp: TimeStamp =
            (TimeStamp::now().time() + wrencommon::time::Duration::seconds(1)).into();
        message.mark_sent(ds_timestamp).unwrap();
        assert_eq!(message.created_at(), ds_timestamp);
        // re-sending the ack does not move the timestamp again
        let late: TimeStamp =
            (ds_timestamp.time() + wrencommon::time::Duration::seconds(1)).into();
        message.mark_sent(late).unwrap();
        assert_eq!(message.created_at(), ds_timestamp);
    }

    #[test]
    fn failed_is_reachable_except_from_read() {
        let mut message = unsent_message();
        message.mark_delivered().unwrap();
        message.mark_failed("network error").unwrap();
        assert_eq!(message.status(), MessageStatus::Failed);
        assert_eq!(message.failure_reason(), Some("network error"));

        let mut read_message = unsent_message();
        read_message.mark_read().unwrap();
        assert!(read_message.mark_failed("late error").is_err());
        assert_eq!(read_message.status(), MessageStatus::Read);
    }

    #[test]
    fn resend_resets_failed_message() {
        let mut message = unsent_message();
        message.mark_failed("network error").unwrap();
        message.reset_for_resend().unwrap();
        assert_eq!(message.status(), MessageStatus::Sending);
        assert_eq!(message.attempts(), 1);
        assert_eq!(message.failure_reason(), None);

        // resend is only legal from `Failed`
        assert!(message.reset_for_resend().is_err());
    }

    #[test]
    fn no_transition_out_of_failed_without_resend() {
        let mut message = unsent_message();
        message.mark_failed("network error").unwrap();
        assert!(message.mark_sent(TimeStamp::now()).is_err());
        assert!(message.mark_delivered().is_err());
        assert!(message.mark_read().is_err());
        assert_eq!(message.status(), MessageStatus::Failed);
    }

    #[test]
    fn system_messages_are_hidden() {
        let message = DialogMessage::new_received(
            DialogId::random(),
            MessageId::random(),
            UserId::random(),
            MessageBody::System(SystemMessage::MemberLeft(UserId::random())),
            TimeStamp::now(),
        );
        assert!(!message.is_visible());
    }
}
