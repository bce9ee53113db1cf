// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Application of read/delivery acknowledgements to a dialog.
//!
//! Acknowledgement reports arrive from the delivery boundary out of order
//! and possibly duplicated. Application is governed by the monotonic status
//! policy: only strictly-forward updates are applied, duplicates are
//! idempotent no-ops and regressions are dropped.

use std::collections::HashSet;

use tracing::{debug, warn};
use wrencommon::{
    identifiers::{MessageId, UserId},
    time::TimeStamp,
};

use crate::{
    dialogs::Dialog,
    messages::{DialogMessage, MessageStatus},
    store::StoreNotifier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerMessageStatus {
    pub message_id: MessageId,
    pub status: MessageStatus,
}

/// A batch of acknowledgement events from one sender.
#[derive(Debug, Clone)]
pub struct StatusReport {
    sender: UserId,
    statuses: Vec<PerMessageStatus>,
    created_at: TimeStamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The status moved strictly forward.
    Applied,
    /// The event re-stated the current status.
    Duplicate,
    /// The event would have regressed the status, or carried a status that
    /// is not a valid acknowledgement.
    Ignored,
}

impl StatusReport {
    pub fn new(sender: UserId, created_at: TimeStamp) -> Self {
        Self {
            sender,
            statuses: Vec::new(),
            created_at,
        }
    }

    pub fn with_status(mut self, message_id: MessageId, status: MessageStatus) -> Self {
        self.push(message_id, status);
        self
    }

    pub fn push(&mut self, message_id: MessageId, status: MessageStatus) {
        self.statuses.push(PerMessageStatus { message_id, status });
    }

    pub fn sender(&self) -> UserId {
        self.sender
    }

    pub fn created_at(&self) -> TimeStamp {
        self.created_at
    }

    /// Applies the report to the dialog.
    ///
    /// A sender may report several statuses for the same message; the last
    /// one in the report wins. Events for message ids unknown to the dialog
    /// are dropped: they stem from a race between deletion and a late
    /// acknowledgement, not from a defect.
    pub fn apply(&self, dialog: &mut Dialog, notifier: &mut StoreNotifier) {
        let mut already_handled: HashSet<MessageId> = HashSet::new();

        for &PerMessageStatus { message_id, status } in self.statuses.iter().rev() {
            if !already_handled.insert(message_id) {
                continue;
            }

            let Some(message) = dialog.message_mut(message_id) else {
                debug!(
                    %message_id,
                    sender =% self.sender,
                    "dropping acknowledgement for unknown message"
                );
                continue;
            };

            let outcome = message.apply_ack(status, self.created_at);
            let current = message.status();
            match outcome {
                AckOutcome::Applied => {
                    notifier.update(message_id);
                }
                AckOutcome::Duplicate => {}
                AckOutcome::Ignored => {
                    debug!(
                        %message_id,
                        ?current,
                        reported =? status,
                        "ignoring out-of-order acknowledgement"
                    );
                }
            }
        }
    }
}

impl DialogMessage {
    /// Applies a single acknowledgement under the monotonic status policy.
    pub(crate) fn apply_ack(&mut self, status: MessageStatus, timestamp: TimeStamp) -> AckOutcome {
        let Some(to_rank) = status.rank() else {
            warn!(message_id =% self.id(), ?status, "invalid acknowledgement status");
            return AckOutcome::Ignored;
        };
        if status == MessageStatus::Sending {
            warn!(message_id =% self.id(), "acknowledgement cannot reset a message");
            return AckOutcome::Ignored;
        }
        let Some(from_rank) = self.status().rank() else {
            // failed messages only leave that state through an explicit resend
            return AckOutcome::Ignored;
        };
        if to_rank < from_rank {
            return AckOutcome::Ignored;
        }
        if to_rank == from_rank {
            return AckOutcome::Duplicate;
        }
        let applied = match status {
            MessageStatus::Sent => self.mark_sent(timestamp),
            MessageStatus::Delivered => self.mark_delivered(),
            MessageStatus::Read => self.mark_read(),
            MessageStatus::Sending | MessageStatus::Failed => unreachable!("checked above"),
        };
        debug_assert!(applied.is_ok(), "forward transition cannot fail");
        AckOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;
    use wrencommon::time::Duration;

    use crate::{
        dialogs::{Dialog, DialogAttributes, DialogType},
        messages::ContentBody,
    };
    use wrencommon::identifiers::DialogId;

    use super::*;

    fn test_dialog() -> (Dialog, MessageId) {
        let mut dialog = Dialog::new(
            DialogId::random(),
            DialogType::Private,
            [UserId::random()].into(),
            DialogAttributes::new("test".to_owned(), None),
        );
        let message = DialogMessage::new_unsent(
            dialog.id(),
            UserId::random(),
            ContentBody::new("hi".to_owned(), None, None).unwrap(),
        );
        let message_id = message.id();
        dialog.insert_or_update(message);
        (dialog, message_id)
    }

    #[test]
    fn late_smaller_ack_is_ignored() {
        let (mut dialog, message_id) = test_dialog();
        let mut notifier = StoreNotifier::noop();
        let sender = UserId::random();

        let t0 = TimeStamp::now();
        let t1: TimeStamp = (t0.time() + Duration::seconds(1)).into();

        StatusReport::new(sender, t1)
            .with_status(message_id, MessageStatus::Delivered)
            .apply(&mut dialog, &mut notifier);
        assert_eq!(
            dialog.message(message_id).unwrap().status(),
            MessageStatus::Delivered
        );

        // the sent acknowledgement arrives late and out of order
        StatusReport::new(sender, t0)
            .with_status(message_id, MessageStatus::Sent)
            .apply(&mut dialog, &mut notifier);
        assert_eq!(
            dialog.message(message_id).unwrap().status(),
            MessageStatus::Delivered
        );
    }

    #[test]
    fn duplicate_report_is_idempotent() {
        let (mut dialog, message_id) = test_dialog();
        let mut notifier = StoreNotifier::noop();
        let report = StatusReport::new(UserId::random(), TimeStamp::now())
            .with_status(message_id, MessageStatus::Read);

        report.apply(&mut dialog, &mut notifier);
        let after_first = dialog.clone();
        report.apply(&mut dialog, &mut notifier);
        assert_eq!(dialog, after_first);
    }

    #[test]
    fn unknown_message_is_swallowed() {
        let (mut dialog, _) = test_dialog();
        let mut notifier = StoreNotifier::noop();
        let before = dialog.clone();

        StatusReport::new(UserId::random(), TimeStamp::now())
            .with_status(MessageId::random(), MessageStatus::Read)
            .apply(&mut dialog, &mut notifier);
        assert_eq!(dialog, before);
    }

    #[test]
    fn last_status_per_message_wins() {
        let (mut dialog, message_id) = test_dialog();
        let mut notifier = StoreNotifier::noop();

        StatusReport::new(UserId::random(), TimeStamp::now())
            .with_status(message_id, MessageStatus::Delivered)
            .with_status(message_id, MessageStatus::Read)
            .apply(&mut dialog, &mut notifier);
        assert_eq!(
            dialog.message(message_id).unwrap().status(),
            MessageStatus::Read
        );
    }

    #[test]
    fn ack_does_not_resurrect_failed_message() {
        let (mut dialog, message_id) = test_dialog();
        let mut notifier = StoreNotifier::noop();
        dialog
            .message_mut(message_id)
            .unwrap()
            .mark_failed("network error")
            .unwrap();

        StatusReport::new(UserId::random(), TimeStamp::now())
            .with_status(message_id, MessageStatus::Delivered)
            .apply(&mut dialog, &mut notifier);
        assert_eq!(
            dialog.message(message_id).unwrap().status(),
            MessageStatus::Failed
        );
    }

    #[derive(Debug, Clone, Copy)]
    struct AckStatus(MessageStatus);

    impl Arbitrary for AckStatus {
        fn arbitrary(g: &mut Gen) -> Self {
            let status = *g
                .choose(&[
                    MessageStatus::Sent,
                    MessageStatus::Delivered,
                    MessageStatus::Read,
                ])
                .unwrap();
            AckStatus(status)
        }
    }

    #[quickcheck]
    fn observed_statuses_never_regress(acks: Vec<AckStatus>) -> bool {
        let (mut dialog, message_id) = test_dialog();
        let mut notifier = StoreNotifier::noop();
        let mut last_rank = dialog
            .message(message_id)
            .unwrap()
            .status()
            .rank()
            .unwrap();

        for AckStatus(status) in acks {
            StatusReport::new(UserId::random(), TimeStamp::now())
                .with_status(message_id, status)
                .apply(&mut dialog, &mut notifier);
            let rank = dialog
                .message(message_id)
                .unwrap()
                .status()
                .rank()
                .unwrap();
            if rank < last_rank {
                return false;
            }
            last_rank = rank;
        }
        true
    }
}
