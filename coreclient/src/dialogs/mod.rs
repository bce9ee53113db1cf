// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use wrencommon::{
    identifiers::{AttachmentId, DialogId, MessageId, UserId},
    time::TimeStamp,
};

use crate::{attachments::AttachmentRecord, messages::DialogMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogType {
    Private,
    Group,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct DialogAttributes {
    title: String,
    picture: Option<Vec<u8>>,
}

impl DialogAttributes {
    pub fn new(title: String, picture: Option<Vec<u8>>) -> Self {
        Self { title, picture }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn picture(&self) -> Option<&[u8]> {
        self.picture.as_deref()
    }

    pub fn set_title(&mut self, title: String) {
        self.title = title;
    }

    pub fn set_picture(&mut self, picture: Option<Vec<u8>>) {
        self.picture = picture;
    }
}

/// Metadata view of a dialog, without the message log.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogDetails {
    pub id: DialogId,
    pub dialog_type: DialogType,
    pub participants: HashSet<UserId>,
    pub attributes: DialogAttributes,
    pub last_read: TimeStamp,
    pub unread_messages_count: usize,
    pub last_message: Option<DialogMessage>,
}

/// A conversation and its ordered message log.
///
/// Messages are stored in canonical ascending `(created_at, id)` order and
/// are unique by id. The newest-first order used for rendering is a
/// projection ([`Self::displayed_messages`]), not a storage order.
#[derive(Debug, Clone, PartialEq)]
pub struct Dialog {
    id: DialogId,
    dialog_type: DialogType,
    participants: HashSet<UserId>,
    attributes: DialogAttributes,
    last_read: TimeStamp,
    messages: Vec<DialogMessage>,
    message_index: HashMap<MessageId, usize>,
    attachments: HashMap<AttachmentId, AttachmentRecord>,
}

impl Dialog {
    pub fn new(
        id: DialogId,
        dialog_type: DialogType,
        participants: HashSet<UserId>,
        attributes: DialogAttributes,
    ) -> Self {
        Self {
            id,
            dialog_type,
            participants,
            attributes,
            last_read: TimeStamp::now(),
            messages: Vec::new(),
            message_index: HashMap::new(),
            attachments: HashMap::new(),
        }
    }

    pub fn id(&self) -> DialogId {
        self.id
    }

    pub fn dialog_type(&self) -> DialogType {
        self.dialog_type
    }

    pub fn participants(&self) -> &HashSet<UserId> {
        &self.participants
    }

    pub fn attributes(&self) -> &DialogAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut DialogAttributes {
        &mut self.attributes
    }

    pub fn last_read(&self) -> TimeStamp {
        self.last_read
    }

    /// Moves the read marker forward. Returns whether it changed; the marker
    /// never moves backwards.
    pub fn set_last_read(&mut self, until: TimeStamp) -> bool {
        if until.is_more_recent_than(&self.last_read) {
            self.last_read = until;
            true
        } else {
            false
        }
    }

    /// Upserts a message, keyed by id.
    ///
    /// An existing message is replaced in place; its sort position is only
    /// recomputed when `created_at` changed.
    pub fn insert_or_update(&mut self, message: DialogMessage) {
        let mut reindex_start = None;
        if let Some(&pos) = self.message_index.get(&message.id()) {
            if self.messages[pos].created_at() == message.created_at() {
                self.messages[pos] = message;
                return;
            }
            self.messages.remove(pos);
            reindex_start = Some(pos);
        }
        let key = message.sort_key();
        let pos = self
            .messages
            .partition_point(|other| other.sort_key() < key);
        self.messages.insert(pos, message);
        self.reindex_from(reindex_start.unwrap_or(pos).min(pos));
    }

    /// Removes a message and its attachment record. Idempotent.
    pub fn remove(&mut self, message_id: MessageId) -> Option<DialogMessage> {
        let pos = self.message_index.remove(&message_id)?;
        let message = self.messages.remove(pos);
        self.reindex_from(pos);
        if let Some(attachment_id) = message.attachment_id() {
            self.attachments.remove(&attachment_id);
        }
        Some(message)
    }

    pub fn message(&self, message_id: MessageId) -> Option<&DialogMessage> {
        self.message_index
            .get(&message_id)
            .map(|&pos| &self.messages[pos])
    }

    pub(crate) fn message_mut(&mut self, message_id: MessageId) -> Option<&mut DialogMessage> {
        self.message_index
            .get(&message_id)
            .map(|&pos| &mut self.messages[pos])
    }

    /// The message log in canonical ascending order.
    pub fn messages(&self) -> &[DialogMessage] {
        &self.messages
    }

    /// The rendered projection: visible messages, newest first.
    ///
    /// Pure and deterministic for a given mutation log.
    pub fn displayed_messages(&self) -> impl Iterator<Item = &DialogMessage> {
        self.messages
            .iter()
            .rev()
            .filter(|message| message.is_visible())
    }

    pub fn last_message(&self) -> Option<&DialogMessage> {
        self.messages.last()
    }

    pub fn unread_messages_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.created_at() > self.last_read)
            .count()
    }

    pub fn details(&self) -> DialogDetails {
        DialogDetails {
            id: self.id,
            dialog_type: self.dialog_type,
            participants: self.participants.clone(),
            attributes: self.attributes.clone(),
            last_read: self.last_read,
            unread_messages_count: self.unread_messages_count(),
            last_message: self.last_message().cloned(),
        }
    }

    pub fn attachment(&self, attachment_id: AttachmentId) -> Option<&AttachmentRecord> {
        self.attachments.get(&attachment_id)
    }

    pub(crate) fn attachment_mut(
        &mut self,
        attachment_id: AttachmentId,
    ) -> Option<&mut AttachmentRecord> {
        self.attachments.get_mut(&attachment_id)
    }

    pub(crate) fn insert_attachment(&mut self, record: AttachmentRecord) {
        self.attachments.insert(record.attachment_id(), record);
    }

    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentRecord> {
        self.attachments.values()
    }

    fn reindex_from(&mut self, from: usize) {
        for (pos, message) in self.messages.iter().enumerate().skip(from) {
            self.message_index.insert(message.id(), pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use url::Url;
    use uuid::Uuid;
    use wrencommon::time::Duration;

    use crate::messages::{ContentBody, MessageBody, SystemMessage};

    use super::*;

    fn test_dialog() -> Dialog {
        Dialog::new(
            DialogId::new(Uuid::from_u128(1)),
            DialogType::Group,
            [UserId::new(Uuid::from_u128(10)), UserId::new(Uuid::from_u128(11))].into(),
            DialogAttributes::new("test".to_owned(), None),
        )
    }

    fn message_at(dialog: &Dialog, n: u128, offset_ms: i64) -> DialogMessage {
        DialogMessage::new_received(
            dialog.id(),
            MessageId::new(Uuid::from_u128(n)),
            UserId::new(Uuid::from_u128(10)),
            MessageBody::Content(ContentBody::new(format!("message {n}"), None, None).unwrap()),
            (TimeStamp::now().time() + Duration::milliseconds(offset_ms)).into(),
        )
    }

    fn displayed(dialog: &Dialog) -> Vec<DialogMessage> {
        dialog.displayed_messages().cloned().collect()
    }

    #[test]
    fn displayed_is_newest_first_without_system_messages() {
        let mut dialog = test_dialog();
        dialog.insert_or_update(message_at(&dialog, 100, 0));
        dialog.insert_or_update(message_at(&dialog, 101, 10));
        dialog.insert_or_update(DialogMessage::new_received(
            dialog.id(),
            MessageId::new(Uuid::from_u128(102)),
            UserId::new(Uuid::from_u128(10)),
            MessageBody::System(SystemMessage::MemberLeft(UserId::new(Uuid::from_u128(11)))),
            (TimeStamp::now().time() + Duration::milliseconds(20)).into(),
        ));

        let ids: Vec<_> = dialog.displayed_messages().map(DialogMessage::id).collect();
        assert_eq!(
            ids,
            [
                MessageId::new(Uuid::from_u128(101)),
                MessageId::new(Uuid::from_u128(100)),
            ]
        );
        // the canonical log still holds all three, ascending
        assert_eq!(dialog.messages().len(), 3);
    }

    #[test]
    fn equal_timestamps_tie_break_by_id() {
        let mut dialog = test_dialog();
        let at = TimeStamp::now();
        for n in [103_u128, 101, 102] {
            dialog.insert_or_update(DialogMessage::new_received(
                dialog.id(),
                MessageId::new(Uuid::from_u128(n)),
                UserId::new(Uuid::from_u128(10)),
                MessageBody::Content(ContentBody::new("hi".to_owned(), None, None).unwrap()),
                at,
            ));
        }
        let ids: Vec<_> = dialog.messages().iter().map(|m| m.id().uuid().as_u128()).collect();
        assert_eq!(ids, [101, 102, 103]);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut dialog = test_dialog();
        let original = message_at(&dialog, 100, 0);
        dialog.insert_or_update(original.clone());
        let updated = DialogMessage::new_received(
            dialog.id(),
            original.id(),
            original.sender_id(),
            MessageBody::Content(ContentBody::new("edited".to_owned(), None, None).unwrap()),
            original.created_at(),
        );
        dialog.insert_or_update(updated);
        assert_eq!(dialog.messages().len(), 1);
        let body = dialog.messages()[0].body().content().unwrap();
        assert_eq!(body.text(), "edited");
    }

    #[test]
    fn upsert_reorders_when_timestamp_changes() {
        let mut dialog = test_dialog();
        dialog.insert_or_update(message_at(&dialog, 100, 0));
        dialog.insert_or_update(message_at(&dialog, 101, 10));

        // restamp message 100 past message 101
        let restamped = message_at(&dialog, 100, 20);
        dialog.insert_or_update(restamped);

        let ids: Vec<_> = dialog.messages().iter().map(|m| m.id().uuid().as_u128()).collect();
        assert_eq!(ids, [101, 100]);
        // index stays consistent after the reorder
        assert_eq!(
            dialog.message(MessageId::new(Uuid::from_u128(100))).map(|m| m.id().uuid().as_u128()),
            Some(100)
        );
    }

    #[test]
    fn insert_then_remove_round_trips_displayed_messages() {
        let mut dialog = test_dialog();
        dialog.insert_or_update(message_at(&dialog, 100, 0));
        dialog.insert_or_update(message_at(&dialog, 101, 10));
        let before = serde_json::to_value(displayed(&dialog)).unwrap();

        let inserted = message_at(&dialog, 102, 5);
        let inserted_id = inserted.id();
        dialog.insert_or_update(inserted);
        assert_ne!(serde_json::to_value(displayed(&dialog)).unwrap(), before);

        dialog.remove(inserted_id);
        assert_eq!(serde_json::to_value(displayed(&dialog)).unwrap(), before);

        // removing an absent id is idempotent
        assert!(dialog.remove(inserted_id).is_none());
        assert_eq!(serde_json::to_value(displayed(&dialog)).unwrap(), before);
    }

    #[test]
    fn remove_drops_the_attachment_record() {
        let mut dialog = test_dialog();
        let attachment_id = AttachmentId::new(Uuid::from_u128(200));
        let message = DialogMessage::new_received(
            dialog.id(),
            MessageId::new(Uuid::from_u128(100)),
            UserId::new(Uuid::from_u128(10)),
            MessageBody::Content(
                ContentBody::new(String::new(), Some(attachment_id), None).unwrap(),
            ),
            TimeStamp::now(),
        );
        let record = AttachmentRecord::new_download(
            attachment_id,
            message.id(),
            "image/png".to_owned(),
            1000,
            Url::parse(&attachment_id.url()).unwrap(),
        );
        let message_id = message.id();
        dialog.insert_or_update(message);
        dialog.insert_attachment(record);
        assert!(dialog.attachment(attachment_id).is_some());

        dialog.remove(message_id);
        assert!(dialog.attachment(attachment_id).is_none());
    }

    #[test]
    fn unread_count_follows_read_marker() {
        let mut dialog = test_dialog();
        dialog.insert_or_update(message_at(&dialog, 100, 10));
        dialog.insert_or_update(message_at(&dialog, 101, 20));
        assert_eq!(dialog.unread_messages_count(), 2);

        let first_ts = dialog.message(MessageId::new(Uuid::from_u128(100))).unwrap().created_at();
        assert!(dialog.set_last_read(first_ts));
        assert_eq!(dialog.unread_messages_count(), 1);

        // the marker never moves backwards
        assert!(!dialog.set_last_read((first_ts.time() - Duration::seconds(1)).into()));
        assert_eq!(dialog.unread_messages_count(), 1);
    }
}
