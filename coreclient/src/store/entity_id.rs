// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use wrencommon::identifiers::{AttachmentId, DialogId, MessageId, UserId};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::From,
)]
pub enum StoreEntityId {
    User(UserId),
    Dialog(DialogId),
    Message(MessageId),
    Attachment(AttachmentId),
}
