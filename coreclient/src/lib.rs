// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message, dialog and attachment state handling of the client.
//!
//! The crate implements the delivery/read state machine of messages, the
//! transfer lifecycle of attachments and the dialog aggregate that orders
//! both for rendering. Access to the data goes through the [`store::Store`]
//! trait; changes are observable via store notifications.

pub mod attachments;
pub mod dialogs;
pub mod errors;
pub mod messages;
pub mod store;

pub use attachments::{
    AttachmentDraft, AttachmentRecord, TransferDirection, TransferEvent, TransferPhase,
    TransferProgress, TransferTracker,
};
pub use dialogs::{Dialog, DialogAttributes, DialogDetails, DialogType};
pub use errors::{
    CoreclientError, InvalidTransitionError, TransferError, UnknownEntityError, ValidationError,
};
pub use messages::{
    ContentBody, DialogMessage, MessageBody, MessageStatus, PerMessageStatus, StatusReport,
    SystemMessage,
};
pub use wrencommon::{
    identifiers::{AttachmentId, DialogId, MessageId, UserId},
    time::TimeStamp,
};
