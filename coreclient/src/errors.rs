// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{messages::MessageStatus, store::StoreEntityId};

/// A message failed the construction contract.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message has neither text nor attachment")]
    EmptyMessage,
}

/// A status change would regress the monotonic delivery order.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal status transition from {from:?} to {to:?}")]
pub struct InvalidTransitionError {
    pub from: MessageStatus,
    pub to: MessageStatus,
}

/// An attachment upload or download failed.
///
/// Retry-eligible errors can be resolved through an explicit resend or
/// redownload; they are never retried silently.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("attachment transfer failed: {reason}")]
pub struct TransferError {
    reason: String,
    retryable: bool,
}

impl TransferError {
    pub fn new(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason: reason.into(),
            retryable,
        }
    }

    /// The transfer was cancelled, e.g. because its dialog was closed.
    pub fn cancelled() -> Self {
        Self::new("cancelled", true)
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// An event referenced an entity that is no longer present.
///
/// This represents a race between deletion and a late acknowledgement or
/// callback. It is logged and swallowed, never surfaced to the user.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown entity: {0:?}")]
pub struct UnknownEntityError(pub StoreEntityId);

#[derive(Error, Debug)]
pub enum CoreclientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransitionError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    UnknownEntity(#[from] UnknownEntityError),
}
