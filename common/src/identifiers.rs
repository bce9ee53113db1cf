// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Opaque identifiers for the entities handled by the client crates.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Identifier of a dialog (a conversation between two or more participants)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DialogId {
    uuid: Uuid,
}

impl DialogId {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn random() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl From<Uuid> for DialogId {
    fn from(uuid: Uuid) -> Self {
        Self { uuid }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// Identifier of a message in a dialog
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId {
    pub uuid: Uuid,
}

impl MessageId {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn random() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self { uuid }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AttachmentId {
    pub uuid: Uuid,
}

impl AttachmentId {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn random() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    pub fn url(&self) -> String {
        format!("wren://attachment/{}", self.uuid)
    }

    pub fn from_url(url: &str) -> Option<Self> {
        let url = Url::parse(url).ok()?;
        if url.scheme() != "wren" || url.host_str() != Some("attachment") {
            return None;
        }
        let uuid = url.path().strip_prefix('/')?.parse().ok()?;
        Some(Self { uuid })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// Identifier of a user
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UserId {
    uuid: Uuid,
}

impl UserId {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn random() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        Self { uuid }
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_id_url_round_trip() {
        let id = AttachmentId::random();
        assert_eq!(AttachmentId::from_url(&id.url()), Some(id));
    }

    #[test]
    fn attachment_id_rejects_foreign_url() {
        assert_eq!(AttachmentId::from_url("https://example.com/a"), None);
        assert_eq!(AttachmentId::from_url("wren://attachment/not-a-uuid"), None);
    }
}
