// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;
use wrencommon::identifiers::{AttachmentId, MessageId};

use crate::errors::TransferError;

mod transfer;

pub use transfer::{TransferEvent, TransferProgress, TransferTask, TransferTracker};

/// Lifecycle stage of an attachment's upload or download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransferPhase {
    #[default]
    Pending,
    Transferring,
    Available,
    Failed,
}

impl TransferPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferPhase::Available | TransferPhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// A local file picked for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDraft {
    pub content_type: String,
    pub size_bytes: u64,
    pub local_path: PathBuf,
}

/// State of one attachment and its transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    attachment_id: AttachmentId,
    message_id: MessageId,
    direction: TransferDirection,
    content_type: String,
    size_bytes: u64,
    transferred_bytes: u64,
    local_path: Option<PathBuf>,
    remote_url: Option<Url>,
    phase: TransferPhase,
    failure: Option<TransferError>,
}

impl AttachmentRecord {
    pub fn new_upload(
        attachment_id: AttachmentId,
        message_id: MessageId,
        draft: AttachmentDraft,
    ) -> Self {
        Self {
            attachment_id,
            message_id,
            direction: TransferDirection::Upload,
            content_type: draft.content_type,
            size_bytes: draft.size_bytes,
            transferred_bytes: 0,
            local_path: Some(draft.local_path),
            remote_url: None,
            phase: TransferPhase::Pending,
            failure: None,
        }
    }

    pub fn new_download(
        attachment_id: AttachmentId,
        message_id: MessageId,
        content_type: String,
        size_bytes: u64,
        remote_url: Url,
    ) -> Self {
        Self {
            attachment_id,
            message_id,
            direction: TransferDirection::Download,
            content_type,
            size_bytes,
            transferred_bytes: 0,
            local_path: None,
            remote_url: Some(remote_url),
            phase: TransferPhase::Pending,
            failure: None,
        }
    }

    pub fn attachment_id(&self) -> AttachmentId {
        self.attachment_id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    pub fn remote_url(&self) -> Option<&Url> {
        self.remote_url.as_ref()
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn failure(&self) -> Option<&TransferError> {
        self.failure.as_ref()
    }

    /// Fractional progress in `[0.0, 1.0]`.
    pub fn fraction(&self) -> f64 {
        match self.phase {
            TransferPhase::Available => 1.0,
            _ if self.size_bytes == 0 => 0.0,
            _ => self.transferred_bytes as f64 / self.size_bytes as f64,
        }
    }

    pub(crate) fn begin_transfer(&mut self) {
        self.phase = TransferPhase::Transferring;
        self.failure = None;
    }

    /// Records clamped, monotonic progress.
    pub(crate) fn record_progress(&mut self, transferred_bytes: u64) {
        self.transferred_bytes = self
            .transferred_bytes
            .max(transferred_bytes.min(self.size_bytes));
    }

    pub(crate) fn mark_available(&mut self, local_path: PathBuf, remote_url: Option<Url>) {
        self.transferred_bytes = self.size_bytes;
        self.local_path = Some(local_path);
        if remote_url.is_some() {
            self.remote_url = remote_url;
        }
        self.failure = None;
        self.phase = TransferPhase::Available;
    }

    pub(crate) fn mark_failed(&mut self, error: TransferError) {
        self.failure = Some(error);
        self.phase = TransferPhase::Failed;
    }

    /// Resets a failed transfer so it can be picked up again.
    pub(crate) fn reset_for_retry(&mut self) {
        self.transferred_bytes = 0;
        self.failure = None;
        self.phase = TransferPhase::Pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download_record() -> AttachmentRecord {
        let attachment_id = AttachmentId::random();
        AttachmentRecord::new_download(
            attachment_id,
            MessageId::random(),
            "image/png".to_owned(),
            1000,
            Url::parse(&attachment_id.url()).unwrap(),
        )
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut record = download_record();
        record.begin_transfer();
        record.record_progress(300);
        assert_eq!(record.transferred_bytes(), 300);
        // a late, smaller report does not move progress backwards
        record.record_progress(150);
        assert_eq!(record.transferred_bytes(), 300);
        // reports beyond the total are clamped
        record.record_progress(2000);
        assert_eq!(record.transferred_bytes(), 1000);
    }

    #[test]
    fn available_implies_local_path() {
        let mut record = download_record();
        record.begin_transfer();
        record.mark_available(PathBuf::from("/tmp/a.png"), None);
        assert_eq!(record.phase(), TransferPhase::Available);
        assert!(record.local_path().is_some());
        assert_eq!(record.fraction(), 1.0);
    }

    #[test]
    fn retry_resets_failure() {
        let mut record = download_record();
        record.begin_transfer();
        record.mark_failed(TransferError::new("connection reset", true));
        assert_eq!(record.phase(), TransferPhase::Failed);
        record.reset_for_retry();
        assert_eq!(record.phase(), TransferPhase::Pending);
        assert_eq!(record.failure(), None);
        assert_eq!(record.transferred_bytes(), 0);
    }
}
