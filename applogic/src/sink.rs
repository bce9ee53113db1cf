// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// The receiving side of a sink went away.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("stream sink is closed")]
pub struct SinkClosed;

/// Push-end of a state subscription.
///
/// A subscriber registers a sink with a cubit and reads the paired stream;
/// the cubit pushes every published snapshot into all registered sinks and
/// drops sinks whose receiver is gone.
#[derive(Debug)]
pub struct StreamSink<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for StreamSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> StreamSink<T> {
    /// Creates a sink together with the stream it feeds.
    pub fn channel() -> (Self, UnboundedReceiverStream<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }

    pub fn add(&self, value: T) -> Result<(), SinkClosed> {
        self.tx.send(value).map_err(|_| SinkClosed)
    }
}
