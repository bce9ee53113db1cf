// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Binds the client core to the UI through state-publishing cubits.
//!
//! A cubit owns the state of one screen, recomputes it on every relevant
//! store change and publishes it as an immutable snapshot. Subscribers
//! receive snapshots through a [`StreamSink`] and never mutate the source
//! state.

pub mod dialog_cubit;
pub mod logging;
pub mod typing;

pub(crate) mod attachments;
pub(crate) mod util;

mod sink;

pub use sink::{SinkClosed, StreamSink};
