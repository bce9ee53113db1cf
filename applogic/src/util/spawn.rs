// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::future::Future;

use tokio::task::JoinHandle;

/// Spawn a future from a synchronous function.
///
/// Cubits are constructed from synchronous UI callbacks that run on the
/// application's runtime; the handle of that runtime is taken from the
/// calling context.
#[track_caller]
pub(crate) fn spawn_from_sync<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::runtime::Handle::current().spawn(future)
}
