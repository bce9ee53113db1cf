// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::StreamSink;

use super::spawn_from_sync;

pub(crate) trait Cubit {
    type State;

    fn close(&mut self);

    fn is_closed(&self) -> bool;

    fn state(&self) -> Self::State;

    async fn stream(&mut self, sink: StreamSink<Self::State>);
}

/// Shared machinery of a cubit: the current state and its subscribers.
///
/// State is held in a watch channel; the emitter loop forwards the latest
/// value to all registered sinks. Changes arriving within one scheduling
/// tick collapse into a single emission, because the loop always reads the
/// channel's most recent value.
pub(crate) struct CubitCore<S> {
    state_tx: watch::Sender<S>,
    sinks_tx: mpsc::Sender<StreamSink<S>>,
    cancel: CancellationToken,
}

impl<S> Drop for CubitCore<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<S: Clone> Cubit for CubitCore<S> {
    type State = S;

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }

    fn state(&self) -> S {
        self.state_tx.borrow().clone()
    }

    async fn stream(&mut self, sink: StreamSink<S>) {
        if self.sinks_tx.send(sink).await.is_err() {
            self.close();
        }
    }
}

impl<S> CubitCore<S>
where
    S: Default + Clone + Send + Sync + fmt::Debug + 'static,
{
    pub(crate) fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(S::default());
        let (sinks_tx, sinks_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        spawn_from_sync(Self::emitter_loop(state_rx, sinks_rx, cancel.clone()));

        Self {
            state_tx,
            sinks_tx,
            cancel,
        }
    }

    pub(crate) fn state_tx(&self) -> &watch::Sender<S> {
        &self.state_tx
    }

    pub(crate) fn borrow_state(&self) -> watch::Ref<'_, S> {
        self.state_tx.borrow()
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn emitter_loop(
        mut state_rx: watch::Receiver<S>,
        mut sinks_rx: mpsc::Receiver<StreamSink<S>>,
        stop: CancellationToken,
    ) {
        let mut sinks = Vec::new();
        loop {
            tokio::select! {
                sink = sinks_rx.recv() => {
                    let Some(sink) = sink else { return };
                    // a new subscriber starts out with the current state
                    let state = state_rx.borrow().clone();
                    if sink.add(state).is_ok() {
                        sinks.push(sink);
                    }
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    };
                    let state = state_rx.borrow_and_update().clone();
                    trace!("emitting new state, sinks = {}, state = {:?}", sinks.len(), state);
                    sinks.retain(|sink| sink.add(state.clone()).is_ok());
                },
                _ = stop.cancelled() => {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn emitter_collapses_rapid_changes() {
        let mut core: CubitCore<u32> = CubitCore::new();

        let (sink, mut states) = StreamSink::channel();
        core.stream(sink).await;
        // registering delivers the current state
        assert_eq!(states.next().await, Some(0));

        core.state_tx().send_modify(|state| *state = 1);
        core.state_tx().send_modify(|state| *state = 2);
        core.state_tx().send_modify(|state| *state = 3);

        // only the latest value of the burst is observed
        let state = states.next().await.unwrap();
        assert_eq!(state, 3);
        assert_eq!(core.state(), 3);
    }

    #[tokio::test]
    async fn closed_cubit_stops_emitting() {
        let mut core: CubitCore<u32> = CubitCore::new();
        assert!(!core.is_closed());
        core.close();
        assert!(core.is_closed());
    }
}
