// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::error;

use super::StoreEntityId;

// 1024 * size_of::<Arc<StoreNotification>>() = 1024 * 8 = 8 KiB
const NOTIFICATION_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub(crate) struct StoreNotificationsSender {
    tx: broadcast::Sender<Arc<StoreNotification>>,
}

impl StoreNotificationsSender {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_SIZE);
        Self { tx }
    }

    pub(crate) fn notify(&self, notification: impl Into<Arc<StoreNotification>>) {
        let _no_receivers = self.tx.send(notification.into());
    }

    pub(crate) fn subscribe(
        &self,
    ) -> impl tokio_stream::Stream<Item = Arc<StoreNotification>> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).map(|res| match res {
            Ok(notification) => notification,
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                error!("store notifications lagged by {} messages", n);
                Arc::new(StoreNotification::default())
            }
        })
    }
}

impl Default for StoreNotificationsSender {
    fn default() -> Self {
        Self::new()
    }
}

/// A batch of store changes, published to subscribers.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StoreNotification {
    pub added: Vec<StoreEntityId>,
    pub updated: Vec<StoreEntityId>,
    pub removed: Vec<StoreEntityId>,
}

impl StoreNotification {
    pub(crate) fn builder() -> StoreNotificationBuilder {
        StoreNotificationBuilder::default()
    }

    pub fn contains_added(&self, id: &StoreEntityId) -> bool {
        self.added.binary_search(id).is_ok()
    }

    pub fn contains_updated(&self, id: &StoreEntityId) -> bool {
        self.updated.binary_search(id).is_ok()
    }

    pub fn contains_removed(&self, id: &StoreEntityId) -> bool {
        self.removed.binary_search(id).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct StoreNotificationBuilder {
    inner: StoreNotification,
}

impl StoreNotificationBuilder {
    pub(crate) fn add(&mut self, id: impl Into<StoreEntityId>) -> &mut Self {
        self.inner.added.push(id.into());
        self
    }

    pub(crate) fn update(&mut self, id: impl Into<StoreEntityId>) -> &mut Self {
        self.inner.updated.push(id.into());
        self
    }

    pub(crate) fn remove(&mut self, id: impl Into<StoreEntityId>) -> &mut Self {
        self.inner.removed.push(id.into());
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub(crate) fn build(&mut self) -> Arc<StoreNotification> {
        let mut inner = std::mem::take(&mut self.inner);
        inner.added.shrink_to_fit();
        inner.updated.shrink_to_fit();
        inner.removed.shrink_to_fit();
        inner.added.sort_unstable();
        inner.updated.sort_unstable();
        inner.removed.sort_unstable();
        Arc::new(inner)
    }
}

impl From<&mut StoreNotificationBuilder> for Arc<StoreNotification> {
    fn from(builder: &mut StoreNotificationBuilder) -> Self {
        builder.build()
    }
}

/// Collects store changes and publishes them as one notification on drop.
pub struct StoreNotifier {
    tx: Option<StoreNotificationsSender>,
    builder: StoreNotificationBuilder,
}

impl StoreNotifier {
    pub(crate) fn new(tx: StoreNotificationsSender) -> Self {
        Self {
            tx: Some(tx),
            builder: StoreNotificationBuilder::default(),
        }
    }

    /// A notifier that collects but never publishes. Useful in tests.
    pub fn noop() -> Self {
        Self {
            tx: None,
            builder: StoreNotificationBuilder::default(),
        }
    }

    pub fn add(&mut self, id: impl Into<StoreEntityId>) -> &mut Self {
        self.builder.add(id);
        self
    }

    pub fn update(&mut self, id: impl Into<StoreEntityId>) -> &mut Self {
        self.builder.update(id);
        self
    }

    pub fn remove(&mut self, id: impl Into<StoreEntityId>) -> &mut Self {
        self.builder.remove(id);
        self
    }
}

impl Drop for StoreNotifier {
    fn drop(&mut self) {
        if !self.builder.is_empty()
            && let Some(tx) = &self.tx
        {
            tx.notify(self.builder.build());
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;
    use wrencommon::identifiers::MessageId;

    use super::*;

    #[test]
    fn notification_lookup_uses_sorted_ids() {
        let mut builder = StoreNotification::builder();
        for n in [3_u128, 1, 2] {
            builder.update(MessageId::new(Uuid::from_u128(n)));
        }
        let notification = builder.build();
        for n in [1_u128, 2, 3] {
            assert!(
                notification.contains_updated(&MessageId::new(Uuid::from_u128(n)).into())
            );
        }
        assert!(!notification.contains_added(&MessageId::new(Uuid::from_u128(1)).into()));
    }

    #[tokio::test]
    async fn notifier_publishes_one_batch_on_drop() {
        let tx = StoreNotificationsSender::new();
        let mut notifications = std::pin::pin!(tx.subscribe());

        let message_id = MessageId::random();
        let mut notifier = StoreNotifier::new(tx.clone());
        notifier.add(message_id);
        notifier.update(message_id);
        drop(notifier);

        let notification = notifications.next().await.unwrap();
        assert!(notification.contains_added(&message_id.into()));
        assert!(notification.contains_updated(&message_id.into()));

        // an empty notifier publishes nothing
        drop(StoreNotifier::new(tx.clone()));
        let timeout =
            tokio::time::timeout(std::time::Duration::from_millis(50), notifications.next());
        assert!(timeout.await.is_err());
    }
}
