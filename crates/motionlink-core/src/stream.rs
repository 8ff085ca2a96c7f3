// ── Reactive device stream ──
//
// Subscription type for consuming registry changes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::model::{DeviceId, DeviceState};
use crate::store::DeviceMap;

/// A subscription to the device registry.
///
/// Provides both point-in-time snapshot access and change notification via
/// [`changed()`](Self::changed) or by converting to a `Stream`.
pub struct DeviceStream {
    current: DeviceMap,
    receiver: watch::Receiver<DeviceMap>,
}

impl DeviceStream {
    pub(crate) fn new(mut receiver: watch::Receiver<DeviceMap>) -> Self {
        let current = receiver.borrow_and_update().clone();
        Self { current, receiver }
    }

    /// Snapshot as of creation or the last [`changed()`](Self::changed).
    pub fn current(&self) -> &DeviceMap {
        &self.current
    }

    /// Latest snapshot (may have changed since `current`).
    pub fn latest(&self) -> DeviceMap {
        self.receiver.borrow().clone()
    }

    /// One device from the latest snapshot.
    pub fn get(&self, id: &DeviceId) -> Option<Arc<DeviceState>> {
        self.receiver.borrow().get(id).cloned()
    }

    /// Wait for the next change, returning the new snapshot.
    /// Returns `None` once the session has been dropped.
    pub async fn changed(&mut self) -> Option<DeviceMap> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    /// The first item is the snapshot at conversion time.
    pub fn into_stream(self) -> DeviceWatchStream {
        DeviceWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter yielding a new registry snapshot on every write.
pub struct DeviceWatchStream {
    inner: WatchStream<DeviceMap>,
}

impl Stream for DeviceWatchStream {
    type Item = DeviceMap;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::ExecutionState;
    use crate::store::DeviceRegistry;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn changed_tracks_registry_writes() {
        let registry = DeviceRegistry::new();
        let mut stream = DeviceStream::new(registry.subscribe());
        assert!(stream.current().is_empty());

        let mut r1 = DeviceState::new("r1".into());
        r1.execution_state = ExecutionState::Executing;
        registry.apply_snapshot(vec![r1]);

        let snap = stream.changed().await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(stream.current().len(), 1);
        assert_eq!(
            stream.get(&"r1".into()).unwrap().execution_state,
            ExecutionState::Executing
        );
    }

    #[tokio::test]
    async fn changed_ends_when_registry_dropped() {
        let registry = DeviceRegistry::new();
        let mut stream = DeviceStream::new(registry.subscribe());
        drop(registry);
        assert!(stream.changed().await.is_none());
    }

    #[tokio::test]
    async fn into_stream_yields_current_first() {
        let registry = DeviceRegistry::new();
        registry.apply_snapshot(vec![DeviceState::new("r1".into())]);
        let mut stream = DeviceStream::new(registry.subscribe()).into_stream();
        let first = stream.next().await.unwrap();
        assert_eq!(first.len(), 1);
    }
}
