// ── Notification bus ──
//
// Typed publish/subscribe over a tokio broadcast channel. Every
// subscriber gets its own copy of each value; dropping a `Subscription`
// unsubscribes it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;
use uprotect_api::UpdateEvent;

use crate::model::Bootstrap;

/// Default per-subscriber backlog before the oldest values are dropped.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Everything a controller or livestream publishes.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Outcome of a `login()` call.
    Login(bool),
    /// A new bootstrap snapshot was swapped in.
    InventoryUpdated(Arc<Bootstrap>),
    /// A decoded realtime update.
    Update(Arc<UpdateEvent>),
    /// The livestream's initialization segment.
    LivestreamInit(Bytes),
    /// One `moof` + `mdat` media segment.
    LivestreamSegment(Bytes),
    /// The livestream ended; no further segments follow.
    LivestreamClosed(String),
}

/// Broadcast bus for one kind of value.
#[derive(Debug)]
pub struct Bus<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Bus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver `value` to every live subscriber. Returns how many there were.
    pub fn publish(&self, value: T) -> usize {
        // No subscribers is not an error.
        self.tx.send(value).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for Bus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// A live subscription. Values published before it was created are not
/// seen.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Wait for the next value. `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the values it missed.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged, dropped notifications");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// The next value if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged, dropped notifications");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> NotificationStream<T> {
        NotificationStream {
            inner: BroadcastStream::new(self.rx),
        }
    }
}

/// `Stream` adapter over a [`Subscription`]. Lagged gaps are skipped.
pub struct NotificationStream<T> {
    inner: BroadcastStream<T>,
}

impl<T: Clone + Send + 'static> Stream for NotificationStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(value))) => return Poll::Ready(Some(value)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, "subscriber lagged, dropped notifications");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
