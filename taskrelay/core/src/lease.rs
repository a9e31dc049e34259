//! Leased Streams
//!
//! Binds an admission lease to the lifetime of a response stream. The lease is
//! released exactly once, on whichever happens first:
//!
//! - the inner stream ends
//! - the inner stream yields an error (released before the error is delivered)
//! - [`LeasedStream::close`] is called
//! - the wrapper is dropped (release is spawned onto the current runtime)
//!
//! ```text
//!   Streaming ──end/error──▶ Releasing ──exit done──▶ Done
//!       │                                              ▲
//!       └──────────────── close() / drop ──────────────┘
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};

use crate::limiter::ConcurrencyLimiter;
use crate::tasks::RequestId;

/// An admission lease held by a running task
pub struct Lease {
    limiter: Arc<ConcurrencyLimiter>,
    request_id: RequestId,
}

impl Lease {
    /// Wrap a request ID returned by [`ConcurrencyLimiter::enter`]
    #[must_use]
    pub fn new(limiter: Arc<ConcurrencyLimiter>, request_id: RequestId) -> Self {
        Self {
            limiter,
            request_id,
        }
    }

    /// The admitted request
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Give the slot back
    ///
    /// Store failures are logged; the lease is reclaimed by reconciliation
    /// once it goes stale.
    pub async fn release(self) {
        if let Err(e) = self.limiter.exit(&self.request_id).await {
            tracing::warn!(
                client_id = %self.limiter.client_id(),
                request_id = %self.request_id,
                error = %e,
                "Failed to release lease"
            );
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("client_id", &self.limiter.client_id())
            .field("request_id", &self.request_id)
            .finish()
    }
}

enum State<T> {
    Streaming,
    Releasing {
        pending: Option<T>,
        release: BoxFuture<'static, ()>,
    },
    Done,
}

/// A stream that holds an admission lease until it is finished
pub struct LeasedStream<S: Stream> {
    inner: Option<S>,
    lease: Option<Lease>,
    state: State<S::Item>,
}

impl<S: Stream> LeasedStream<S> {
    /// Wrap `inner`, releasing `lease` when it is finished
    pub fn new(inner: S, lease: Lease) -> Self {
        Self {
            inner: Some(inner),
            lease: Some(lease),
            state: State::Streaming,
        }
    }

    /// Whether the lease is still held
    #[must_use]
    pub fn holds_lease(&self) -> bool {
        self.lease.is_some() || matches!(self.state, State::Releasing { .. })
    }

    /// Drop the inner stream and release the lease
    ///
    /// Calling this more than once, or after the stream has ended, is a no-op.
    pub async fn close(&mut self) {
        self.inner = None;
        match std::mem::replace(&mut self.state, State::Done) {
            State::Releasing { release, .. } => release.await,
            State::Streaming | State::Done => {}
        }
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }

    fn begin_release(&mut self, pending: Option<S::Item>) {
        self.inner = None;
        let release = match self.lease.take() {
            Some(lease) => lease.release().boxed(),
            None => futures::future::ready(()).boxed(),
        };
        self.state = State::Releasing { pending, release };
    }
}

// No field is ever pin-projected.
impl<S: Stream + Unpin> Unpin for LeasedStream<S> {}

impl<S, T, E> Stream for LeasedStream<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Streaming => {
                    let Some(inner) = this.inner.as_mut() else {
                        this.state = State::Done;
                        return Poll::Ready(None);
                    };
                    match inner.poll_next_unpin(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(Ok(item))),
                        Poll::Ready(Some(Err(e))) => this.begin_release(Some(Err(e))),
                        Poll::Ready(None) => this.begin_release(None),
                    }
                }
                State::Releasing { pending, release } => {
                    if release.poll_unpin(cx).is_pending() {
                        return Poll::Pending;
                    }
                    let pending = pending.take();
                    this.state = State::Done;
                    return Poll::Ready(pending);
                }
                State::Done => return Poll::Ready(None),
            }
        }
    }
}

impl<S: Stream> Drop for LeasedStream<S> {
    fn drop(&mut self) {
        let release = match std::mem::replace(&mut self.state, State::Done) {
            State::Releasing { release, .. } => Some(release),
            State::Streaming | State::Done => self.lease.take().map(|lease| lease.release().boxed()),
        };
        let Some(release) = release else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release);
            }
            Err(_) => tracing::warn!(
                "Leased stream dropped outside a runtime; lease left for reconciliation"
            ),
        }
    }
}

impl<S: Stream> std::fmt::Debug for LeasedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedStream")
            .field("lease", &self.lease)
            .field("streaming", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{LimiterConfig, LimiterRegistry};
    use crate::store::MemoryStore;
    use futures::stream;

    async fn admitted() -> (Arc<MemoryStore>, Arc<ConcurrencyLimiter>, Lease) {
        let store = Arc::new(MemoryStore::new());
        let registry = LimiterRegistry::new(store.clone(), LimiterConfig::default());
        let limiter = registry.get_or_create("app", 1).await.unwrap();
        let request_id = limiter.enter(None).await.unwrap();
        let lease = Lease::new(limiter.clone(), request_id);
        (store, limiter, lease)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_release_on_end() {
        let (_, limiter, lease) = admitted().await;
        let inner = stream::iter(vec![Ok::<_, String>(1), Ok(2)]);
        let mut leased = LeasedStream::new(inner, lease);

        assert_eq!(leased.next().await, Some(Ok(1)));
        assert_eq!(leased.next().await, Some(Ok(2)));
        assert_eq!(limiter.active_count().await.unwrap(), 1);

        assert_eq!(leased.next().await, None);
        assert_eq!(limiter.active_count().await.unwrap(), 0);
        assert!(!leased.holds_lease());
        assert_eq!(leased.next().await, None);
    }

    #[tokio::test]
    async fn test_release_before_error_is_delivered() {
        let (_, limiter, lease) = admitted().await;
        let inner = stream::iter(vec![Ok(1), Err("boom".to_string()), Ok(3)]);
        let mut leased = LeasedStream::new(inner, lease);

        assert_eq!(leased.next().await, Some(Ok(1)));
        assert_eq!(leased.next().await, Some(Err("boom".to_string())));
        assert_eq!(limiter.active_count().await.unwrap(), 0);
        // The inner stream is dropped after an error.
        assert_eq!(leased.next().await, None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (store, limiter, lease) = admitted().await;
        let inner = stream::iter(vec![Ok::<_, String>(1)]);
        let mut leased = LeasedStream::new(inner, lease);

        leased.close().await;
        assert_eq!(limiter.active_count().await.unwrap(), 0);

        let ops = store.operation_count();
        leased.close().await;
        leased.close().await;
        assert_eq!(store.operation_count(), ops);
        assert_eq!(leased.next().await, None);
    }

    #[tokio::test]
    async fn test_close_after_end_does_not_release_again() {
        let (store, _, lease) = admitted().await;
        let mut leased = LeasedStream::new(stream::iter(Vec::<Result<u8, String>>::new()), lease);
        assert_eq!(leased.next().await, None);

        let ops = store.operation_count();
        leased.close().await;
        drop(leased);
        settle().await;
        assert_eq!(store.operation_count(), ops);
    }

    #[tokio::test]
    async fn test_drop_releases_lease() {
        let (_, limiter, lease) = admitted().await;
        let inner = stream::iter(vec![Ok::<_, String>(1), Ok(2)]);
        let mut leased = LeasedStream::new(inner, lease);
        assert_eq!(leased.next().await, Some(Ok(1)));

        drop(leased);
        settle().await;
        assert_eq!(limiter.active_count().await.unwrap(), 0);
        assert!(limiter.enter(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unlimited_lease_release_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let registry = LimiterRegistry::new(store.clone(), LimiterConfig::default());
        let limiter = registry.get_or_create("app", 0).await.unwrap();
        let request_id = limiter.enter(None).await.unwrap();
        let mut leased = LeasedStream::new(
            stream::iter(vec![Ok::<_, String>(1)]),
            Lease::new(limiter, request_id),
        );
        while leased.next().await.is_some() {}
        assert_eq!(store.operation_count(), 0);
    }
}
