use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

use super::delivery::{Delivery, InFlight, lock};
use crate::client::connection::Session;
use crate::codec;
use crate::transport::{DeliveryStream, RawDelivery};
use crate::utils::{MqError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered with the broker; `next()` not called yet.
    Created,
    Consuming,
    /// Terminal.
    Closed,
}

/// Stops a subscription from another task. A `next()` blocked on the
/// broker returns `Ok(None)` and the subscription closes.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // notify_one keeps a permit if nobody is waiting yet
        self.inner.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

enum Wake {
    Cancelled,
    ConnectionClosed,
    Delivered(Option<Result<RawDelivery>>),
}

pub struct Subscription {
    queue: String,
    consumer_tag: String,
    prefetch_count: u16,
    state: SubscriptionState,
    session: Weak<Session>,
    closed: watch::Receiver<bool>,
    stream: DeliveryStream,
    in_flight: InFlight,
    cancel: CancelHandle,
}

impl Subscription {
    pub(crate) fn new(
        session: &Arc<Session>,
        stream: DeliveryStream,
        queue: String,
        consumer_tag: String,
        prefetch_count: u16,
    ) -> Self {
        Self {
            queue,
            consumer_tag,
            prefetch_count,
            state: SubscriptionState::Created,
            session: Arc::downgrade(session),
            closed: session.closed_signal(),
            stream,
            in_flight: Arc::new(Mutex::new(Default::default())),
            cancel: CancelHandle::default(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Deliveries handed out and not yet settled.
    pub fn unacked(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Waits for the next delivery.
    ///
    /// Returns `Ok(None)` once the subscription is closed or cancelled, and
    /// `Err(MqError::ConnectionClosed)` when the connection goes away while
    /// waiting. Either way the subscription is then closed for good.
    pub async fn next(&mut self) -> Result<Option<Delivery>> {
        if self.state == SubscriptionState::Closed {
            return Ok(None);
        }
        self.state = SubscriptionState::Consuming;

        if self.cancel.is_cancelled() {
            self.close().await?;
            return Ok(None);
        }
        if *self.closed.borrow() {
            return Err(self.lost());
        }

        let wake = tokio::select! {
            biased;
            _ = self.cancel.inner.notify.notified() => Wake::Cancelled,
            _ = connection_closed(&mut self.closed) => Wake::ConnectionClosed,
            item = self.stream.next() => Wake::Delivered(item),
        };

        match wake {
            Wake::Cancelled => {
                self.close().await?;
                Ok(None)
            }
            Wake::ConnectionClosed => Err(self.lost()),
            Wake::Delivered(Some(Ok(raw))) => self.accept(raw).await.map(Some),
            Wake::Delivered(Some(Err(e))) => {
                self.state = SubscriptionState::Closed;
                Err(e)
            }
            // the broker ended the consumer stream
            Wake::Delivered(None) => Err(self.lost()),
        }
    }

    /// Like `next`, giving up after `timeout` with `Ok(None)`. Check
    /// `state()` to tell a timeout from a closed subscription.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    /// Cancels the consumer registration and hands every unsettled delivery
    /// back to the broker for redelivery, including deliveries the broker
    /// already pushed that `next()` never returned. Closing twice is a no-op.
    ///
    /// Every delivery is attempted even when one fails; the first error is
    /// returned and deliveries that could not be handed back stay
    /// unsettled, so their `Delivery` can still settle them.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SubscriptionState::Closed {
            return Ok(());
        }
        self.state = SubscriptionState::Closed;

        // a closed channel returns its unacked deliveries on the broker side
        let Some(session) = self.session.upgrade() else {
            lock(&self.in_flight).clear();
            return Ok(());
        };
        if *self.closed.borrow() {
            lock(&self.in_flight).clear();
            return Ok(());
        }

        let returned =
            return_unsettled(&session, &self.consumer_tag, &self.in_flight, &mut self.stream)
                .await?;
        debug!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            returned,
            "Subscription closed"
        );
        Ok(())
    }

    /// The subscription as a `Stream`. It ends after the first error or
    /// when the subscription is closed or cancelled.
    pub fn into_stream(self) -> impl Stream<Item = Result<Delivery>> {
        futures::stream::unfold(self, |mut sub| async move {
            match sub.next().await {
                Ok(Some(delivery)) => Some((Ok(delivery), sub)),
                Ok(None) => None,
                Err(e) => Some((Err(e), sub)),
            }
        })
    }

    async fn accept(&mut self, raw: RawDelivery) -> Result<Delivery> {
        match codec::decode::<Value>(&raw.body) {
            Ok(body) => {
                lock(&self.in_flight).insert(raw.delivery_tag);
                Ok(Delivery::new(
                    raw.delivery_tag,
                    raw.message_id,
                    body,
                    raw.redelivered,
                    self.session.clone(),
                    self.in_flight.clone(),
                ))
            }
            Err(e) => {
                // an undecodable body would otherwise pin a prefetch slot
                warn!(
                    queue = %self.queue,
                    delivery_tag = raw.delivery_tag,
                    message_id = ?raw.message_id,
                    "Rejecting delivery with undecodable body: {e}"
                );
                if let Some(session) = self.session.upgrade() {
                    session.channel.reject(raw.delivery_tag, false).await?;
                }
                Err(e)
            }
        }
    }

    fn lost(&mut self) -> MqError {
        self.state = SubscriptionState::Closed;
        MqError::ConnectionClosed
    }
}

/// Cancels `consumer_tag`, then rejects with requeue every delivery still
/// in `in_flight` and every delivery already buffered in `stream`. A tag
/// leaves `in_flight` only once the broker took it back. Returns how many
/// deliveries were handed back, or the first error.
async fn return_unsettled(
    session: &Session,
    consumer_tag: &str,
    in_flight: &InFlight,
    stream: &mut DeliveryStream,
) -> Result<usize> {
    let mut first_error = None;
    let mut returned = 0;

    let cancelled = match session.channel.cancel(consumer_tag).await {
        Ok(()) => true,
        Err(e) => {
            first_error = Some(e);
            false
        }
    };

    let pending: Vec<u64> = lock(in_flight).iter().copied().collect();
    for tag in pending {
        // settled concurrently through its Delivery
        if !lock(in_flight).remove(&tag) {
            continue;
        }
        match session.channel.reject(tag, true).await {
            Ok(()) => returned += 1,
            Err(e) => {
                lock(in_flight).insert(tag);
                first_error.get_or_insert(e);
            }
        }
    }

    // the buffer only stops growing once the consumer is cancelled
    if cancelled {
        loop {
            // Pending means nothing is buffered; None means the stream ended
            let Some(Some(Ok(raw))) = stream.next().now_or_never() else {
                break;
            };
            match session.channel.reject(raw.delivery_tag, true).await {
                Ok(()) => returned += 1,
                Err(e) => {
                    warn!(
                        delivery_tag = raw.delivery_tag,
                        "Failed to return buffered delivery: {e}"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(returned),
    }
}

/// Resolves once the owning connection closes or its session is dropped.
async fn connection_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .field("prefetch_count", &self.prefetch_count)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.state == SubscriptionState::Closed || *self.closed.borrow() {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let consumer_tag = std::mem::take(&mut self.consumer_tag);
        let in_flight = self.in_flight.clone();
        let mut stream = std::mem::replace(&mut self.stream, futures::stream::empty().boxed());
        handle.spawn(async move {
            match return_unsettled(&session, &consumer_tag, &in_flight, &mut stream).await {
                Ok(returned) => {
                    debug!(consumer_tag = %consumer_tag, returned, "Dropped subscription closed")
                }
                Err(e) => {
                    warn!(consumer_tag = %consumer_tag, "Failed to close dropped subscription: {e}")
                }
            }
        });
    }
}
