//! Subscriber records and the caller-facing subscription handle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::LinkError;
use crate::frame::Frame;

/// Fan-out drops tolerated before the dispatcher evicts a subscriber.
pub(crate) const MAX_DROPS: u32 = 10;

/// Dispatcher-side record of one subscriber.
///
/// Shared between the dispatcher (which delivers into `tx` and mutates the
/// drop counter) and the owning [`Subscription`] (which cancels and updates
/// the filter).
pub(crate) struct SubscriberInner {
    tx: Sender<Frame>,
    filter: RwLock<Vec<u8>>,
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    dropped: AtomicU32,
    evicting: AtomicBool,
}

impl SubscriberInner {
    pub(crate) fn new(tx: Sender<Frame>, filter: &[u8], deadline: Option<Instant>) -> Self {
        Self {
            tx,
            filter: RwLock::new(filter.to_vec()),
            cancelled: AtomicBool::new(false),
            deadline,
            dropped: AtomicU32::new(0),
            evicting: AtomicBool::new(false),
        }
    }

    /// True once the owner cancelled the subscription or its deadline
    /// passed. The dispatcher removes such subscribers lazily on the next
    /// fan-out that encounters them.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Snapshot of the identifier filter; empty means match-all.
    pub(crate) fn filter(&self) -> Vec<u8> {
        self.filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_filter(&self, ids: &[u8]) {
        *self.filter.write().unwrap_or_else(|e| e.into_inner()) = ids.to_vec();
    }

    /// Non-blocking delivery; a full queue counts against the subscriber,
    /// not the bus.
    pub(crate) fn deliver(&self, frame: Frame) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(frame) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Claim the right to queue this record on the unregister intake.
    /// Returns `false` when an eviction is already pending.
    pub(crate) fn mark_evicting(&self) -> bool {
        !self.evicting.swap(true, Ordering::AcqRel)
    }

    /// Give the claim back after a failed intake send so a later fan-out
    /// can retry.
    pub(crate) fn clear_evicting(&self) {
        self.evicting.store(false, Ordering::Release);
    }
}

/// A registered consumer of inbound frames.
///
/// Created by [`Engine::subscribe`](crate::kline::Engine::subscribe).
/// Frames matching the identifier filter are queued here in arrival order,
/// up to the queue bound. Dropping the handle cancels the registration.
pub struct Subscription {
    rx: Receiver<Frame>,
    inner: Arc<SubscriberInner>,
    unregister: Sender<Arc<SubscriberInner>>,
}

impl Subscription {
    pub(crate) fn new(
        rx: Receiver<Frame>,
        inner: Arc<SubscriberInner>,
        unregister: Sender<Arc<SubscriberInner>>,
    ) -> Self {
        Self {
            rx,
            inner,
            unregister,
        }
    }

    /// Wait for the next matching frame.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Frame, LinkError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(LinkError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::Closed),
        }
    }

    /// Wait for the next matching frame until `deadline`.
    pub fn recv_deadline(&self, deadline: Instant) -> Result<Frame, LinkError> {
        match self.rx.recv_deadline(deadline) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(LinkError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::Closed),
        }
    }

    /// Take a queued frame without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Replace the identifier filter; takes effect on the next fan-out.
    /// An empty filter matches every frame.
    pub fn set_filter(&self, ids: &[u8]) {
        self.inner.set_filter(ids);
    }

    /// How many frames the dispatcher has dropped because this
    /// subscriber's queue was full.
    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.inner.dropped()
    }

    /// The underlying channel, for use in `select!` loops.
    #[must_use]
    pub(crate) fn receiver(&self) -> &Receiver<Frame> {
        &self.rx
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.cancel();
        // Best effort: if the intake is full the dispatcher still evicts
        // the cancelled record on its next fan-out pass.
        let _ = self.unregister.try_send(Arc::clone(&self.inner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn subscriber(depth: usize, filter: &[u8]) -> (Arc<SubscriberInner>, Receiver<Frame>) {
        let (tx, rx) = bounded(depth);
        (Arc::new(SubscriberInner::new(tx, filter, None)), rx)
    }

    #[test]
    fn deliver_counts_drops_once_queue_is_full() {
        let (sub, rx) = subscriber(2, &[]);
        for _ in 0..5 {
            sub.deliver(Frame::new(1, Vec::new()));
        }
        assert_eq!(sub.dropped(), 3);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn deadline_in_the_past_reads_as_cancelled() {
        let (tx, _rx) = bounded(1);
        let sub = SubscriberInner::new(tx, &[], Some(Instant::now() - Duration::from_millis(1)));
        assert!(sub.is_cancelled());
    }

    #[test]
    fn cancel_is_sticky() {
        let (sub, _rx) = subscriber(1, &[]);
        assert!(!sub.is_cancelled());
        sub.cancel();
        assert!(sub.is_cancelled());
    }

    #[test]
    fn filter_updates_are_visible() {
        let (sub, _rx) = subscriber(1, &[14]);
        assert_eq!(sub.filter(), vec![14]);
        sub.set_filter(&[2, 10]);
        assert_eq!(sub.filter(), vec![2, 10]);
    }

    #[test]
    fn dropping_subscription_queues_unregister() {
        let (sub, rx) = subscriber(1, &[]);
        let (unreg_tx, unreg_rx) = bounded(4);
        let handle = Subscription::new(rx, Arc::clone(&sub), unreg_tx);
        drop(handle);
        assert!(sub.is_cancelled());
        assert!(unreg_rx.try_recv().is_ok());
    }
}
