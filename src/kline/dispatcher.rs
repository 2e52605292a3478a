//! Dispatcher task: fans inbound frames out to subscribers.

use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender};
use log::debug;

use super::events::{emit, Event};
use super::subscriber::{SubscriberInner, MAX_DROPS};
use crate::frame::Frame;

pub(crate) struct Dispatcher {
    pub(crate) incoming: Receiver<Frame>,
    pub(crate) register: Receiver<Arc<SubscriberInner>>,
    pub(crate) unregister: Receiver<Arc<SubscriberInner>>,
    pub(crate) unregister_tx: Sender<Arc<SubscriberInner>>,
    pub(crate) quit: Receiver<()>,
    pub(crate) events: Sender<Event>,
    pub(crate) subscribers: Vec<Arc<SubscriberInner>>,
}

impl Dispatcher {
    /// Select over the four inputs until quit fires or the reader is gone.
    pub(crate) fn run(mut self) {
        loop {
            select! {
                recv(self.quit) -> _ => return,
                recv(self.register) -> sub => match sub {
                    Ok(sub) => self.subscribers.push(sub),
                    Err(_) => return,
                },
                recv(self.unregister) -> sub => {
                    if let Ok(sub) = sub {
                        self.remove(&sub);
                    }
                }
                recv(self.incoming) -> frame => match frame {
                    Ok(frame) => self.fanout(frame),
                    Err(_) => return,
                },
            }
        }
    }

    /// Deliver one frame to every live subscriber whose filter admits it.
    ///
    /// Delivery is non-blocking per subscriber: a full queue increments
    /// that subscriber's drop counter and the bus moves on. A subscriber
    /// that has dropped more than [`MAX_DROPS`] frames is evicted.
    fn fanout(&self, frame: Frame) {
        emit(&self.events, Event::Incoming(frame.clone()));
        for sub in &self.subscribers {
            if sub.is_cancelled() {
                self.queue_unregister(sub);
                continue;
            }
            let filter = sub.filter();
            if filter.is_empty() {
                sub.deliver(frame.clone());
                continue;
            }
            for id in filter {
                if sub.dropped() > MAX_DROPS {
                    debug!("evicting subscriber after {} dropped frames", sub.dropped());
                    self.queue_unregister(sub);
                    break;
                }
                if id == frame.id() {
                    sub.deliver(frame.clone());
                    break;
                }
            }
        }
    }

    /// Queue a record for removal on a later loop turn. At most one intake
    /// entry is pending per record; if the intake is momentarily full the
    /// claim is released and the next fan-out encounter retries.
    fn queue_unregister(&self, sub: &Arc<SubscriberInner>) {
        if !sub.mark_evicting() {
            return;
        }
        if self.unregister_tx.try_send(Arc::clone(sub)).is_err() {
            sub.clear_evicting();
            debug!("unregister intake full, retrying on next fan-out");
        }
    }

    fn remove(&mut self, sub: &Arc<SubscriberInner>) {
        self.subscribers.retain(|s| !Arc::ptr_eq(s, sub));
    }
}
