//! Observer hooks and the event pump that fires them.
//!
//! Hooks run on a dedicated task so a slow observer can never stall the
//! reader, writer, or dispatcher. Unset hooks cost one channel send; error
//! events additionally land in the log whether or not a hook is installed.

use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{trace, warn};

use crate::error::Error;
use crate::frame::Frame;

type FrameHook = Box<dyn Fn(&Frame) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&Error) + Send + Sync>;

/// Something worth telling the embedding application about.
pub(crate) enum Event {
    /// A frame survived echo suppression and is about to fan out.
    Incoming(Frame),
    /// A frame was written to the wire.
    Outgoing(Frame),
    /// A task hit a non-fatal error and kept going.
    Fault(Error),
}

/// The settable observer slots shared by the engine and its tasks.
#[derive(Default)]
pub(crate) struct HookSet {
    incoming: RwLock<Option<FrameHook>>,
    outgoing: RwLock<Option<FrameHook>>,
    error: RwLock<Option<ErrorHook>>,
}

impl HookSet {
    pub(crate) fn set_incoming(&self, hook: FrameHook) {
        *self.incoming.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub(crate) fn set_outgoing(&self, hook: FrameHook) {
        *self.outgoing.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub(crate) fn set_error(&self, hook: ErrorHook) {
        *self.error.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    fn fire(&self, event: &Event) {
        match event {
            Event::Incoming(frame) => {
                if let Some(hook) = self
                    .incoming
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                {
                    hook(frame);
                }
            }
            Event::Outgoing(frame) => {
                if let Some(hook) = self
                    .outgoing
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                {
                    hook(frame);
                }
            }
            Event::Fault(err) => {
                warn!("k-line: {err}");
                if let Some(hook) = self
                    .error
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                {
                    hook(err);
                }
            }
        }
    }
}

/// Queue an event without blocking the calling task. Observation is
/// best-effort: if the pump has fallen behind the event is dropped.
pub(crate) fn emit(events: &Sender<Event>, event: Event) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(_)) => trace!("observer queue full, event dropped"),
    }
}

/// Spawn the pump task. It drains until every event sender is gone.
pub(crate) fn spawn_pump(rx: Receiver<Event>, hooks: Arc<HookSet>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("kline-events".into())
        .spawn(move || {
            for event in rx.iter() {
                hooks.fire(&event);
            }
        })
        .expect("spawn event pump")
}
