//! Writer task: paced frame writes and the loopback feed.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::warn;

use super::events::{emit, Event};
use super::loopback::EchoRing;
use crate::error::LinkError;
use crate::frame::Frame;
use crate::transport::ByteTransport;

pub(crate) struct Writer {
    pub(crate) transport: Box<dyn ByteTransport>,
    pub(crate) echo: Arc<EchoRing>,
    pub(crate) outbound: Receiver<Frame>,
    pub(crate) events: Sender<Event>,
    pub(crate) spacing: Duration,
}

impl Writer {
    /// Drain the outbound queue until every sender is gone.
    ///
    /// Each frame waits out the pacing gap, then goes to the echo ring and
    /// the transport. The ring is fed first: the echo cannot outrun the
    /// record it will be matched against, however fast the transport turns
    /// the bytes around. A write failure leaves an unmatched entry in the
    /// ring, which the reader consumes and discards on the next frame.
    pub(crate) fn run(mut self) {
        let mut next_allowed = Instant::now();
        for frame in self.outbound.iter() {
            let now = Instant::now();
            if now < next_allowed {
                thread::sleep(next_allowed - now);
            }
            let bytes = frame.encode();
            self.echo.push(&bytes);
            match self.transport.write(&bytes) {
                Ok(n) => {
                    if n != bytes.len() {
                        warn!("short write: {n} of {} bytes accepted", bytes.len());
                    }
                    next_allowed = Instant::now() + self.spacing;
                    emit(&self.events, Event::Outgoing(frame));
                }
                Err(e) => {
                    emit(&self.events, Event::Fault(LinkError::Transport(e).into()));
                }
            }
        }
    }
}
