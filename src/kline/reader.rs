//! Reader task: bytes off the wire, frames into the dispatcher.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use log::{debug, warn};

use super::events::{emit, Event};
use super::loopback::EchoRing;
use crate::error::LinkError;
use crate::frame::Frame;
use crate::transport::ByteTransport;

/// Assembly buffer size. Worst case in flight is one maximal frame (17
/// bytes) plus one read chunk, so 128 leaves ample slack.
const ASSEMBLY_LEN: usize = 128;

/// Bytes pulled from the transport per poll.
const READ_CHUNK: usize = 16;

/// Pause after a transport fault so a dead port cannot spin the task hot.
const FAULT_BACKOFF: Duration = Duration::from_millis(5);

pub(crate) struct Reader {
    pub(crate) transport: Box<dyn ByteTransport>,
    pub(crate) echo: Arc<EchoRing>,
    pub(crate) incoming: Sender<Frame>,
    pub(crate) events: Sender<Event>,
    pub(crate) quit: Receiver<()>,
}

impl Reader {
    pub(crate) fn run(mut self) {
        let mut buf = [0u8; ASSEMBLY_LEN];
        let mut pos = 0usize;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if matches!(self.quit.try_recv(), Err(TryRecvError::Disconnected)) {
                return;
            }
            let n = match self.transport.read(&mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    emit(&self.events, Event::Fault(LinkError::Transport(e).into()));
                    thread::sleep(FAULT_BACKOFF);
                    continue;
                }
            };
            if n == 0 {
                continue;
            }
            if pos + n > ASSEMBLY_LEN {
                warn!("assembly buffer overflow, dropping {pos} buffered bytes");
                pos = 0;
            }
            buf[pos..pos + n].copy_from_slice(&chunk[..n]);
            pos += n;
            if !self.drain(&mut buf, &mut pos) {
                return;
            }
        }
    }

    /// Decode every complete frame at the front of the assembly buffer.
    ///
    /// On a checksum failure the buffer shifts by a single byte and framing
    /// retries, so a corrupted byte costs one error report instead of
    /// silent desynchronization. Returns `false` once the dispatcher is
    /// gone.
    fn drain(&self, buf: &mut [u8; ASSEMBLY_LEN], pos: &mut usize) -> bool {
        while *pos >= 2 {
            let need = Frame::expected_len(buf[0]);
            if *pos < need {
                return true;
            }
            match Frame::decode(&buf[..need]) {
                Ok(frame) => {
                    let echoed = {
                        let sent = self.echo.take(need);
                        sent.len() == need && sent == &buf[..need]
                    };
                    if echoed {
                        debug!("suppressed echo of {frame}");
                    } else if !self.deliver(frame) {
                        return false;
                    }
                    buf.copy_within(need..*pos, 0);
                    *pos -= need;
                }
                Err(e) => {
                    emit(&self.events, Event::Fault(e.into()));
                    buf.copy_within(1..*pos, 0);
                    *pos -= 1;
                }
            }
        }
        true
    }

    fn deliver(&self, frame: Frame) -> bool {
        match self.incoming.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                debug!("inbound queue full, discarded {frame}");
                emit(&self.events, Event::Fault(LinkError::BufferFull.into()));
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
