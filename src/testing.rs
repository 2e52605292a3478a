//! Test utilities: a scriptable in-memory transport.
//!
//! `MockTransport` stands in for the serial port in host tests. Inbound
//! bytes are queued explicitly or scripted as replies to expected writes,
//! and every write is captured with a timestamp so pacing and ordering
//! can be asserted. With echo enabled, written bytes are also fed back
//! into the read side, which is exactly how the shared K-line behaves.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::transport::ByteTransport;

/// Route `log` output to the test harness. Safe to call from every test;
/// only the first call wins.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct Inner {
    inbound: Mutex<VecDeque<u8>>,
    writes: Mutex<Vec<(Instant, Vec<u8>)>>,
    replies: Mutex<VecDeque<(Vec<u8>, Vec<u8>)>>,
    echo: bool,
}

/// An in-memory [`ByteTransport`] shared between the test body and the
/// engine's reader/writer tasks.
pub(crate) struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    /// A transport that reads back every byte it writes, like the real
    /// shared wire.
    pub(crate) fn with_echo() -> Self {
        Self {
            inner: Arc::new(Inner {
                echo: true,
                ..Inner::default()
            }),
        }
    }

    /// Another handle onto the same wire.
    pub(crate) fn handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Queue bytes for the host to read.
    pub(crate) fn push_inbound(&self, bytes: &[u8]) {
        self.inner.inbound.lock().unwrap().extend(bytes);
    }

    /// Script a reply: when the host writes exactly `request`, `reply` is
    /// queued on the read side. Expectations are matched in FIFO order.
    pub(crate) fn expect_reply(&self, request: &[u8], reply: &[u8]) {
        self.inner
            .replies
            .lock()
            .unwrap()
            .push_back((request.to_vec(), reply.to_vec()));
    }

    /// Every write call, in order.
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.inner
            .writes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// The instant of every write call, in order.
    pub(crate) fn write_instants(&self) -> Vec<Instant> {
        self.inner
            .writes
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    /// Every write decoded as a frame.
    pub(crate) fn written_frames(&self) -> Vec<Frame> {
        self.writes()
            .iter()
            .map(|bytes| Frame::decode(bytes).expect("host wrote a malformed frame"))
            .collect()
    }
}

impl ByteTransport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = {
            let mut inbound = self.inner.inbound.lock().unwrap();
            let n = buf.len().min(inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap();
            }
            n
        };
        if n == 0 {
            // Emulate the serial poll interval so the reader does not spin.
            thread::sleep(Duration::from_millis(1));
        }
        Ok(n)
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.inner
            .writes
            .lock()
            .unwrap()
            .push((Instant::now(), bytes.to_vec()));
        if self.inner.echo {
            self.inner.inbound.lock().unwrap().extend(bytes);
        }
        let reply = {
            let mut replies = self.inner.replies.lock().unwrap();
            match replies.front() {
                Some((request, _)) if request == bytes => replies.pop_front().map(|(_, r)| r),
                _ => None,
            }
        };
        if let Some(reply) = reply {
            self.inner.inbound.lock().unwrap().extend(&reply);
        }
        Ok(bytes.len())
    }

    fn try_clone(&self) -> std::io::Result<Box<dyn ByteTransport>> {
        Ok(Box::new(self.handle()))
    }
}
