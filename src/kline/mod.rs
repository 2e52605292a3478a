//! K-line framing engine.
//!
//! The engine owns the byte transport and runs four tasks around it:
//!
//! - **reader**: assembles frames out of the byte stream, resynchronizes
//!   on checksum failures, and discards echoes of the host's own writes
//! - **writer**: drains the outbound queue with a minimum spacing between
//!   writes and feeds the echo ring
//! - **dispatcher**: fans surviving inbound frames out to subscribers
//!   with identifier filtering and per-subscriber backpressure
//! - **event pump**: fires the observer hooks away from the hot paths
//!
//! # Usage
//!
//! ```ignore
//! use ism_kline::kline::Engine;
//!
//! let engine = Engine::open("/dev/ttyUSB0")?;
//! let states = engine.subscribe(&[14])?;
//! engine.send(Frame::new(0, Vec::new()))?;
//! let frame = states.recv_timeout(Duration::from_millis(500))?;
//! ```

mod config;
mod dispatcher;
mod events;
mod loopback;
mod reader;
mod subscriber;
mod writer;

pub use config::{LinkConfig, DEFAULT_WRITE_SPACING, MAX_WRITE_SPACING, MIN_WRITE_SPACING};
pub use subscriber::Subscription;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender, SendTimeoutError, TrySendError};

use crate::error::{Error, LinkError};
use crate::frame::Frame;
use crate::transport::{ByteTransport, SerialTransport};

use dispatcher::Dispatcher;
use events::{spawn_pump, Event, HookSet};
use loopback::EchoRing;
use reader::Reader;
use subscriber::SubscriberInner;
use writer::Writer;

/// Depth of the register and unregister intakes.
const INTAKE_DEPTH: usize = 10;

/// Depth of the observer event queue.
const EVENT_DEPTH: usize = 256;

/// The asynchronous full-duplex protocol runtime over one byte transport.
pub struct Engine {
    outbound: Option<Sender<Frame>>,
    register: Option<Sender<Arc<SubscriberInner>>>,
    unregister: Sender<Arc<SubscriberInner>>,
    events: Option<Sender<Event>>,
    quit: Option<Sender<()>>,
    hooks: Arc<HookSet>,
    tasks: Vec<JoinHandle<()>>,
    send_timeout: Duration,
    subscriber_depth: usize,
}

impl Engine {
    /// Open the default serial transport on `port` and start the engine
    /// with default settings.
    pub fn open(port: &str) -> Result<Self, LinkError> {
        Self::with_transport(Box::new(SerialTransport::open(port)?), LinkConfig::default())
    }

    /// Start the engine over an already-open transport.
    pub fn with_transport(
        transport: Box<dyn ByteTransport>,
        config: LinkConfig,
    ) -> Result<Self, LinkError> {
        let reader_transport = transport.try_clone().map_err(LinkError::Transport)?;

        let echo = Arc::new(EchoRing::new(config.echo_capacity));
        let (outbound_tx, outbound_rx) = bounded(config.outbound_depth);
        let (incoming_tx, incoming_rx) = bounded(config.inbound_depth);
        let (register_tx, register_rx) = bounded(INTAKE_DEPTH);
        let (unregister_tx, unregister_rx) = bounded(INTAKE_DEPTH);
        let (events_tx, events_rx) = bounded(EVENT_DEPTH);
        let (quit_tx, quit_rx) = bounded::<()>(0);

        let hooks = Arc::new(HookSet::default());
        let mut tasks = Vec::with_capacity(4);
        tasks.push(spawn_pump(events_rx, Arc::clone(&hooks)));

        let reader = Reader {
            transport: reader_transport,
            echo: Arc::clone(&echo),
            incoming: incoming_tx,
            events: events_tx.clone(),
            quit: quit_rx.clone(),
        };
        tasks.push(
            thread::Builder::new()
                .name("kline-reader".into())
                .spawn(move || reader.run())
                .expect("spawn reader task"),
        );

        let writer = Writer {
            transport,
            echo,
            outbound: outbound_rx,
            events: events_tx.clone(),
            spacing: config.write_spacing,
        };
        tasks.push(
            thread::Builder::new()
                .name("kline-writer".into())
                .spawn(move || writer.run())
                .expect("spawn writer task"),
        );

        let dispatcher = Dispatcher {
            incoming: incoming_rx,
            register: register_rx,
            unregister: unregister_rx,
            unregister_tx: unregister_tx.clone(),
            quit: quit_rx,
            events: events_tx.clone(),
            subscribers: Vec::new(),
        };
        tasks.push(
            thread::Builder::new()
                .name("kline-dispatcher".into())
                .spawn(move || dispatcher.run())
                .expect("spawn dispatcher task"),
        );

        Ok(Self {
            outbound: Some(outbound_tx),
            register: Some(register_tx),
            unregister: unregister_tx,
            events: Some(events_tx),
            quit: Some(quit_tx),
            hooks,
            tasks,
            send_timeout: config.send_timeout,
            subscriber_depth: config.subscriber_depth,
        })
    }

    /// Enqueue a frame for transmission.
    ///
    /// Fails with [`LinkError::BufferFull`] when the outbound queue stays
    /// full for the configured send timeout.
    pub fn send(&self, frame: Frame) -> Result<(), LinkError> {
        let Some(outbound) = &self.outbound else {
            return Err(LinkError::Closed);
        };
        match outbound.send_timeout(frame, self.send_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(LinkError::BufferFull),
            Err(SendTimeoutError::Disconnected(_)) => Err(LinkError::Closed),
        }
    }

    /// Register a subscriber for frames whose identifier is in `ids`.
    /// An empty slice subscribes to every frame.
    ///
    /// # Panics
    ///
    /// Panics if the register intake is full, which means subscriptions
    /// are being created faster than the dispatcher can ever admit them.
    /// Losing one silently would be worse.
    pub fn subscribe(&self, ids: &[u8]) -> Result<Subscription, LinkError> {
        self.subscribe_inner(ids, None)
    }

    fn subscribe_inner(
        &self,
        ids: &[u8],
        deadline: Option<Instant>,
    ) -> Result<Subscription, LinkError> {
        let Some(register) = &self.register else {
            return Err(LinkError::Closed);
        };
        let (tx, rx) = bounded(self.subscriber_depth);
        let inner = Arc::new(SubscriberInner::new(tx, ids, deadline));
        match register.try_send(Arc::clone(&inner)) {
            Ok(()) => Ok(Subscription::new(rx, inner, self.unregister.clone())),
            Err(TrySendError::Full(_)) => panic!("register intake full"),
            Err(TrySendError::Disconnected(_)) => Err(LinkError::Closed),
        }
    }

    /// Send `frame` and wait for the first inbound frame whose identifier
    /// is in `ids`, for at most `timeout`.
    ///
    /// The temporary subscriber is always unregistered on the way out. No
    /// retry is attempted; a timeout is reported even if the send itself
    /// succeeded.
    pub fn send_and_recv(
        &self,
        timeout: Duration,
        frame: Frame,
        ids: &[u8],
    ) -> Result<Frame, LinkError> {
        let deadline = Instant::now() + timeout;
        let sub = self.subscribe_inner(ids, Some(deadline))?;
        self.send(frame)?;
        sub.recv_deadline(deadline)
    }

    /// Install the observer fired for every inbound frame before fan-out.
    pub fn set_on_incoming(&self, hook: impl Fn(&Frame) + Send + Sync + 'static) {
        self.hooks.set_incoming(Box::new(hook));
    }

    /// Install the observer fired for every frame written to the wire.
    pub fn set_on_outgoing(&self, hook: impl Fn(&Frame) + Send + Sync + 'static) {
        self.hooks.set_outgoing(Box::new(hook));
    }

    /// Install the observer fired for every non-fatal engine error.
    pub fn set_on_error(&self, hook: impl Fn(&Error) + Send + Sync + 'static) {
        self.hooks.set_error(Box::new(hook));
    }

    /// A cloneable outbound handle for internal tasks.
    pub(crate) fn frame_sender(&self) -> FrameSender {
        FrameSender {
            tx: self.outbound.clone(),
            timeout: self.send_timeout,
        }
    }

    /// A cloneable event handle for internal tasks.
    pub(crate) fn event_sender(&self) -> Option<Sender<Event>> {
        self.events.clone()
    }

    /// Shut the engine down and join its tasks.
    ///
    /// Idempotent; also runs on drop. Tasks notice the quit signal within
    /// one poll interval, so this returns well inside the 200 ms budget.
    pub fn close(&mut self) {
        if self.quit.take().is_none() {
            return;
        }
        self.outbound = None;
        self.register = None;
        self.events = None;
        for task in self.tasks.drain(..) {
            let _ = task.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Outbound handle used by the controller task; same semantics as
/// [`Engine::send`].
#[derive(Clone)]
pub(crate) struct FrameSender {
    tx: Option<Sender<Frame>>,
    timeout: Duration,
}

impl FrameSender {
    pub(crate) fn send(&self, frame: Frame) -> Result<(), LinkError> {
        let Some(tx) = &self.tx else {
            return Err(LinkError::Closed);
        };
        match tx.send_timeout(frame, self.timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(LinkError::BufferFull),
            Err(SendTimeoutError::Disconnected(_)) => Err(LinkError::Closed),
        }
    }
}

pub(crate) use events::{emit, Event as LinkEvent};

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ids;
    use crate::testing::MockTransport;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn engine(mock: &MockTransport) -> Engine {
        crate::testing::init_logging();
        Engine::with_transport(Box::new(mock.handle()), LinkConfig::default()).unwrap()
    }

    fn settle() {
        thread::sleep(Duration::from_millis(80));
    }

    #[test]
    fn frames_reach_a_matching_subscriber_in_order() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        let sub = eng.subscribe(&[ids::STATE]).unwrap();
        settle();

        mock.push_inbound(&Frame::new(ids::STATE, vec![1]).encode());
        mock.push_inbound(&Frame::new(ids::RF, vec![9]).encode());
        mock.push_inbound(&Frame::new(ids::STATE, vec![2]).encode());

        let first = sub.recv_timeout(Duration::from_millis(500)).unwrap();
        let second = sub.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(first.payload(), &[1]);
        assert_eq!(second.payload(), &[2]);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn empty_filter_matches_every_identifier() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        let sub = eng.subscribe(&[]).unwrap();
        settle();

        mock.push_inbound(&Frame::new(3, vec![0xAA]).encode());
        mock.push_inbound(&Frame::new(7, vec![0xBB]).encode());

        assert_eq!(
            sub.recv_timeout(Duration::from_millis(500)).unwrap().id(),
            3
        );
        assert_eq!(
            sub.recv_timeout(Duration::from_millis(500)).unwrap().id(),
            7
        );
    }

    #[test]
    fn slow_subscriber_degrades_only_itself() {
        let mock = MockTransport::new();
        let cfg = LinkConfig {
            subscriber_depth: 2,
            ..LinkConfig::default()
        };
        let eng = Engine::with_transport(Box::new(mock.handle()), cfg).unwrap();
        let slow = eng.subscribe(&[ids::STATE]).unwrap();
        let healthy = eng.subscribe(&[ids::STATE]).unwrap();
        settle();

        // Overwhelm the depth-2 queue of `slow` while draining `healthy`
        // frame by frame; the healthy subscriber must see every frame, in
        // order.
        for i in 0..20u8 {
            mock.push_inbound(&Frame::new(ids::STATE, vec![i]).encode());
            let frame = healthy.recv_timeout(Duration::from_millis(500)).unwrap();
            assert_eq!(frame.payload(), &[i]);
        }
        assert!(slow.dropped() > 0);
    }

    #[test]
    fn filter_update_applies_to_subsequent_frames() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        let sub = eng.subscribe(&[ids::STATE]).unwrap();
        settle();

        mock.push_inbound(&Frame::new(ids::RF, vec![1]).encode());
        assert!(sub.recv_timeout(Duration::from_millis(150)).is_err());

        sub.set_filter(&[ids::RF]);
        mock.push_inbound(&Frame::new(ids::RF, vec![2]).encode());
        let frame = sub.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(frame.payload(), &[2]);
    }

    #[test]
    fn reader_resynchronizes_after_a_garbage_byte() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        eng.set_on_error(move |e| {
            if matches!(e, Error::Frame(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let sub = eng.subscribe(&[ids::KEEP_ALIVE]).unwrap();
        settle();

        // 0x50 declares a two-byte frame, so the mismatch is detected as
        // soon as the real header byte follows it.
        let mut stream = vec![0x50];
        stream.extend_from_slice(&Frame::new(ids::KEEP_ALIVE, vec![1, 2, 3, 4, 5]).encode());
        // Arbitrary chunk sizes across the garbage/frame boundary.
        mock.push_inbound(&stream[..3]);
        thread::sleep(Duration::from_millis(20));
        mock.push_inbound(&stream[3..]);

        let frame = sub.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5]);
        assert!(errors.load(Ordering::SeqCst) >= 1);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn own_transmissions_are_suppressed() {
        let mock = MockTransport::with_echo();
        let eng = engine(&mock);
        let sub = eng.subscribe(&[]).unwrap();
        settle();

        eng.send(Frame::new(ids::KEEP_ALIVE, vec![1, 2, 3, 4, 5]))
            .unwrap();
        settle();

        // The echoed copy of our own frame must not be delivered.
        assert!(sub.try_recv().is_none());

        // A genuine frame following the echo still comes through.
        mock.push_inbound(&Frame::new(ids::STATE, vec![0x99, 0x60, 0x6B]).encode());
        let frame = sub.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(frame.id(), ids::STATE);
    }

    #[test]
    fn writes_are_paced_at_least_the_spacing_apart() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        for _ in 0..3 {
            eng.send(Frame::new(ids::KEEP_ALIVE, vec![0; 5])).unwrap();
        }
        thread::sleep(Duration::from_millis(200));

        let instants = mock.write_instants();
        assert_eq!(instants.len(), 3);
        for pair in instants.windows(2) {
            assert!(pair[1] - pair[0] >= DEFAULT_WRITE_SPACING);
        }
    }

    #[test]
    fn send_fails_with_buffer_full_when_the_queue_stays_full() {
        let mock = MockTransport::new();
        let cfg = LinkConfig {
            outbound_depth: 1,
            ..LinkConfig::default()
        }
        .with_write_spacing(Duration::from_millis(100))
        .with_send_timeout(Duration::from_millis(20));
        let eng = Engine::with_transport(Box::new(mock.handle()), cfg).unwrap();

        let mut outcome = Vec::new();
        for _ in 0..5 {
            outcome.push(eng.send(Frame::new(1, Vec::new())));
        }
        assert!(outcome.iter().any(|r| matches!(r, Err(LinkError::BufferFull))));
    }

    #[test]
    fn send_and_recv_returns_the_matching_reply() {
        let mock = MockTransport::new();
        let request = Frame::new(ids::RF, vec![0x03, 0x1F]);
        mock.expect_reply(&request.encode(), &Frame::new(ids::RF, vec![0x03, 0x13]).encode());
        let eng = engine(&mock);
        settle();

        let reply = eng
            .send_and_recv(Duration::from_secs(2), request, &[ids::RF])
            .unwrap();
        assert_eq!(reply.payload(), &[0x03, 0x13]);
    }

    #[test]
    fn send_and_recv_times_out_without_a_reply() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        settle();

        let started = Instant::now();
        let result = eng.send_and_recv(
            Duration::from_millis(100),
            Frame::new(ids::RF, vec![0x04]),
            &[ids::RF],
        );
        assert!(matches!(result, Err(LinkError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn send_and_recv_ignores_non_matching_identifiers() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        settle();

        mock.push_inbound(&Frame::new(ids::STATE, vec![1, 2, 3]).encode());
        let result = eng.send_and_recv(
            Duration::from_millis(100),
            Frame::new(ids::RF, vec![0x04]),
            &[ids::RF],
        );
        assert!(matches!(result, Err(LinkError::Timeout)));
    }

    #[test]
    fn incoming_observer_sees_every_inbound_frame() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        eng.set_on_incoming(move |frame| log.lock().unwrap().push(frame.id()));
        settle();

        mock.push_inbound(&Frame::new(5, vec![0x01]).encode());
        settle();
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    #[test]
    fn outgoing_observer_sees_written_frames() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        eng.set_on_outgoing(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        eng.send(Frame::new(0, Vec::new())).unwrap();
        settle();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent_and_rejects_further_work() {
        let mock = MockTransport::new();
        let mut eng = engine(&mock);
        eng.close();
        eng.close();
        assert!(matches!(
            eng.send(Frame::new(0, Vec::new())),
            Err(LinkError::Closed)
        ));
        assert!(matches!(eng.subscribe(&[]), Err(LinkError::Closed)));
    }

    #[test]
    fn close_returns_promptly() {
        let mock = MockTransport::new();
        let mut eng = engine(&mock);
        settle();
        let started = Instant::now();
        eng.close();
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
