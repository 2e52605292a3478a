//! ISM controller: the periodic state machine over the framing engine.
//!
//! The controller runs one task on a fixed tick. Each tick performs at
//! most one action, in priority order: transmit the desired control state
//! if it changed and the debounce interval has passed, otherwise transmit
//! the keep-alive frame when enabled. Inbound id-14 state vectors are
//! captured, classified into a [`KeyPosition`], and surfaced through the
//! state-change observer. Multi-step transponder reads run over the
//! engine's request/response helper.
//!
//! # Usage
//!
//! ```ignore
//! use ism_kline::{Ism, IsmConfig};
//!
//! let ism = Ism::open("/dev/ttyUSB0")?;
//! ism.toggle_keepalive();
//! ism.set_brightness(31);
//! ism.release_key();
//! let key = ism.read_key_identifier()?;
//! println!("transponder id {:02X?}", key.identifier);
//! ```

mod config;
mod rolling;
mod state;

pub use config::{
    IsmConfig, KeepAlivePayload, MAX_TICK_PERIOD, MIN_TICK_PERIOD, STATE_TX_INTERVAL,
};
pub use rolling::RollingCode;
pub use state::{classify, KeyPosition, StateVector};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use log::{debug, warn};

use crate::error::{Error, IsmError, LinkError};
use crate::frame::{ids, Frame};
use crate::kline::{emit, Engine, FrameSender, LinkEvent, Subscription};
use crate::transport::ByteTransport;

/// RF command channel payloads and timeouts (frame id 2).
mod rf {
    use std::time::Duration;

    pub const FIELD_ON: [u8; 2] = [0x03, 0x1F];
    pub const FIELD_ON_ACK: [u8; 2] = [0x03, 0x13];
    pub const READ_ID: [u8; 1] = [0x04];
    pub const READ_FAILED: [u8; 2] = [0x1F, 0x40];
    pub const FIELD_OFF: [u8; 1] = [0x01];
    pub const STATUS: [u8; 2] = [0x02, 0x06];

    /// Field on/off settle time.
    pub const FIELD_TIMEOUT: Duration = Duration::from_millis(2000);
    /// Identifier read reply window.
    pub const READ_TIMEOUT: Duration = Duration::from_millis(250);
}

/// Highest LED brightness level (5-bit field).
pub const MAX_BRIGHTNESS: u8 = 31;

/// Transponder key identity returned by [`Ism::read_key_identifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Identifier bytes, i.e. the reply payload after the status byte.
    pub identifier: Vec<u8>,
    /// First byte of the reply payload.
    pub status: u8,
    /// The verbatim reply payload, kept for diagnostics.
    pub raw: Vec<u8>,
}

/// Desired control state, transmitted only on change.
struct Desired {
    key_released: bool,
    brightness: u8,
    dirty: bool,
    last_tx: Option<Instant>,
}

type StateHook = Box<dyn Fn([u8; 3]) + Send + Sync>;

struct Shared {
    desired: Mutex<Desired>,
    observed: Mutex<[u8; 3]>,
    keepalive: AtomicBool,
    rolling: Mutex<RollingCode>,
    on_state_change: RwLock<Option<StateHook>>,
}

impl Shared {
    fn desired(&self) -> std::sync::MutexGuard<'_, Desired> {
        self.desired.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observed(&self) -> [u8; 3] {
        *self.observed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The ISM client: public control surface plus the periodic controller
/// task behind it.
pub struct Ism {
    link: Engine,
    shared: Arc<Shared>,
    quit: Option<Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Ism {
    /// Open the default serial transport on `port` with default settings.
    pub fn open(port: &str) -> Result<Self, LinkError> {
        Self::open_with(port, IsmConfig::new())
    }

    /// Open the default serial transport on `port` with `config`.
    pub fn open_with(port: &str, config: IsmConfig) -> Result<Self, LinkError> {
        let transport = crate::transport::SerialTransport::open(port)?;
        Self::with_transport(Box::new(transport), config)
    }

    /// Start the client over an already-open transport.
    pub fn with_transport(
        transport: Box<dyn ByteTransport>,
        config: IsmConfig,
    ) -> Result<Self, LinkError> {
        let link = Engine::with_transport(transport, config.link.clone())?;

        // Init handshake before anything else goes out.
        link.send(Frame::new(ids::INIT, Vec::new()))?;

        let states = link.subscribe(&[ids::STATE])?;
        let shared = Arc::new(Shared {
            desired: Mutex::new(Desired {
                key_released: false,
                brightness: 0,
                dirty: false,
                last_tx: None,
            }),
            observed: Mutex::new([0; 3]),
            keepalive: AtomicBool::new(config.keepalive_enabled),
            rolling: Mutex::new(RollingCode::new()),
            on_state_change: RwLock::new(None),
        });

        let (state_tx, state_rx) = bounded::<[u8; 3]>(64);
        let hook_shared = Arc::clone(&shared);
        let mut tasks = Vec::with_capacity(2);
        tasks.push(
            thread::Builder::new()
                .name("ism-state".into())
                .spawn(move || {
                    for snapshot in state_rx.iter() {
                        if let Some(hook) = hook_shared
                            .on_state_change
                            .read()
                            .unwrap_or_else(|e| e.into_inner())
                            .as_ref()
                        {
                            hook(snapshot);
                        }
                    }
                })
                .expect("spawn state observer task"),
        );

        let (quit_tx, quit_rx) = bounded::<()>(0);
        let controller = Controller {
            shared: Arc::clone(&shared),
            sender: link.frame_sender(),
            events: link.event_sender(),
            states,
            quit: quit_rx,
            ticker: tick(config.tick_period),
            payload_mode: config.keepalive_payload,
            aux_byte: config.aux_byte,
            state_out: state_tx,
        };
        tasks.push(
            thread::Builder::new()
                .name("ism-controller".into())
                .spawn(move || controller.run())
                .expect("spawn controller task"),
        );

        Ok(Self {
            link,
            shared,
            quit: Some(quit_tx),
            tasks,
        })
    }

    /// The framing engine, for raw sends, subscriptions, and the engine
    /// observers.
    #[must_use]
    pub fn link(&self) -> &Engine {
        &self.link
    }

    // -------------------------------------------------------------------------
    // Control operations
    // -------------------------------------------------------------------------

    /// Release the key-lock solenoid.
    pub fn release_key(&self) {
        let mut desired = self.shared.desired();
        desired.key_released = true;
        desired.dirty = true;
    }

    /// Lock the key-lock solenoid.
    pub fn lock_key(&self) {
        let mut desired = self.shared.desired();
        desired.key_released = false;
        desired.dirty = true;
    }

    /// Set illumination brightness, clamped to `0..=31`. A transmission is
    /// scheduled only when the level actually changes.
    pub fn set_brightness(&self, level: u8) {
        let level = level.min(MAX_BRIGHTNESS);
        let mut desired = self.shared.desired();
        if desired.brightness != level {
            desired.brightness = level;
            desired.dirty = true;
        }
    }

    /// Raise brightness one step, saturating at the maximum.
    pub fn inc_brightness(&self) {
        let mut desired = self.shared.desired();
        if desired.brightness < MAX_BRIGHTNESS {
            desired.brightness += 1;
            desired.dirty = true;
        }
    }

    /// Lower brightness one step, saturating at zero.
    pub fn dec_brightness(&self) {
        let mut desired = self.shared.desired();
        if desired.brightness > 0 {
            desired.brightness -= 1;
            desired.dirty = true;
        }
    }

    /// Flip keep-alive transmission, returning the new setting.
    ///
    /// Re-enabling rewinds the rolling code to its primed cursors and
    /// re-sends the init handshake before the first keep-alive goes out.
    pub fn toggle_keepalive(&self) -> bool {
        let enable = !self.shared.keepalive.load(Ordering::Acquire);
        if enable {
            self.shared
                .rolling
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .reset();
            if let Err(e) = self.link.send(Frame::new(ids::INIT, Vec::new())) {
                warn!("handshake on keep-alive re-enable failed: {e}");
            }
        }
        self.shared.keepalive.store(enable, Ordering::Release);
        enable
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Whether the key lock is currently commanded released.
    #[must_use]
    pub fn key_released(&self) -> bool {
        self.shared.desired().key_released
    }

    /// The commanded illumination brightness.
    #[must_use]
    pub fn brightness(&self) -> u8 {
        self.shared.desired().brightness
    }

    /// Whether keep-alive transmission is enabled.
    #[must_use]
    pub fn keepalive_enabled(&self) -> bool {
        self.shared.keepalive.load(Ordering::Acquire)
    }

    /// Classify the latest observed state vector, returning the position
    /// and the raw snapshot it was derived from.
    #[must_use]
    pub fn key_position(&self) -> (KeyPosition, [u8; 3]) {
        let snapshot = self.shared.observed();
        (classify(snapshot), snapshot)
    }

    /// Field-level view of the latest observed state vector.
    #[must_use]
    pub fn state_vector(&self) -> StateVector {
        StateVector::from_bytes(self.shared.observed())
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Read the transponder key identifier.
    ///
    /// Enables the RF field, queries the identifier, and disables the
    /// field again. The final field-off is best effort: its failure is
    /// logged but does not fail an otherwise successful read, and the
    /// next read attempt recovers a field left on.
    pub fn read_key_identifier(&self) -> Result<KeyInfo, IsmError> {
        let ack = self.rf_command(rf::FIELD_TIMEOUT, &rf::FIELD_ON)?;
        if ack.payload() != rf::FIELD_ON_ACK {
            return Err(IsmError::Protocol {
                expected: rf::FIELD_ON_ACK.to_vec(),
                got: ack.payload().to_vec(),
            });
        }

        let result = match self.rf_command(rf::READ_TIMEOUT, &rf::READ_ID) {
            Ok(reply) if reply.payload() == rf::READ_FAILED => Err(IsmError::KeyReadFailed),
            Ok(reply) => match reply.payload().split_first() {
                Some((status, identifier)) => Ok(KeyInfo {
                    identifier: identifier.to_vec(),
                    status: *status,
                    raw: reply.payload().to_vec(),
                }),
                None => Err(IsmError::Protocol {
                    expected: rf::READ_ID.to_vec(),
                    got: Vec::new(),
                }),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = self.rf_command(rf::FIELD_TIMEOUT, &rf::FIELD_OFF) {
            warn!("rf field off failed: {e}");
        }
        result
    }

    /// Query the RF channel status word (reply payload returned verbatim).
    pub fn transponder_status(&self) -> Result<Vec<u8>, IsmError> {
        let reply = self.rf_command(rf::READ_TIMEOUT, &rf::STATUS)?;
        Ok(reply.payload().to_vec())
    }

    fn rf_command(&self, timeout: Duration, payload: &[u8]) -> Result<Frame, IsmError> {
        self.link
            .send_and_recv(timeout, Frame::new(ids::RF, payload), &[ids::RF])
            .map_err(IsmError::from)
    }

    // -------------------------------------------------------------------------
    // Observers and lifecycle
    // -------------------------------------------------------------------------

    /// Install the observer fired (from its own task) whenever the
    /// observed state vector changes.
    pub fn set_on_state_change(&self, hook: impl Fn([u8; 3]) + Send + Sync + 'static) {
        *self
            .shared
            .on_state_change
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    /// Install the observer fired for every inbound frame before fan-out.
    pub fn set_on_incoming(&self, hook: impl Fn(&Frame) + Send + Sync + 'static) {
        self.link.set_on_incoming(hook);
    }

    /// Install the observer fired for every frame written to the wire.
    pub fn set_on_outgoing(&self, hook: impl Fn(&Frame) + Send + Sync + 'static) {
        self.link.set_on_outgoing(hook);
    }

    /// Install the observer fired for every non-fatal error.
    pub fn set_on_error(&self, hook: impl Fn(&Error) + Send + Sync + 'static) {
        self.link.set_on_error(hook);
    }

    /// Stop the controller and shut the engine down. Idempotent; also runs
    /// on drop.
    pub fn close(&mut self) {
        if self.quit.take().is_none() {
            return;
        }
        for task in self.tasks.drain(..) {
            let _ = task.join();
        }
        self.link.close();
    }
}

impl Drop for Ism {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Controller task
// =============================================================================

struct Controller {
    shared: Arc<Shared>,
    sender: FrameSender,
    events: Option<Sender<LinkEvent>>,
    states: Subscription,
    quit: Receiver<()>,
    ticker: Receiver<Instant>,
    payload_mode: KeepAlivePayload,
    aux_byte: u8,
    state_out: Sender<[u8; 3]>,
}

impl Controller {
    fn run(self) {
        loop {
            select! {
                recv(self.quit) -> _ => return,
                recv(self.states.receiver()) -> frame => match frame {
                    Ok(frame) => self.capture(&frame),
                    Err(_) => return,
                },
                recv(self.ticker) -> _ => self.tick(),
            }
        }
    }

    /// One action per tick: a pending control state wins over keep-alive,
    /// but only once the debounce interval since the previous state write
    /// has passed.
    fn tick(&self) {
        let state_frame = {
            let mut desired = self.shared.desired();
            let debounced = desired
                .last_tx
                .map_or(true, |at| at.elapsed() >= STATE_TX_INTERVAL);
            if desired.dirty && debounced {
                desired.dirty = false;
                desired.last_tx = Some(Instant::now());
                Some(Frame::new(
                    ids::STATE,
                    vec![Self::control_byte(&desired), self.aux_byte],
                ))
            } else {
                None
            }
        };

        let frame = if let Some(frame) = state_frame {
            frame
        } else {
            if !self.shared.keepalive.load(Ordering::Acquire) {
                return;
            }
            let payload = match self.payload_mode {
                KeepAlivePayload::RollingCode => self
                    .shared
                    .rolling
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .next_payload(),
                KeepAlivePayload::Zeros => [0u8; 5],
            };
            Frame::new(ids::KEEP_ALIVE, payload.to_vec())
        };

        // A failed tick is reported and swallowed; the next tick retries
        // whatever is still pending.
        if let Err(e) = self.sender.send(frame) {
            if let Some(events) = &self.events {
                emit(events, LinkEvent::Fault(e.into()));
            }
        }
    }

    /// Bit 7 = key released, bits 6..2 = brightness, bits 1..0 reserved
    /// zero.
    fn control_byte(desired: &Desired) -> u8 {
        let mut byte = (desired.brightness << 2) & 0x7C;
        if desired.key_released {
            byte |= 0x80;
        }
        byte
    }

    fn capture(&self, frame: &Frame) {
        let payload = frame.payload();
        let Ok(snapshot) = <[u8; 3]>::try_from(payload) else {
            debug!("state frame with {}-byte payload ignored", payload.len());
            return;
        };
        let changed = {
            let mut observed = self.shared.observed.lock().unwrap_or_else(|e| e.into_inner());
            if *observed == snapshot {
                false
            } else {
                *observed = snapshot;
                true
            }
        };
        if changed && self.state_out.try_send(snapshot).is_err() {
            debug!("state observer queue full, change dropped");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
