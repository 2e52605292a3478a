//! Host-side diagnostic and control library for an automotive Ignition
//! Switch Module (ISM) on a K-line serial bus.
//!
//! The module reports a compact state vector (key insertion, position,
//! flags) and accepts commands controlling a key-lock solenoid and an
//! illumination LED, plus transponder-key reads over an RF field. The bus
//! is byte-oriented at 9600 baud with odd parity, and every exchange is a
//! short length-prefixed frame with a byte-sum checksum.
//!
//! # Architecture
//!
//! The crate is organized into three layers:
//!
//! 1. **Frame codec** ([`frame`]): encode/decode one frame
//! 2. **Framing engine** ([`kline`]): the full-duplex protocol runtime -
//!    reader, paced writer, echo suppression, subscription dispatcher, and
//!    request/response correlation
//! 3. **ISM controller** ([`ism`]): the periodic state machine - keep-alive
//!    rolling code, debounced control-state writes, key-position
//!    classification, RF transactions
//!
//! The physical link is abstracted behind [`transport::ByteTransport`];
//! the default binding is a serial port, and a PassThru-style diagnostic
//! interface speaking the same bytes can be substituted.
//!
//! # Example
//!
//! ```ignore
//! use ism_kline::{Ism, IsmConfig, KeyPosition};
//!
//! let ism = Ism::open("/dev/ttyUSB0")?;
//! ism.set_on_state_change(|snapshot| println!("state {snapshot:02X?}"));
//! ism.toggle_keepalive();
//!
//! loop {
//!     let (position, _) = ism.key_position();
//!     if position == KeyPosition::Inserted {
//!         let key = ism.read_key_identifier()?;
//!         println!("transponder {:02X?}", key.identifier);
//!         ism.release_key();
//!         ism.set_brightness(31);
//!         break;
//!     }
//! }
//! ```
//!
//! # Concurrency
//!
//! Opening a client starts the engine's reader, writer, dispatcher, and
//! observer-pump tasks plus the controller ticker. Observer hooks run on
//! dedicated tasks and can never stall the bus; a slow subscriber only
//! degrades itself. `close()` (also run on drop) signals every task and
//! joins them.

pub mod error;
pub mod frame;
pub mod ism;
pub mod kline;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, FrameError, IsmError, LinkError, Result};
pub use frame::Frame;
pub use ism::{
    Ism, IsmConfig, KeepAlivePayload, KeyInfo, KeyPosition, RollingCode, StateVector,
    MAX_BRIGHTNESS,
};
pub use kline::{Engine, LinkConfig, Subscription};
pub use transport::{ByteTransport, SerialTransport};
