//! Error types, organized by domain:
//!
//! - [`FrameError`]: wire-format violations caught by the codec
//! - [`LinkError`]: transport and queueing failures in the framing engine
//! - [`IsmError`]: contract violations in module-level operations
//!
//! The unified [`Error`] wraps all three and is what the error observer
//! receives.

use thiserror::Error;

/// Wire-format violations caught while decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The trailing checksum byte does not match the byte-sum of the frame.
    #[error("checksum mismatch: computed {expected:#04X}, wire carried {actual:#04X} in {bytes:02X?}")]
    Checksum {
        /// Checksum computed over the received header and payload.
        expected: u8,
        /// Checksum byte actually present on the wire.
        actual: u8,
        /// The complete candidate frame, for diagnostics.
        bytes: Vec<u8>,
    },

    /// The slice length disagrees with the header-declared frame length.
    #[error("frame is {actual} bytes but the header declares {expected}")]
    Length {
        /// Length the header nibble declares.
        expected: usize,
        /// Length actually presented.
        actual: usize,
    },

    /// Fewer bytes than the two every frame must carry.
    #[error("frame truncated at {0} byte(s)")]
    Truncated(usize),
}

/// Transport and queueing failures in the framing engine.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The byte transport failed to open, read, or write.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// The outbound queue stayed full for the whole send timeout.
    #[error("send buffer full")]
    BufferFull,

    /// No matching reply arrived before the deadline.
    #[error("timed out waiting for a matching reply")]
    Timeout,

    /// The engine has shut down; its tasks no longer accept work.
    #[error("engine is closed")]
    Closed,
}

/// Contract violations in ISM module-level operations.
#[derive(Debug, Error)]
pub enum IsmError {
    /// A reply arrived but its payload violates the operation's contract.
    #[error("unexpected reply payload {got:02X?} (wanted {expected:02X?})")]
    Protocol {
        /// Payload the operation requires.
        expected: Vec<u8>,
        /// Payload actually received.
        got: Vec<u8>,
    },

    /// The transponder read returned the failure sentinel.
    #[error("transponder key read failed")]
    KeyReadFailed,

    /// The underlying link operation failed.
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Any error the crate can report.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire-format violation.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// Link-level failure.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Operation-level failure.
    #[error(transparent)]
    Ism(#[from] IsmError),
}

/// Result alias defaulting to the unified [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_error_displays_both_sums() {
        let err = FrameError::Checksum {
            expected: 0x38,
            actual: 0x39,
            bytes: vec![0x22, 0x03, 0x13, 0x39],
        };
        let text = err.to_string();
        assert!(text.contains("0x38"));
        assert!(text.contains("0x39"));
    }

    #[test]
    fn link_error_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: LinkError = io.into();
        assert!(matches!(err, LinkError::Transport(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn unified_error_wraps_each_domain() {
        let frame: Error = FrameError::Truncated(1).into();
        let link: Error = LinkError::Timeout.into();
        let ism: Error = IsmError::KeyReadFailed.into();
        assert!(matches!(frame, Error::Frame(_)));
        assert!(matches!(link, Error::Link(_)));
        assert!(matches!(ism, Error::Ism(_)));
    }

    #[test]
    fn ism_error_propagates_link_errors_transparently() {
        let err: IsmError = LinkError::Timeout.into();
        assert_eq!(err.to_string(), LinkError::Timeout.to_string());
    }
}
