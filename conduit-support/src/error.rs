//! Error taxonomy for the transport.
//!
//! Hot-path control flow (ARQ windows, enqueue results) never uses these
//! types directly — see `conduit::channel::EnqueueResult` and friends for
//! that. These types sit at trust boundaries: wire parsing, crypto,
//! compression and socket I/O, where a caller legitimately wants to know
//! *why* something failed rather than just that it did.

use std::io;
use std::net;

/// Outcome of a fallible network operation that distinguishes "would
/// block, try again" from an actual failure. Mirrors the split the
/// teacher crate draws between `NetworkError::Wait` and
/// `NetworkError::Fatal` so callers can retry non-fatal conditions
/// without matching on `io::ErrorKind` themselves.
pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The operation would have blocked; not a failure, just not ready yet.
    #[error("operation would block")]
    Wait,
    #[error(transparent)]
    Fatal(#[from] WireError),
}

impl NetError {
    #[inline]
    pub fn has_failed(&self) -> bool {
        !matches!(self, NetError::Wait)
    }
}

impl<T> From<io::Error> for NetError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(WireError::Io(kind)),
        }
    }
}

/// Errors raised while decoding a `MessageBuffer` or a framed message off
/// the wire. Every variant here corresponds to a "malformed datagram: drop
/// it, log it" outcome per the transport's error handling design — none of
/// them are fatal to the connection.
#[derive(Debug, thiserror::Error, Eq, PartialEq, Clone, Copy)]
pub enum WireError {
    #[error("read past the end of the buffer")]
    BufferUnderrun,
    #[error("payload length header ({declared}) exceeds bytes available ({available})")]
    LengthMismatch { declared: usize, available: usize },
    #[error("unrecognized wire message type {0}")]
    UnknownMessageType(u8),
    #[error("fragment header is malformed")]
    MalformedFragment,
    #[error("string payload is not valid utf-8")]
    InvalidUtf8,
    #[error("application identifier does not match")]
    AppIdMismatch,
    #[error("io error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for WireError {
    #[inline]
    fn from(err: io::Error) -> Self {
        WireError::Io(err.kind())
    }
}

/// Errors surfaced while establishing or maintaining a connection. These
/// become a `StatusChanged` incoming message carrying the reason string,
/// per the transport's error handling design.
#[derive(Debug, thiserror::Error, Eq, PartialEq, Clone)]
pub enum ConnectError {
    #[error("handshake refused by remote peer")]
    Refused,
    #[error("connection approval denied")]
    ApprovalDenied,
    #[error("protocol version mismatch")]
    VersionMismatch,
    #[error("application identifier mismatch")]
    AppIdMismatch,
    #[error("handshake retries exhausted")]
    HandshakeTimedOut,
    #[error("no traffic observed within the connection timeout")]
    TimedOut,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq, Clone, Copy)]
pub enum CryptoError {
    #[error("decryption failed; datagram is dropped")]
    DecryptFailed,
    #[error("key exchange failed")]
    KeyExchangeFailed,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq, Clone, Copy)]
pub enum CompressionError {
    #[error("compressed payload is malformed")]
    Malformed,
    #[error("underlying codec failed")]
    CodecFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error(transparent)]
    Parse(#[from] net::AddrParseError),
}
