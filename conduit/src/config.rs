//! Runtime configuration for a `Peer`, per `spec.md` §6. Shaped after
//! the teacher's `GameConfig` (`game/core/src/config.rs`): plain fields
//! with a `Default` impl and an optional TOML loader via `serdeconv`,
//! plus `validate()` as the ambient addition the teacher's config never
//! needed (`GameConfig` is trusted operator input; a `PeerConfig` can
//! arrive from an untrusted app embedding this crate).

use conduit_support::compression::CompressionType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SEND_WINDOW_SIZE: usize = 64;
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 256;

/// Initial negotiated MTU before any `ExpandMtuRequest` probe succeeds
/// (`spec.md` §3).
pub const DEFAULT_MTU: usize = 1408;

/// Consecutive unanswered MTU probes before a connection stops trying to
/// grow its MTU further (`spec.md` §4.3/§6 `ExpandMTUFailAttempts`).
pub const DEFAULT_EXPAND_MTU_FAIL_ATTEMPTS: u32 = 5;

/// How an oversize payload on a channel that never fragments on the
/// wire (`spec.md` §4.4.6: fragmentation rides only on
/// `ReliableOrdered`) is handled instead. Named "unreliable" because
/// the three non-ordered reliable families don't escape this either —
/// a best-effort reassembly with no per-chunk resend offers them no
/// real reliability gain over the channels the policy is named for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnreliableOversizePolicy {
    /// Send the oversize payload as a single datagram over the
    /// negotiated MTU anyway and let the network path deal with it
    /// (fragment at the IP layer, or drop). The default: simplest, and
    /// keeps this transport's own framing out of a path it can't make
    /// reliable regardless.
    #[default]
    IgnoreMtu,
    /// Split across multiple datagrams the same way `ReliableOrdered`
    /// does, but with no resend: missing chunks are never reclaimed, so
    /// the whole message is lost if even one piece doesn't arrive.
    NormalFragmentation,
    /// Drop the payload outright rather than send something that won't
    /// fit the MTU.
    DropAboveMtu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Maximum number of in-flight (unacknowledged) messages per
    /// reliable channel before `enqueue` starts reporting `WindowFull`.
    pub send_window_size: usize,

    /// Codec applied to outgoing payloads at or above
    /// `compression_threshold`; `None` disables compression entirely.
    pub compression: Option<CompressionType>,
    pub compression_threshold: usize,

    /// How long to wait for a handshake response before retrying, and
    /// how many retries to allow before giving up.
    pub handshake_timeout: Duration,
    pub max_handshake_attempts: u32,

    /// No traffic observed for this long and a connection is declared
    /// dead, per `spec.md` §4.3.
    pub idle_timeout: Duration,

    /// How often to emit a `Ping` on an otherwise quiet connection to
    /// keep `idle_timeout` from firing and to keep RTT samples fresh.
    pub ping_interval: Duration,

    /// Floor under the RTT-derived resend delay, so a very low-latency
    /// link still gives a packet a fair chance to be acknowledged
    /// before it's resent.
    pub min_resend_delay: Duration,

    /// The third Open Question from `spec.md` §9: whether
    /// `ReliableUnordered` acks ride only on piggybacked traffic rather
    /// than ever being sent standalone. Never affects
    /// `UnreliableSequenced`, which has no acks to suppress.
    pub suppress_unreliable_unordered_acks: bool,

    /// What to do with an oversize payload on any channel other than
    /// `ReliableOrdered`, which is the only family that fragments on
    /// the wire.
    pub unreliable_oversize_policy: UnreliableOversizePolicy,

    /// Negotiated MTU a connection starts at before any `ExpandMtuRequest`
    /// probe succeeds (`spec.md` §3/§6 `MaximumTransmissionUnit`).
    pub maximum_transmission_unit: usize,

    /// Consecutive unanswered MTU probes before a connection freezes and
    /// stops trying to grow its MTU further (`spec.md` §4.3/§6
    /// `ExpandMTUFailAttempts`).
    pub expand_mtu_fail_attempts: u32,

    /// String every `ConnectRequest` carries and every receiver checks
    /// before accepting a connection (`spec.md` §6 `ApplicationIdentifier`
    /// / §7 app-id mismatch handling). Connections whose peer presents a
    /// different string are dropped, never approved.
    pub app_identifier: String,

    /// Whether payloads are encrypted at all (`spec.md` §4.8
    /// `EnableEncryption`). `negotiate_encryption` and `encryption_key`
    /// are both ignored when this is `false`.
    pub enable_encryption: bool,

    /// When `enable_encryption` is set: `true` derives the session key
    /// through a Diffie-Hellman exchange (`Connected -> ConnectedSecured`),
    /// `false` installs `encryption_key` immediately on `Connected`
    /// (`spec.md` §4.8 `NegotiateEncryption`).
    pub negotiate_encryption: bool,

    /// The fixed shared key used when `enable_encryption` is set and
    /// `negotiate_encryption` is not. Required in that combination;
    /// ignored otherwise.
    pub encryption_key: Option<[u8; 32]>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            send_window_size: DEFAULT_SEND_WINDOW_SIZE,
            compression: None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            handshake_timeout: Duration::from_secs(3),
            max_handshake_attempts: 5,
            idle_timeout: Duration::from_secs(45),
            ping_interval: Duration::from_secs(25),
            min_resend_delay: Duration::from_millis(100),
            suppress_unreliable_unordered_acks: false,
            unreliable_oversize_policy: UnreliableOversizePolicy::default(),
            maximum_transmission_unit: DEFAULT_MTU,
            expand_mtu_fail_attempts: DEFAULT_EXPAND_MTU_FAIL_ATTEMPTS,
            app_identifier: "conduit".to_string(),
            enable_encryption: false,
            negotiate_encryption: false,
            encryption_key: None,
        }
    }
}

impl PeerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        serdeconv::from_toml_file(path).expect("error loading peer configuration file")
    }

    /// Rejects configurations that would violate an invariant the
    /// transport assumes elsewhere — e.g. a zero-size send window would
    /// make `EnqueueResult::WindowFull` permanent.
    pub fn validate(&self) -> Result<(), String> {
        if self.send_window_size == 0 {
            return Err("send_window_size must be at least 1".into());
        }
        if self.max_handshake_attempts == 0 {
            return Err("max_handshake_attempts must be at least 1".into());
        }
        if self.idle_timeout <= self.ping_interval {
            return Err("idle_timeout must be greater than ping_interval".into());
        }
        if self.app_identifier.is_empty() {
            return Err("app_identifier must not be empty".into());
        }
        if self.negotiate_encryption && !self.enable_encryption {
            return Err("negotiate_encryption requires enable_encryption".into());
        }
        if self.enable_encryption && !self.negotiate_encryption && self.encryption_key.is_none() {
            return Err("a fixed-key configuration requires encryption_key".into());
        }
        Ok(())
    }
}
