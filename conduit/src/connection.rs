//! The per-peer connection state machine, per `spec.md` §4.3: handshake
//! progression, ack aggregation, ping/pong liveness, RTT smoothing, MTU
//! expansion and (optional) compression/encryption. Pure logic — no
//! socket I/O — so it can be driven and tested without a real network,
//! the same separation the teacher draws between `net::channel::Channel`
//! (protocol state) and `net::endpoint::Endpoint` (the socket pump).

use crate::buffer::MessageBuffer;
use crate::channel::{
    AckTracker, EnqueueResult, OrderedReceiveBuffer, ReliableSendWindow, SequencedDeliveryGate, SequencedFilter,
};
use crate::config::{PeerConfig, UnreliableOversizePolicy};
use crate::fragment::{self, ReassemblyBuffer};
use crate::sequence::{self, SequenceNumber};
use crate::wire::{self, FragmentHeader, Header, MessageType, CHANNEL_COUNT};
use conduit_support::compression::Compressor;
use conduit_support::crypto::{ChaChaEncryption, KeyExchange, MessageEncryption, X25519Exchange};
use conduit_support::error::WireError;
use conduit_support::time::{Clock, RttEstimator};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Liveness window named in `spec.md` §9 Open Question 2: a connection
/// that has sent an ack within this long is considered alive even if the
/// aggregation timer hasn't fired again, so housekeeping doesn't flag it
/// as silent while an ack is merely pending flush.
pub const ACK_LIVENESS_WINDOW: Duration = Duration::from_secs(2);

const MAX_MTU: usize = 4096;
const MTU_PROBE_STEP: usize = 256;

/// Lifecycle of a single peer-to-peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound `ConnectRequest`s have been sent; `attempts` is the retry
    /// count so far.
    Connecting { attempts: u32 },
    /// Inbound `ConnectRequest` is awaiting the application's approval
    /// decision (see `spec.md` §4.3 connection approval callback).
    AwaitingApproval,
    Connected,
    /// Key exchange has completed; payloads are now encrypted.
    ConnectedSecured,
    Disconnecting,
    Disconnected,
}

/// A fully decoded, reassembled message ready for the application.
pub struct Delivery {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

/// Read-only diagnostics counters exposed to the application, per
/// `spec.md`'s statistics-on-`Connection` addition. Never consulted for
/// control decisions internally beyond `rtt`/`mtu` themselves, which this
/// mirrors rather than owns.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Inferred from resend attempts, not a direct measurement — the
    /// transport never learns a datagram was lost, only that it wasn't
    /// acknowledged in time.
    pub packets_lost: u64,
    pub rtt: Duration,
    pub mtu: usize,
}

/// Non-data events the application needs to observe, mirrored onto the
/// same incoming queue as `Delivery` per `spec.md` §4.7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChanged {
    Connected,
    Disconnected(String),
    ApprovalRequested,
}

struct ChannelRecvState {
    unreliable_sequenced: Vec<SequencedFilter>,
    reliable_sequenced_ack: Vec<AckTracker>,
    reliable_sequenced_gate: Vec<SequencedDeliveryGate>,
    reliable_ordered_ack: Vec<AckTracker>,
    reliable_ordered_buffer: Vec<OrderedReceiveBuffer>,
    reliable_unordered_ack: AckTracker,
}

impl ChannelRecvState {
    fn new() -> Self {
        ChannelRecvState {
            unreliable_sequenced: (0..CHANNEL_COUNT).map(|_| SequencedFilter::new()).collect(),
            reliable_sequenced_ack: (0..CHANNEL_COUNT).map(|_| AckTracker::new()).collect(),
            reliable_sequenced_gate: (0..CHANNEL_COUNT).map(|_| SequencedDeliveryGate::new()).collect(),
            reliable_ordered_ack: (0..CHANNEL_COUNT).map(|_| AckTracker::new()).collect(),
            reliable_ordered_buffer: (0..CHANNEL_COUNT).map(|_| OrderedReceiveBuffer::new()).collect(),
            reliable_unordered_ack: AckTracker::new(),
        }
    }
}

struct ChannelSendState {
    unreliable_sequenced_seq: Vec<SequenceNumber>,
    reliable_sequenced: Vec<ReliableSendWindow>,
    reliable_ordered: Vec<ReliableSendWindow>,
    reliable_unordered: ReliableSendWindow,
}

impl ChannelSendState {
    fn new(window_size: usize) -> Self {
        ChannelSendState {
            unreliable_sequenced_seq: vec![0; CHANNEL_COUNT as usize],
            reliable_sequenced: (0..CHANNEL_COUNT).map(|_| ReliableSendWindow::new(window_size)).collect(),
            reliable_ordered: (0..CHANNEL_COUNT).map(|_| ReliableSendWindow::new(window_size)).collect(),
            reliable_unordered: ReliableSendWindow::new(window_size),
        }
    }
}

/// Pending acknowledgement aggregated for flush on the next tick, per
/// `spec.md` §4.4.5's ack-aggregation requirement.
struct PendingAck {
    family: AckFamily,
    base: SequenceNumber,
    mask: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckFamily {
    ReliableUnordered,
    ReliableSequenced(u8),
    ReliableOrdered(u8),
}

impl AckFamily {
    fn message_type(self) -> MessageType {
        match self {
            AckFamily::ReliableUnordered => MessageType::ReliableUnordered,
            AckFamily::ReliableSequenced(ch) => MessageType::ReliableSequenced(ch),
            AckFamily::ReliableOrdered(ch) => MessageType::ReliableOrdered(ch),
        }
    }

    fn from_message_type(mt: MessageType) -> Option<Self> {
        match mt {
            MessageType::ReliableUnordered => Some(AckFamily::ReliableUnordered),
            MessageType::ReliableSequenced(ch) => Some(AckFamily::ReliableSequenced(ch)),
            MessageType::ReliableOrdered(ch) => Some(AckFamily::ReliableOrdered(ch)),
            _ => None,
        }
    }
}

pub struct Connection {
    pub remote: SocketAddr,
    state: ConnectionState,
    last_ingress: Clock,
    last_egress: Clock,
    last_ack_sent: Option<Clock>,
    last_ping_sent: Option<Clock>,
    connect_attempt_at: Clock,

    rtt: RttEstimator,
    mtu: usize,
    mtu_probe: Option<usize>,
    mtu_frozen: bool,
    mtu_probe_fail_attempts: u32,
    expand_mtu_fail_attempts: u32,

    send: ChannelSendState,
    recv: ChannelRecvState,
    reassembly: ReassemblyBuffer,
    next_fragment_group: u32,
    unreliable_oversize_policy: UnreliableOversizePolicy,

    pending_acks: Vec<PendingAck>,
    /// Whether `ReliableUnordered` acks get piggybacked only, never sent
    /// standalone — the third Open Question from `spec.md` §9. This
    /// never applies to `UnreliableSequenced`, which has no acks at all.
    suppress_unreliable_unordered_acks: bool,

    encryption: Option<Box<dyn MessageEncryption>>,
    compressor: Option<Box<dyn Compressor>>,
    compression_threshold: usize,
    consecutive_crypto_failures: u32,

    /// Whether this end of the connection is the one that sent the
    /// initial `ConnectRequest`. Only the initiator starts a negotiated
    /// key exchange; the other side replies once it sees the request.
    is_initiator: bool,
    app_identifier: String,
    enable_encryption: bool,
    negotiate_encryption: bool,
    encryption_key: Option<[u8; 32]>,
    /// Our half of an in-flight Diffie-Hellman exchange, held until the
    /// peer's `KeyExchangeResponse` arrives.
    pending_key_exchange: Option<X25519Exchange>,

    outbox: Vec<Vec<u8>>,
    deliveries: Vec<Delivery>,
    status_events: Vec<StatusChanged>,

    handshake_timeout: Duration,
    max_handshake_attempts: u32,
    idle_timeout: Duration,
    ping_interval: Duration,
    resend_floor: Duration,

    /// Next nonce this connection will use to encrypt an outgoing
    /// payload. Carried on the wire ahead of the ciphertext, since the
    /// receiver cannot assume datagrams arrive in the order they were
    /// encrypted.
    next_encrypt_nonce: u64,

    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    packets_lost: u64,
}

impl Connection {
    pub fn new_outgoing(remote: SocketAddr, now: Clock, config: &PeerConfig) -> Self {
        let mut conn = Self::new_common(remote, now, config);
        conn.is_initiator = true;
        conn.state = ConnectionState::Connecting { attempts: 0 };
        conn.send_connect_request();
        conn
    }

    pub fn new_incoming(remote: SocketAddr, now: Clock, config: &PeerConfig) -> Self {
        Self::new_common(remote, now, config)
    }

    fn new_common(remote: SocketAddr, now: Clock, config: &PeerConfig) -> Self {
        Connection {
            remote,
            state: ConnectionState::Disconnected,
            last_ingress: now,
            last_egress: now,
            last_ack_sent: None,
            last_ping_sent: None,
            connect_attempt_at: now,
            rtt: RttEstimator::new(),
            mtu: config.maximum_transmission_unit,
            mtu_probe: None,
            mtu_frozen: false,
            mtu_probe_fail_attempts: 0,
            expand_mtu_fail_attempts: config.expand_mtu_fail_attempts,
            send: ChannelSendState::new(config.send_window_size),
            recv: ChannelRecvState::new(),
            reassembly: ReassemblyBuffer::new(),
            next_fragment_group: 0,
            unreliable_oversize_policy: config.unreliable_oversize_policy,
            pending_acks: Vec::new(),
            suppress_unreliable_unordered_acks: config.suppress_unreliable_unordered_acks,
            encryption: None,
            compressor: config.compression.map(|kind| kind.compressor()),
            compression_threshold: config.compression_threshold,
            consecutive_crypto_failures: 0,
            is_initiator: false,
            app_identifier: config.app_identifier.clone(),
            enable_encryption: config.enable_encryption,
            negotiate_encryption: config.negotiate_encryption,
            encryption_key: config.encryption_key,
            pending_key_exchange: None,
            outbox: Vec::new(),
            deliveries: Vec::new(),
            status_events: Vec::new(),
            handshake_timeout: config.handshake_timeout,
            max_handshake_attempts: config.max_handshake_attempts,
            idle_timeout: config.idle_timeout,
            ping_interval: config.ping_interval,
            resend_floor: config.min_resend_delay,
            next_encrypt_nonce: 0,
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            packets_lost: 0,
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            packets_lost: self.packets_lost,
            rtt: self.rtt.get(),
            mtu: self.mtu,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Installs a ready-made key, e.g. one an application derived itself
    /// outside the negotiated or fixed-key paths below.
    pub fn set_encryption(&mut self, encryption: Box<dyn MessageEncryption>) {
        self.encryption = Some(encryption);
        self.state = ConnectionState::ConnectedSecured;
    }

    fn install_encryption(&mut self, key: &[u8; 32]) {
        let mut cipher = ChaChaEncryption::new();
        cipher.set_key(key);
        self.encryption = Some(Box::new(cipher));
        self.state = ConnectionState::ConnectedSecured;
    }

    /// Starts securing the connection once it reaches `Connected`, per
    /// `spec.md` §4.8: a fixed key is installed immediately, a negotiated
    /// one is initiated only by whichever side sent the `ConnectRequest`.
    fn maybe_start_encryption(&mut self) {
        if !self.enable_encryption {
            return;
        }
        if !self.negotiate_encryption {
            if let Some(key) = self.encryption_key {
                self.install_encryption(&key);
            }
            return;
        }
        if self.is_initiator {
            let (secret, public) = X25519Exchange::generate();
            self.pending_key_exchange = Some(secret);
            self.send_control(MessageType::KeyExchangeRequest, |buf| {
                buf.write_bytes(&public);
            });
        }
    }

    fn handle_key_exchange_request(&mut self, buf: &mut MessageBuffer) {
        let Some(their_public) = read_public_key(buf) else {
            debug!(remote = %self.remote, "dropping malformed key exchange request");
            return;
        };
        let (secret, public) = X25519Exchange::generate();
        let shared = secret.shared_secret(&their_public);
        self.install_encryption(&shared);
        self.send_control(MessageType::KeyExchangeResponse, |buf| {
            buf.write_bytes(&public);
        });
    }

    fn handle_key_exchange_response(&mut self, buf: &mut MessageBuffer) {
        let Some(their_public) = read_public_key(buf) else {
            debug!(remote = %self.remote, "dropping malformed key exchange response");
            return;
        };
        let Some(secret) = self.pending_key_exchange.take() else {
            debug!(remote = %self.remote, "key exchange response with no pending request");
            return;
        };
        let shared = secret.shared_secret(&their_public);
        self.install_encryption(&shared);
    }

    pub fn approve(&mut self) {
        if self.state == ConnectionState::AwaitingApproval {
            self.state = ConnectionState::Connected;
            self.status_events.push(StatusChanged::Connected);
            self.send_control(MessageType::ConnectResponse, |_| {});
            self.maybe_start_encryption();
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    pub fn drain_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }

    pub fn drain_status_events(&mut self) -> Vec<StatusChanged> {
        std::mem::take(&mut self.status_events)
    }

    // ---- outgoing --------------------------------------------------

    /// Queues `payload` for delivery under `message_type`, fragmenting
    /// it first if it doesn't fit the current MTU.
    pub fn enqueue(&mut self, message_type: MessageType, payload: &[u8]) {
        let wire_payload = self.prepare_payload(payload);
        let max_fragment = self.mtu.saturating_sub(wire::HEADER_OVERHEAD_BYTES + wire::FRAGMENT_HEADER_BUDGET_BYTES);

        let pieces = match fragment::split(&wire_payload, max_fragment) {
            None => {
                self.enqueue_whole(message_type, wire_payload);
                return;
            }
            Some(pieces) => pieces,
        };

        // Fragmentation only ever rides on ReliableOrdered (`spec.md`
        // §4.4.6); every other channel falls back to the configured
        // oversize policy instead of silently fragmenting.
        if !matches!(message_type, MessageType::ReliableOrdered(_)) {
            match self.unreliable_oversize_policy {
                UnreliableOversizePolicy::IgnoreMtu => {
                    self.enqueue_whole(message_type, wire_payload);
                    return;
                }
                UnreliableOversizePolicy::DropAboveMtu => {
                    warn!(remote = %self.remote, ?message_type, "oversize payload dropped (DropAboveMtu policy)");
                    return;
                }
                UnreliableOversizePolicy::NormalFragmentation => {}
            }
        }

        // group 0 is reserved to mean "not fragmented" on the wire.
        self.next_fragment_group = self.next_fragment_group.wrapping_add(1).max(1);
        let group = self.next_fragment_group;
        let count = pieces.len() as u16;

        for (index, piece) in pieces.into_iter().enumerate() {
            let mut framed = Vec::with_capacity(piece.len() + 8);
            {
                let mut header_buf = MessageBuffer::new();
                wire::write_fragment_header(&mut header_buf, FragmentHeader { group, index: index as u16, count });
                framed.extend_from_slice(header_buf.as_bytes());
            }
            framed.extend_from_slice(piece);
            self.enqueue_fragment_piece(message_type, framed);
        }
    }

    /// Compresses (when configured) and encrypts (when negotiated)
    /// `payload`. When a compressor is configured, the first byte of the
    /// result records whether this particular payload was actually
    /// compressed, since payloads below `compression_threshold` are sent
    /// as-is — `unwrap_payload` reads that flag rather than guessing.
    fn prepare_payload(&mut self, payload: &[u8]) -> Vec<u8> {
        let compressed = match &self.compressor {
            Some(codec) => {
                let should_compress = payload.len() >= self.compression_threshold;
                let body = if should_compress { codec.compress(payload) } else { payload.to_vec() };
                let mut framed = Vec::with_capacity(1 + body.len());
                framed.push(should_compress as u8);
                framed.extend_from_slice(&body);
                framed
            }
            None => payload.to_vec(),
        };

        match &mut self.encryption {
            Some(enc) => {
                let nonce = self.next_encrypt_nonce;
                self.next_encrypt_nonce = self.next_encrypt_nonce.wrapping_add(1);
                let ciphertext = enc.encrypt(nonce, &compressed);

                let mut framed = Vec::with_capacity(8 + ciphertext.len());
                framed.extend_from_slice(&nonce.to_le_bytes());
                framed.extend_from_slice(&ciphertext);
                framed
            }
            None => compressed,
        }
    }

    fn enqueue_whole(&mut self, message_type: MessageType, payload: Vec<u8>) {
        let seq = self.assign_sequence(message_type, &payload, false);
        self.frame_and_send(message_type, false, seq, &payload);
    }

    /// Like `enqueue_whole`, but marks the header's fragment bit so the
    /// receiver knows `payload` begins with a `FragmentHeader` it must
    /// parse before the actual chunk bytes. The same flag is recorded in
    /// the reliable send window, since a resend reconstructs the header
    /// from scratch and needs it too.
    fn enqueue_fragment_piece(&mut self, message_type: MessageType, payload: Vec<u8>) {
        let seq = self.assign_sequence(message_type, &payload, true);
        self.frame_and_send(message_type, true, seq, &payload);
    }

    fn assign_sequence(&mut self, message_type: MessageType, payload: &[u8], fragmented: bool) -> SequenceNumber {
        match message_type {
            MessageType::Unreliable => 0,
            MessageType::UnreliableSequenced(ch) => {
                let slot = &mut self.send.unreliable_sequenced_seq[ch as usize];
                let seq = *slot;
                *slot = sequence::next(*slot);
                seq
            }
            MessageType::ReliableUnordered => {
                match self.send.reliable_unordered.enqueue(payload.to_vec(), fragmented) {
                    EnqueueResult::Enqueued(seq) => seq,
                    EnqueueResult::WindowFull => {
                        warn!(remote = %self.remote, "reliable unordered send window full, message dropped");
                        return 0;
                    }
                }
            }
            MessageType::ReliableSequenced(ch) => {
                match self.send.reliable_sequenced[ch as usize].enqueue(payload.to_vec(), fragmented) {
                    EnqueueResult::Enqueued(seq) => seq,
                    EnqueueResult::WindowFull => {
                        warn!(remote = %self.remote, channel = ch, "reliable sequenced send window full");
                        0
                    }
                }
            }
            MessageType::ReliableOrdered(ch) => {
                match self.send.reliable_ordered[ch as usize].enqueue(payload.to_vec(), fragmented) {
                    EnqueueResult::Enqueued(seq) => seq,
                    EnqueueResult::WindowFull => {
                        warn!(remote = %self.remote, channel = ch, "reliable ordered send window full");
                        0
                    }
                }
            }
            _ => 0,
        }
    }

    fn frame_and_send(&mut self, message_type: MessageType, fragmented: bool, seq: SequenceNumber, payload: &[u8]) {
        let mut buf = MessageBuffer::new();
        let offset = wire::write_header(&mut buf, message_type, fragmented, seq);
        buf.write_bytes(payload);
        wire::finish_header(&mut buf, offset, (payload.len() * 8) as u16);
        let datagram = buf.as_bytes().to_vec();
        self.packets_sent += 1;
        self.bytes_sent += datagram.len() as u64;
        self.outbox.push(datagram);
        self.last_egress = Clock::now();
    }

    fn send_control(&mut self, message_type: MessageType, build: impl FnOnce(&mut MessageBuffer)) {
        let mut payload_buf = MessageBuffer::new();
        build(&mut payload_buf);
        let payload = payload_buf.as_bytes().to_vec();
        self.frame_and_send(message_type, false, 0, &payload);
    }

    /// Sends a `ConnectRequest` carrying this peer's app identifier
    /// (`spec.md` §6), used both for the initial handshake attempt and
    /// every retry.
    fn send_connect_request(&mut self) {
        let app_id = self.app_identifier.clone();
        self.send_control(MessageType::ConnectRequest, move |buf| {
            buf.write_string(&app_id);
        });
    }

    fn queue_ack(&mut self, family: AckFamily, base: SequenceNumber, mask: u64) {
        if family == AckFamily::ReliableUnordered && self.suppress_unreliable_unordered_acks {
            return;
        }
        self.pending_acks.push(PendingAck { family, base, mask });
    }

    // ---- incoming ----------------------------------------------------

    /// Parses and processes one received datagram, returning any fully
    /// reassembled application payloads it completed. Malformed
    /// datagrams are logged and dropped, never propagated as an error —
    /// per the transport's "drop it, log it" wire error taxonomy.
    pub fn receive_datagram(&mut self, raw: &[u8], now: Clock) {
        self.last_ingress = now;
        self.packets_received += 1;
        self.bytes_received += raw.len() as u64;

        let mut buf = MessageBuffer::from_bytes(raw.to_vec(), raw.len() * 8);
        let header = match wire::read_header(&mut buf) {
            Ok(header) => header,
            Err(err) => {
                debug!(remote = %self.remote, error = %err, "dropping malformed datagram");
                return;
            }
        };

        match header.message_type {
            MessageType::Ping => self.send_control(MessageType::Pong, |_| {}),
            MessageType::Pong => {
                let sample = now.elapsed_since(self.last_ping_sent.unwrap_or(now));
                self.rtt.sample(sample);
            }
            MessageType::ConnectRequest => {
                match buf.read_string() {
                    Ok(app_id) if app_id == self.app_identifier => {
                        if self.state == ConnectionState::Disconnected {
                            self.state = ConnectionState::AwaitingApproval;
                            self.status_events.push(StatusChanged::ApprovalRequested);
                        }
                    }
                    Ok(app_id) => {
                        debug!(
                            remote = %self.remote,
                            app_id,
                            expected = %self.app_identifier,
                            "dropping connect request: app-id mismatch"
                        );
                    }
                    Err(err) => {
                        debug!(remote = %self.remote, error = %err, "dropping malformed connect request");
                    }
                }
            }
            MessageType::ConnectResponse | MessageType::ConnectionEstablished => {
                if matches!(self.state, ConnectionState::Connecting { .. }) {
                    self.state = ConnectionState::Connected;
                    self.status_events.push(StatusChanged::Connected);
                    self.maybe_start_encryption();
                }
            }
            MessageType::Disconnect => {
                self.state = ConnectionState::Disconnected;
                self.status_events.push(StatusChanged::Disconnected("remote closed connection".into()));
            }
            MessageType::Acknowledge => self.handle_ack(&mut buf),
            MessageType::ExpandMtuRequest => self.send_control(MessageType::ExpandMtuSuccess, |_| {}),
            MessageType::ExpandMtuSuccess => {
                if let Some(probe) = self.mtu_probe.take() {
                    self.mtu = probe.min(MAX_MTU);
                    self.mtu_probe_fail_attempts = 0;
                }
            }
            MessageType::KeyExchangeRequest => {
                if self.enable_encryption {
                    self.handle_key_exchange_request(&mut buf);
                } else {
                    debug!(remote = %self.remote, "key exchange request ignored, encryption disabled locally");
                }
            }
            MessageType::KeyExchangeResponse => {
                if self.enable_encryption {
                    self.handle_key_exchange_response(&mut buf);
                }
            }
            data_type => self.handle_data(header, data_type, &mut buf, now),
        }
    }

    fn handle_ack(&mut self, buf: &mut MessageBuffer) {
        let Ok(family_byte) = buf.read_u8() else { return };
        let Ok(family_type) = MessageType::from_byte(family_byte) else { return };
        let Some(family) = AckFamily::from_message_type(family_type) else { return };
        let (Ok(base), Ok(mask)) = (buf.read_bits(15).map(|v| v as SequenceNumber), buf.read_u64()) else {
            return;
        };

        match family {
            AckFamily::ReliableUnordered => self.send.reliable_unordered.apply_ack(base, mask),
            AckFamily::ReliableSequenced(ch) => self.send.reliable_sequenced[ch as usize].apply_ack(base, mask),
            AckFamily::ReliableOrdered(ch) => self.send.reliable_ordered[ch as usize].apply_ack(base, mask),
        }
    }

    fn handle_data(&mut self, header: Header, message_type: MessageType, buf: &mut MessageBuffer, now: Clock) {
        let byte_len = (header.payload_bits as usize + 7) / 8;
        let Ok(raw_payload) = buf.read_bytes(byte_len) else {
            debug!(remote = %self.remote, "payload shorter than declared header length");
            return;
        };
        let raw_payload = raw_payload.to_vec();

        // Fragmentation only ever rides on reliable-ordered channels (per
        // `spec.md` §4.4.6: "other delivery methods never fragment"), so
        // that's the only family where a chunk's delivery and its
        // reassembly must be kept in separate steps: the ordering buffer
        // releases chunks in sequence, and only the chunk that completes
        // its group produces something to hand to the application. Every
        // other family reassembles (best-effort, no per-chunk resend)
        // directly off of whatever arrives.
        if let MessageType::ReliableOrdered(ch) = message_type {
            self.handle_reliable_ordered_chunk(ch, header.sequence, header.fragmented, raw_payload);
            return;
        }

        let assembled = if header.fragmented {
            let mut fragment_buf = MessageBuffer::from_bytes(raw_payload.clone(), raw_payload.len() * 8);
            let Ok(fragment_header) = wire::read_fragment_header(&mut fragment_buf) else {
                debug!(remote = %self.remote, "malformed fragment header");
                return;
            };
            let Ok(remaining) = fragment_buf.remaining_bytes_aligned() else { return };
            let Ok(piece) = fragment_buf.read_bytes(remaining) else { return };

            match self.reassembly.insert(fragment_header, piece.to_vec()) {
                Some(full) => full,
                None => return,
            }
        } else {
            raw_payload
        };

        let Some(plain) = self.unwrap_payload(&assembled) else {
            return;
        };

        self.deliver(message_type, header.sequence, plain, now);
    }

    /// Admits one reliable-ordered chunk to the channel's ARQ: acks and
    /// gap-fills it like any other reliable-ordered arrival, tagging it
    /// with whether it's a fragment piece so reassembly can be deferred
    /// until the gap-filler actually releases it in sequence. Releasing a
    /// chunk out of fragment order would hand reassembly a piece before
    /// an earlier piece of the same group, which the group's bitmap
    /// handles fine — but it's the channel's own sequencing, not fragment
    /// index order, that reassembly must follow here, since chunks can be
    /// interleaved with whatever else is in flight on the same channel.
    fn handle_reliable_ordered_chunk(&mut self, ch: u8, seq: SequenceNumber, fragmented: bool, raw_payload: Vec<u8>) {
        let is_new = self.recv.reliable_ordered_ack[ch as usize].record(seq);
        let (base, mask) = self.recv.reliable_ordered_ack[ch as usize].ack_fields();
        self.queue_ack(AckFamily::ReliableOrdered(ch), base, mask);
        if !is_new {
            return;
        }

        let mut tagged = Vec::with_capacity(raw_payload.len() + 1);
        tagged.push(fragmented as u8);
        tagged.extend_from_slice(&raw_payload);

        let message_type = MessageType::ReliableOrdered(ch);
        for released in self.recv.reliable_ordered_buffer[ch as usize].insert(seq, tagged) {
            let Some((&flag, body)) = released.split_first() else { continue };
            self.assemble_and_deliver_ordered(message_type, flag != 0, body.to_vec());
        }
    }

    fn assemble_and_deliver_ordered(&mut self, message_type: MessageType, is_fragment: bool, body: Vec<u8>) {
        let assembled = if is_fragment {
            let mut fragment_buf = MessageBuffer::from_bytes(body.clone(), body.len() * 8);
            let Ok(fragment_header) = wire::read_fragment_header(&mut fragment_buf) else {
                debug!(remote = %self.remote, "malformed fragment header");
                return;
            };
            let Ok(remaining) = fragment_buf.remaining_bytes_aligned() else { return };
            let Ok(piece) = fragment_buf.read_bytes(remaining) else { return };

            match self.reassembly.insert(fragment_header, piece.to_vec()) {
                Some(full) => full,
                None => return,
            }
        } else {
            body
        };

        let Some(plain) = self.unwrap_payload(&assembled) else { return };
        self.push_delivery(message_type, plain);
    }

    fn unwrap_payload(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let decrypted = match &mut self.encryption {
            Some(enc) => {
                if data.len() < 8 {
                    debug!(remote = %self.remote, "encrypted payload missing nonce prefix");
                    return None;
                }
                let (nonce_bytes, ciphertext) = data.split_at(8);
                let nonce = u64::from_le_bytes(nonce_bytes.try_into().unwrap());

                match enc.decrypt(nonce, ciphertext) {
                    Ok(plain) => {
                        self.consecutive_crypto_failures = 0;
                        plain
                    }
                    Err(_) => {
                        self.consecutive_crypto_failures += 1;
                        if self.consecutive_crypto_failures >= 3 {
                            warn!(remote = %self.remote, "disconnecting after repeated decryption failures");
                            self.state = ConnectionState::Disconnected;
                            self.status_events
                                .push(StatusChanged::Disconnected("repeated decryption failures".into()));
                        }
                        return None;
                    }
                }
            }
            None => data.to_vec(),
        };

        match &self.compressor {
            Some(codec) => {
                let Some((&was_compressed, body)) = decrypted.split_first() else {
                    debug!(remote = %self.remote, "payload missing compression flag byte");
                    return None;
                };
                if was_compressed != 0 {
                    match codec.decompress(body) {
                        Ok(plain) => Some(plain),
                        Err(err) => {
                            debug!(remote = %self.remote, error = %err, "dropping payload with malformed compressed body");
                            None
                        }
                    }
                } else {
                    Some(body.to_vec())
                }
            }
            None => Some(decrypted),
        }
    }

    fn deliver(&mut self, message_type: MessageType, seq: SequenceNumber, payload: Vec<u8>, now: Clock) {
        match message_type {
            MessageType::Unreliable => self.push_delivery(message_type, payload),
            MessageType::UnreliableSequenced(ch) => {
                if self.recv.unreliable_sequenced[ch as usize].accept(seq) {
                    self.push_delivery(message_type, payload);
                }
            }
            MessageType::ReliableUnordered => {
                let is_new = self.recv.reliable_unordered_ack.record(seq);
                let (base, mask) = self.recv.reliable_unordered_ack.ack_fields();
                self.queue_ack(AckFamily::ReliableUnordered, base, mask);
                if is_new {
                    self.push_delivery(message_type, payload);
                }
            }
            MessageType::ReliableSequenced(ch) => {
                let is_new = self.recv.reliable_sequenced_ack[ch as usize].record(seq);
                let (base, mask) = self.recv.reliable_sequenced_ack[ch as usize].ack_fields();
                self.queue_ack(AckFamily::ReliableSequenced(ch), base, mask);
                if is_new && self.recv.reliable_sequenced_gate[ch as usize].should_deliver(seq) {
                    self.push_delivery(message_type, payload);
                }
            }
            // ReliableOrdered never reaches here: `handle_data` routes it
            // through `handle_reliable_ordered_chunk` instead, since
            // fragmentation on this channel needs ack/ordering and
            // reassembly kept as separate steps.
            _ => {}
        }
        let _ = now;
    }

    fn push_delivery(&mut self, message_type: MessageType, payload: Vec<u8>) {
        self.deliveries.push(Delivery { message_type, payload });
    }

    // ---- periodic housekeeping ---------------------------------------

    /// Drives timeouts, retransmission, ack flush and keepalive for one
    /// pump tick. Returns `false` once the connection has fully timed
    /// out and can be reclaimed by the peer.
    pub fn tick(&mut self, now: Clock) -> bool {
        match self.state {
            ConnectionState::Connecting { attempts } => {
                if now.elapsed_since(self.connect_attempt_at) >= self.handshake_timeout {
                    if attempts >= self.max_handshake_attempts {
                        self.state = ConnectionState::Disconnected;
                        self.status_events
                            .push(StatusChanged::Disconnected("handshake retries exhausted".into()));
                        return false;
                    }
                    self.send_connect_request();
                    self.connect_attempt_at = now;
                    self.state = ConnectionState::Connecting { attempts: attempts + 1 };
                }
                return true;
            }
            ConnectionState::Disconnected => return false,
            _ => {}
        }

        if now.elapsed_since(self.last_ingress) >= self.idle_timeout {
            self.state = ConnectionState::Disconnected;
            self.status_events
                .push(StatusChanged::Disconnected("connection timed out".into()));
            return false;
        }

        self.resend_due(now);
        self.flush_acks();

        let ping_due = self.last_ping_sent.map_or(true, |sent| now.elapsed_since(sent) >= self.ping_interval);
        if ping_due {
            self.send_control(MessageType::Ping, |_| {});
            self.last_ping_sent = Some(now);
        }

        true
    }

    fn resend_due(&mut self, now: Clock) {
        let delay = self.rtt.resend_delay().max(self.resend_floor);
        let mut stats = SendStats::default();

        resend_window(&mut self.send.reliable_unordered, MessageType::ReliableUnordered, now, delay, &mut self.outbox, &mut stats);
        for (ch, window) in self.send.reliable_sequenced.iter_mut().enumerate() {
            resend_window(window, MessageType::ReliableSequenced(ch as u8), now, delay, &mut self.outbox, &mut stats);
        }
        for (ch, window) in self.send.reliable_ordered.iter_mut().enumerate() {
            resend_window(window, MessageType::ReliableOrdered(ch as u8), now, delay, &mut self.outbox, &mut stats);
        }

        self.packets_sent += stats.packets_sent;
        self.bytes_sent += stats.bytes_sent;
        self.packets_lost += stats.packets_lost;
    }

    fn flush_acks(&mut self) {
        if self.pending_acks.is_empty() {
            return;
        }

        for ack in std::mem::take(&mut self.pending_acks) {
            self.send_control(MessageType::Acknowledge, |buf| {
                buf.write_u8(ack.family.message_type().to_byte());
                buf.write_bits(ack.base as u64, 15);
                buf.write_u64(ack.mask);
            });
        }
        self.last_ack_sent = Some(Clock::now());
    }

    /// Begins MTU expansion by probing a larger size; called by the peer
    /// pump on a slow interval, never on every tick. A probe left
    /// unanswered by the time this is called again counts as a failure
    /// (`spec.md` §4.3/§6 `ExpandMTUFailAttempts`); enough consecutive
    /// failures freeze the MTU so a path that can't carry a larger
    /// datagram doesn't get probed forever.
    pub fn probe_larger_mtu(&mut self) {
        if self.mtu_frozen || self.mtu >= MAX_MTU {
            return;
        }
        if let Some(unanswered) = self.mtu_probe.take() {
            let _ = unanswered;
            self.mtu_probe_fail_attempts += 1;
            if self.mtu_probe_fail_attempts >= self.expand_mtu_fail_attempts {
                self.mtu_frozen = true;
                return;
            }
        }
        let probe = (self.mtu + MTU_PROBE_STEP).min(MAX_MTU);
        self.mtu_probe = Some(probe);
        self.send_control(MessageType::ExpandMtuRequest, |buf| {
            buf.write_u16(probe as u16);
        });
    }

    pub fn request_disconnect(&mut self) {
        self.send_control(MessageType::Disconnect, |_| {});
        self.state = ConnectionState::Disconnecting;
    }
}

/// Accumulates this resend pass's effect on a connection's diagnostics
/// counters; folded into `Connection`'s totals once the pass over every
/// reliable channel completes.
#[derive(Default)]
struct SendStats {
    packets_sent: u64,
    bytes_sent: u64,
    packets_lost: u64,
}

fn resend_window(
    window: &mut ReliableSendWindow,
    message_type: MessageType,
    now: Clock,
    delay: Duration,
    outbox: &mut Vec<Vec<u8>>,
    stats: &mut SendStats,
) {
    for seq in window.due_for_send(now, delay) {
        if window.attempts(seq) > 0 {
            trace!(?message_type, seq, "resending unacknowledged reliable message");
            stats.packets_lost += 1;
        }
        let Some(payload) = window.payload(seq).map(|p| p.to_vec()) else { continue };
        let fragmented = window.fragmented(seq);
        let mut buf = MessageBuffer::new();
        let offset = wire::write_header(&mut buf, message_type, fragmented, seq);
        buf.write_bytes(&payload);
        wire::finish_header(&mut buf, offset, (payload.len() * 8) as u16);
        let datagram = buf.as_bytes().to_vec();
        stats.packets_sent += 1;
        stats.bytes_sent += datagram.len() as u64;
        outbox.push(datagram);
        window.mark_sent(seq, now);
    }
}

/// Reads the fixed-size public key carried by a `KeyExchangeRequest` or
/// `KeyExchangeResponse` payload.
fn read_public_key(buf: &mut MessageBuffer) -> Option<[u8; 32]> {
    let bytes = buf.read_bytes(32).ok()?;
    let mut key = [0u8; 32];
    key.copy_from_slice(bytes);
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;

    fn test_config() -> PeerConfig {
        PeerConfig::default()
    }

    #[test]
    fn unreliable_message_round_trips_without_acks() {
        let config = test_config();
        let now = Clock::now();
        let remote: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut a = Connection::new_outgoing(remote, now, &config);
        a.state = ConnectionState::Connected;
        a.drain_outbox(); // discard the handshake ConnectRequest

        a.enqueue(MessageType::Unreliable, b"hello");
        let datagrams = a.drain_outbox();
        assert_eq!(datagrams.len(), 1);

        let mut b = Connection::new_incoming(remote, now, &config);
        b.state = ConnectionState::Connected;
        b.receive_datagram(&datagrams[0], now);

        let deliveries = b.drain_deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload, b"hello");
        assert!(b.drain_outbox().is_empty());
    }

    #[test]
    fn reliable_unordered_message_triggers_an_ack() {
        let config = test_config();
        let now = Clock::now();
        let remote: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let mut sender = Connection::new_outgoing(remote, now, &config);
        sender.state = ConnectionState::Connected;
        sender.enqueue(MessageType::ReliableUnordered, b"reliable payload");
        sender.tick(now);
        let datagrams = sender.drain_outbox();
        assert!(!datagrams.is_empty());

        let mut receiver = Connection::new_incoming(remote, now, &config);
        receiver.state = ConnectionState::Connected;
        for datagram in &datagrams {
            receiver.receive_datagram(datagram, now);
        }
        receiver.tick(now);

        assert_eq!(receiver.drain_deliveries().len(), 1);
        assert!(!receiver.drain_outbox().is_empty(), "receiver must emit an ack");
    }

    #[test]
    fn reliable_ordered_buffers_out_of_order_arrivals() {
        let config = test_config();
        let now = Clock::now();
        let remote: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        let mut sender = Connection::new_outgoing(remote, now, &config);
        sender.state = ConnectionState::Connected;
        sender.drain_outbox(); // discard the handshake ConnectRequest

        sender.enqueue(MessageType::ReliableOrdered(0), b"first");
        sender.enqueue(MessageType::ReliableOrdered(0), b"second");
        let datagrams = sender.drain_outbox();
        assert_eq!(datagrams.len(), 2);

        let mut receiver = Connection::new_incoming(remote, now, &config);
        receiver.state = ConnectionState::Connected;
        // Deliver out of order.
        receiver.receive_datagram(&datagrams[1], now);
        assert!(receiver.drain_deliveries().is_empty());
        receiver.receive_datagram(&datagrams[0], now);

        let deliveries = receiver.drain_deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].payload, b"first");
        assert_eq!(deliveries[1].payload, b"second");
    }

    #[test]
    fn idle_connection_times_out() {
        let config = test_config();
        let now = Clock::now();
        let remote: SocketAddr = "127.0.0.1:9003".parse().unwrap();
        let mut conn = Connection::new_outgoing(remote, now, &config);
        conn.state = ConnectionState::Connected;

        let later = now.advance(config.idle_timeout + Duration::from_secs(1));
        assert!(!conn.tick(later));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stats_track_sent_and_received_bytes() {
        let config = test_config();
        let now = Clock::now();
        let remote: SocketAddr = "127.0.0.1:9004".parse().unwrap();
        let mut a = Connection::new_outgoing(remote, now, &config);
        a.state = ConnectionState::Connected;
        a.drain_outbox();

        a.enqueue(MessageType::Unreliable, b"hello");
        let datagrams = a.drain_outbox();
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(a.stats().bytes_sent, datagrams[0].len() as u64);

        let mut b = Connection::new_incoming(remote, now, &config);
        b.state = ConnectionState::Connected;
        b.receive_datagram(&datagrams[0], now);
        assert_eq!(b.stats().packets_received, 1);
        assert_eq!(b.stats().bytes_received, datagrams[0].len() as u64);
    }
}
