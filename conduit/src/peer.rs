//! `Peer`: the single-threaded, cooperatively-driven socket pump, per
//! `spec.md` §4.7. One UDP socket, one `mio::Poll`, one connection table
//! keyed by remote address — grounded in the teacher's
//! `net::endpoint::Endpoint`, which plays the same role for a
//! `TcpListener` (accept readiness, per-connection read/write, periodic
//! housekeeping). `mio` moved from the 0.6 API the teacher was written
//! against (`PollOpt`, `Ready`) to 0.8's `Interest`/`Token` registry
//! API; the structure — one poll, one events buffer, drain-and-dispatch
//! per tick — carries over unchanged.

use crate::buffer::MessageBuffer;
use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionState, ConnectionStats, StatusChanged};
use crate::wire::{self, MessageType};
use indexmap::IndexMap;
use conduit_support::crypto::random_bytes;
use conduit_support::time::Clock;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds a standalone control datagram: a header plus a payload, with
/// no `Connection` and no sequence number, for traffic that precedes
/// (or never needs) one — `Discovery`/`DiscoveryResponse`
/// (`spec.md` §4.7 LAN discovery).
fn build_unconnected_datagram(message_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut buf = MessageBuffer::new();
    let offset = wire::write_header(&mut buf, message_type, false, 0);
    buf.write_bytes(payload);
    wire::finish_header(&mut buf, offset, (payload.len() * 8) as u16);
    buf.as_bytes().to_vec()
}

const SOCKET_TOKEN: Token = Token(0);
const MAX_DATAGRAM_SIZE: usize = 65_527; // largest possible UDP payload

/// Stable identity for a `Peer`'s lifetime, per `spec.md`'s
/// "Peer.UniqueId is stable for the lifetime of the peer" invariant.
/// Generated from OS entropy at construction, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId(u64);

impl PeerId {
    fn generate() -> Self {
        let mut bytes = [0u8; 8];
        random_bytes(&mut bytes);
        PeerId(u64::from_le_bytes(bytes))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// One message or lifecycle event surfaced to the application, tagged
/// with the peer it came from.
pub enum IncomingEvent {
    Data { message_type: MessageType, payload: Vec<u8> },
    Status(StatusChanged),
}

/// Drives every `Connection` this process is party to over one UDP
/// socket. Not `Send`+`Sync` by design — the whole point of the pump
/// architecture is that one thread owns it and drives it cooperatively.
pub struct Peer {
    id: PeerId,
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    connections: IndexMap<SocketAddr, Connection>,
    config: PeerConfig,
    recv_buf: Vec<u8>,
    incoming: Vec<(SocketAddr, IncomingEvent)>,
    discovery_response_payload: Vec<u8>,
}

impl Peer {
    pub fn bind(address: SocketAddr, config: PeerConfig) -> io::Result<Self> {
        config.validate().map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;

        let mut socket = UdpSocket::bind(address)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        Ok(Peer {
            id: PeerId::generate(),
            socket,
            poll,
            events: Events::with_capacity(1024),
            connections: IndexMap::new(),
            config,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            incoming: Vec::new(),
            discovery_response_payload: Vec::new(),
        })
    }

    /// Sets the payload this peer answers an incoming `Discovery`
    /// broadcast with. Empty by default, meaning a bare `DiscoveryResponse`.
    pub fn set_discovery_response(&mut self, payload: Vec<u8>) {
        self.discovery_response_payload = payload;
    }

    /// Broadcasts a bare `Discovery` datagram to `broadcast_addr`
    /// (`spec.md` §4.7), e.g. a subnet's broadcast address. Every peer on
    /// the link with broadcast discovery enabled answers with its own
    /// `DiscoveryResponse`, surfaced to this peer as an `IncomingEvent::Data`
    /// without ever creating a `Connection`.
    pub fn broadcast_discovery(&mut self, broadcast_addr: SocketAddr) -> io::Result<()> {
        self.socket.set_broadcast(true)?;
        let datagram = build_unconnected_datagram(MessageType::Discovery, &[]);
        self.socket.send_to(&datagram, broadcast_addr)?;
        Ok(())
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Opens an outgoing connection attempt; the handshake is driven by
    /// subsequent `pump` calls.
    pub fn connect(&mut self, remote: SocketAddr, now: Clock) {
        self.connections
            .entry(remote)
            .or_insert_with(|| Connection::new_outgoing(remote, now, &self.config));
    }

    pub fn disconnect(&mut self, remote: SocketAddr) {
        if let Some(conn) = self.connections.get_mut(&remote) {
            conn.request_disconnect();
        }
    }

    /// Accepts a pending inbound connection that was awaiting
    /// application approval (`spec.md` §4.3's approval callback).
    pub fn approve(&mut self, remote: SocketAddr) {
        if let Some(conn) = self.connections.get_mut(&remote) {
            conn.approve();
        }
    }

    pub fn send(&mut self, remote: SocketAddr, message_type: MessageType, payload: &[u8]) {
        if let Some(conn) = self.connections.get_mut(&remote) {
            conn.enqueue(message_type, payload);
        } else {
            warn!(%remote, "send to unknown peer ignored");
        }
    }

    pub fn connection_state(&self, remote: SocketAddr) -> Option<ConnectionState> {
        self.connections.get(&remote).map(|c| c.state())
    }

    pub fn connection_stats(&self, remote: SocketAddr) -> Option<ConnectionStats> {
        self.connections.get(&remote).map(|c| c.stats())
    }

    /// One cooperative pump iteration: drains whatever datagrams are
    /// currently waiting on the socket, ticks every connection
    /// (retransmits, pings, timeouts, ack flush), then writes every
    /// connection's outbox to the wire. `timeout` bounds how long the
    /// initial socket poll may block; `Duration::ZERO` makes this
    /// non-blocking.
    pub fn pump(&mut self, timeout: Duration, now: Clock) -> io::Result<()> {
        #[cfg(feature = "pump-tracing")]
        let _span = tracing::trace_span!("pump", peer = self.id.get()).entered();

        self.poll.poll(&mut self.events, Some(timeout))?;

        let mut readable = false;
        for event in self.events.iter() {
            if event.token() == SOCKET_TOKEN && event.is_readable() {
                readable = true;
            }
        }

        if readable {
            self.drain_socket(now)?;
        }

        self.tick_connections(now);
        self.flush_outboxes()?;
        self.reap_disconnected();

        Ok(())
    }

    fn drain_socket(&mut self, now: Clock) -> io::Result<()> {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, from)) => {
                    let datagram = self.recv_buf[..len].to_vec();
                    if self.handle_unconnected(&datagram, from)? {
                        continue;
                    }
                    let conn = self.connections.entry(from).or_insert_with(|| {
                        info!(remote = %from, "new inbound peer");
                        Connection::new_incoming(from, now, &self.config)
                    });
                    conn.receive_datagram(&datagram, now);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Intercepts `Discovery`/`DiscoveryResponse` ahead of the
    /// per-connection state machine, neither of which ever needs a
    /// `Connection`: a `Discovery` gets an immediate raw reply,
    /// a `DiscoveryResponse` is surfaced directly to the application.
    /// Returns `true` if the datagram was handled here and must not be
    /// routed to a `Connection`.
    fn handle_unconnected(&mut self, datagram: &[u8], from: SocketAddr) -> io::Result<bool> {
        let mut buf = MessageBuffer::from_bytes(datagram.to_vec(), datagram.len() * 8);
        let Ok(header) = wire::read_header(&mut buf) else {
            return Ok(false);
        };
        match header.message_type {
            MessageType::Discovery => {
                debug!(remote = %from, "answering discovery broadcast");
                let reply = build_unconnected_datagram(
                    MessageType::DiscoveryResponse,
                    &self.discovery_response_payload,
                );
                self.socket.send_to(&reply, from)?;
                Ok(true)
            }
            MessageType::DiscoveryResponse => {
                let payload_bytes = (header.payload_bits / 8) as usize;
                let payload = buf.read_bytes(payload_bytes).map(|bytes| bytes.to_vec()).unwrap_or_default();
                self.incoming.push((
                    from,
                    IncomingEvent::Data { message_type: MessageType::DiscoveryResponse, payload },
                ));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn tick_connections(&mut self, now: Clock) {
        for (remote, conn) in self.connections.iter_mut() {
            conn.tick(now);
            for status in conn.drain_status_events() {
                self.incoming.push((*remote, IncomingEvent::Status(status)));
            }
            for delivery in conn.drain_deliveries() {
                self.incoming.push((
                    *remote,
                    IncomingEvent::Data {
                        message_type: delivery.message_type,
                        payload: delivery.payload,
                    },
                ));
            }
        }
    }

    fn flush_outboxes(&mut self) -> io::Result<()> {
        for (remote, conn) in self.connections.iter_mut() {
            for datagram in conn.drain_outbox() {
                match self.socket.send_to(&datagram, *remote) {
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // UDP send buffer is momentarily full; drop this
                        // datagram the same way a lossy link would, the
                        // ARQ layer's resend timer recovers it.
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    fn reap_disconnected(&mut self) {
        self.connections.retain(|remote, conn| {
            let keep = !conn.is_terminal();
            if !keep {
                info!(%remote, "reaping disconnected peer");
            }
            keep
        });
    }

    /// Drains every message/status event produced by the last `pump`
    /// call, in the order connections were ticked.
    pub fn drain_incoming(&mut self) -> Vec<(SocketAddr, IncomingEvent)> {
        std::mem::take(&mut self.incoming)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
