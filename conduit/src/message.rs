//! Pooled message buffers exchanged between the application and a
//! connection's channels.
//!
//! Grounded in the teacher's `networking::chunk`/`networking::chunkpool`
//! split: a plain struct holding one buffer, and a free-list pool that
//! hands out a recycled instance before ever allocating a new one. The
//! teacher's pool held one kind of chunk; this one holds two, since
//! outgoing and incoming messages carry different metadata. `spec.md`
//! §5/§9 call for the recycle pools specifically to be thread-safe LIFO
//! structures (an embedding application may allocate from a different
//! thread than the one driving a `Peer`'s pump), hence the `parking_lot`
//! mutex around each free list rather than a bare `Vec`.

use crate::buffer::MessageBuffer;
use crate::wire::MessageType;
use parking_lot::Mutex;
use std::net::SocketAddr;

/// A message queued by the application for delivery to a peer, awaiting
/// (or mid-way through) the channel's send pipeline.
pub struct OutgoingMessage {
    pub message_type: MessageType,
    pub payload: MessageBuffer,
}

impl OutgoingMessage {
    fn new() -> Self {
        OutgoingMessage {
            message_type: MessageType::Unreliable,
            payload: MessageBuffer::new(),
        }
    }

    /// Resets this instance for reuse with a different payload, as if
    /// freshly allocated.
    fn recycle_for(&mut self, message_type: MessageType) {
        self.message_type = message_type;
        self.payload.reset();
    }
}

/// A message received from a peer, reassembled (if it was fragmented)
/// and ready for the application to read.
pub struct IncomingMessage {
    pub message_type: MessageType,
    pub from: SocketAddr,
    pub payload: MessageBuffer,
}

impl IncomingMessage {
    fn new() -> Self {
        IncomingMessage {
            message_type: MessageType::Unreliable,
            from: SocketAddr::from(([0, 0, 0, 0], 0)),
            payload: MessageBuffer::new(),
        }
    }

    fn recycle_for(&mut self, message_type: MessageType, from: SocketAddr) {
        self.message_type = message_type;
        self.from = from;
        self.payload.reset();
    }
}

/// Free-list pools for outgoing and incoming messages. A `Peer` owns
/// one of these and every `Connection` it manages borrows from it, so a
/// burst of traffic on one connection doesn't force allocation while
/// another connection's messages sit idle in the pool.
pub struct MessagePool {
    outgoing: Mutex<Vec<OutgoingMessage>>,
    incoming: Mutex<Vec<IncomingMessage>>,
}

impl MessagePool {
    pub fn new() -> Self {
        MessagePool {
            outgoing: Mutex::new(Vec::new()),
            incoming: Mutex::new(Vec::new()),
        }
    }

    /// Hands out a recycled outgoing message if one is available,
    /// allocating a new one otherwise.
    pub fn alloc_outgoing(&self, message_type: MessageType) -> OutgoingMessage {
        let mut msg = self.outgoing.lock().pop().unwrap_or_else(OutgoingMessage::new);
        msg.recycle_for(message_type);
        msg
    }

    pub fn reclaim_outgoing(&self, msg: OutgoingMessage) {
        self.outgoing.lock().push(msg);
    }

    pub fn alloc_incoming(&self, message_type: MessageType, from: SocketAddr) -> IncomingMessage {
        let mut msg = self.incoming.lock().pop().unwrap_or_else(IncomingMessage::new);
        msg.recycle_for(message_type, from);
        msg
    }

    pub fn reclaim_incoming(&self, msg: IncomingMessage) {
        self.incoming.lock().push(msg);
    }

    fn outgoing_len(&self) -> usize {
        self.outgoing.lock().len()
    }

    fn incoming_len(&self) -> usize {
        self.incoming.lock().len()
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_outgoing_reuses_recycled_instances() {
        let pool = MessagePool::new();

        let mut msg = pool.alloc_outgoing(MessageType::ReliableUnordered);
        msg.payload.write_u32(0xcafef00d);
        pool.reclaim_outgoing(msg);

        assert_eq!(pool.outgoing_len(), 1);

        let reused = pool.alloc_outgoing(MessageType::Unreliable);
        assert_eq!(reused.payload.bit_length(), 0, "recycled buffer must be cleared");
        assert_eq!(pool.outgoing_len(), 0);
    }

    #[test]
    fn alloc_incoming_sets_sender_and_type() {
        let pool = MessagePool::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let msg = pool.alloc_incoming(MessageType::ReliableOrdered(2), addr);
        assert_eq!(msg.from, addr);
        assert_eq!(msg.message_type, MessageType::ReliableOrdered(2));
    }

    #[test]
    fn pools_grow_independently() {
        let pool = MessagePool::new();
        let out = pool.alloc_outgoing(MessageType::Unreliable);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let inc = pool.alloc_incoming(MessageType::Unreliable, addr);

        pool.reclaim_outgoing(out);
        assert_eq!(pool.outgoing_len(), 1);
        assert_eq!(pool.incoming_len(), 0);

        pool.reclaim_incoming(inc);
        assert_eq!(pool.incoming_len(), 1);
    }
}
