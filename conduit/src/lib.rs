//! Reliable, multiplexed, connection-oriented transport over unreliable
//! datagram sockets.
//!
//! A [`Peer`](peer::Peer) owns one UDP socket and a table of
//! [`Connection`](connection::Connection)s, each exposing five delivery
//! channel families (unreliable, unreliable-sequenced,
//! reliable-unordered, reliable-sequenced, reliable-ordered) multiplexed
//! over a single [`MessageBuffer`](buffer::MessageBuffer)-framed wire
//! format. Nothing here spawns a thread; the caller drives the whole
//! stack by calling `Peer::pump` in its own loop.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod fragment;
pub mod message;
pub mod peer;
pub mod sequence;
pub mod wire;
