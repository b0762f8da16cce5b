#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Rheomesh forward
//! The packet routing core of an SFU: UDP listeners shared through a connection pool, a
//! packet mux splitting RTP from RTCP, per SSRC buffers, and routers fanning every published
//! track out to the forwarders of its subscribers. Signaling is not included, bring your own
//! and drive [`peer::Peer`] from it.
//!
//! `demos/udp_server.rs` is a minimal server listening on a port range.

/// Per SSRC packet buffers, NACK generation and RTCP readers.
pub mod buffer;
/// Configuration for [`worker::Worker`] and [`router::Router`].
pub mod config;
/// Forwarders that send a received track to one subscriber.
pub mod down_track;
pub mod error;
/// Byte oriented mux dispatching datagrams to endpoints by predicate.
pub mod mux;
pub mod peer;
pub mod publisher;
/// Receiver holds the simulcast layers of one published track.
pub mod receiver;
/// Router is a module that determines which media to distribute to whom.
pub mod router;
/// RTP packet related module.
pub mod rtp;
pub mod service_id;
pub mod session;
pub mod subscriber;
pub mod track;
pub mod transport;
/// Transport wide congestion control feedback.
pub mod twcc;
/// Worker owns the listening sockets and the sessions.
pub mod worker;
