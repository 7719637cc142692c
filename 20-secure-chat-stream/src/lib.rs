//! Secure bidirectional chat stream.
//!
//! A client and a server hold one long-lived, full-duplex session over plain
//! TCP, server-authenticated TLS, or mutual TLS. Messages are JSON lines; the
//! client injects periodic heartbeats and the server echoes everything back.
//!
//! - [`config`] holds transport and session settings with the protocol defaults.
//! - [`error`] defines [`ChatError`](error::ChatError), the one error type of the library.
//! - [`message`] is the wire codec for [`ChatMessage`](message::ChatMessage) frames.
//! - [`transport`] negotiates the channel: credentials, TLS, ALPN, keepalive, banner.
//! - [`session`] splits a channel into concurrent send and receive paths.
//! - [`heartbeat`] runs the liveness timer against a weak send handle.
//! - [`echo`] is the server endpoint.
//! - [`supervisor`] orders startup and bounded teardown for both roles.
//! - [`client`] and [`cli`] are the terminal front end used by the binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod echo;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod session;
pub mod supervisor;
pub mod transport;
