
//! Client-side multiplexer for the 9P2000 protocol
//!
//! Given a bidirectional byte transport to a 9P file server, this library
//! presents filesystem-style channels (attach, walk, open/create, read,
//! write, stat/wstat, remove, clunk) to any number of concurrent callers.
//! Callers share one transport by interleaving tagged request/reply pairs;
//! the multiplexer correlates replies with waiters, negotiates the
//! protocol version, allocates fids and tags, converts cancellation into
//! the Tflush protocol, and chunks partial i/o by the negotiated message
//! size.

#[macro_use]
extern crate log;

#[macro_use]
extern crate enum_primitive;

#[macro_use]
extern crate bitflags;

pub mod client;
pub mod error;
pub mod fcall;
mod mnt;
mod mntio;
pub mod serialize;
pub mod transport;

pub use client::{attach, auth, version, Chan, MntFlags, Walkqid, DEVMNT};
pub use error::{Error, Result};
pub use fcall::*;
pub use transport::{Intr, StreamTransport, Transport};
