
//! Define 9P error representations
//!
//! In 9P2000, errors are represented as strings: a server reports failure
//! with an Rerror message carrying the diagnostic verbatim, and the mount
//! driver has a small set of stable strings of its own for failures it
//! detects locally.

use std::{fmt, io};

pub type Result<T> = ::std::result::Result<T, Error>;

/// Errors surfaced by the mount multiplexer
#[derive(Debug)]
pub enum Error {
    /// I/O error on the underlying transport
    Io(io::Error),
    /// Error string reported by the server in an Rerror reply
    Server(String),
    /// Protocol violation or mux failure diagnosed locally
    Proto(String),
    /// The request was flushed before the server answered it
    Intr,
    /// The transport hung up
    Hungup,
}

impl Error {
    /// Whether this error means the server connection is gone.
    ///
    /// Clunk and remove treat a hung-up transport specially: the server
    /// already discarded all fids, so the local fid must not be thrown away.
    pub fn is_hungup(&self) -> bool {
        match *self {
            Error::Hungup => true,
            Error::Server(ref e) => e == string::EHUNGUP,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
            Error::Server(ref e) => write!(f, "{}", e),
            Error::Proto(ref e) => write!(f, "{}", e),
            Error::Intr => write!(f, "{}", string::EINTR),
            Error::Hungup => write!(f, "{}", string::EHUNGUP),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// 9P error strings
///
/// # Protocol
/// 9P2000
pub mod string {
    pub const EMOUNTRPC: &str = "mount rpc error";
    pub const EINTR: &str = "interrupted";
    pub const EHUNGUP: &str = "i/o on hungup channel";
    pub const EBADUSEFD: &str = "inappropriate use of fd";
    pub const ENOATTACH: &str = "mount/attach disallowed";
    pub const ESHORTSTAT: &str = "stat buffer too small";
    pub const ESHORT: &str = "i/o count too small";
    pub const ESBADSTAT: &str = "invalid directory entry received from server";
    pub const ENOVERSION: &str = "version not established for mount channel";
}
