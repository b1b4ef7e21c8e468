//! The crate's error taxonomy.
//!
//! A single `Error` enum is used throughout, rather than one type per
//! module, as most errors need to cross task/channel boundaries anyway (see
//! the `From` impls below). Each variant is documented with how it
//! propagates, per the error handling design.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The `.torrent` file could not be parsed, or its info dictionary is
    /// malformed (e.g. `pieces` not a multiple of 20 bytes). Fatal: abort
    /// before any network activity.
    Metainfo(String),

    /// The tracker request failed (transport error, non-success status, or
    /// bencode decode failure), or its `peers` field had an invalid length.
    /// Fatal on the current tracker; the coordinator may retry a backup
    /// tracker from `announce-list`.
    Tracker(String),

    /// Zero peers connected, or all connected peers disconnected before the
    /// torrent completed. Fatal for the whole download.
    NoPeers,

    /// Dialing the peer's TCP address did not complete within the allotted
    /// time.
    DialTimeout,

    /// The peer's handshake reply was invalid: wrong length, wrong protocol
    /// string, or a mismatching info hash.
    Handshake(String),

    /// A message arrived at a point in the session state machine where it is
    /// not a valid message (e.g. a second bitfield message, or something
    /// other than bitfield/have/unchoke while building the initial
    /// bitfield).
    Protocol(String),

    /// The message carried an unrecognised ID or an otherwise malformed
    /// payload. Per-session fatal: the session disconnects.
    MalformedMessage(String),

    /// A downloaded piece's bytes did not hash to the expected value. Only
    /// ever produced inside `download_piece`; the caller requeues the piece.
    /// This is deliberately not an IO error: the peer sent exactly what it
    /// claimed to, so it is not grounds for a strike.
    Integrity { index: crate::PieceIndex },

    /// A socket read/write failed or timed out. Per-session; causes a
    /// strike, and disconnect once strikes exceed `MAX_STRIKES`.
    Io(std::io::Error),

    /// A send on an internal channel failed because the receiving end was
    /// already dropped. Treated like an IO error by callers that encounter
    /// it mid-session.
    ChannelClosed,

    /// A file could not be created or written to during output assembly.
    /// Fatal at completion: existing partial output is left untouched.
    Filesystem(std::io::Error),

    /// A piece index passed to a storage computation was out of bounds for
    /// the torrent. Indicates a programming error upstream (e.g. a peer
    /// message that should have already been rejected by the protocol
    /// decoder) rather than anything a caller should recover from.
    InvalidPieceIndex { index: crate::PieceIndex },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Metainfo(msg) => write!(f, "invalid metainfo: {}", msg),
            Error::Tracker(msg) => write!(f, "tracker error: {}", msg),
            Error::NoPeers => write!(f, "no peers to download from"),
            Error::DialTimeout => write!(f, "timed out connecting to peer"),
            Error::Handshake(msg) => write!(f, "handshake error: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::MalformedMessage(msg) => {
                write!(f, "malformed message: {}", msg)
            }
            Error::Integrity { index } => {
                write!(f, "piece {} failed hash verification", index)
            }
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::ChannelClosed => write!(f, "internal channel closed"),
            Error::Filesystem(e) => write!(f, "filesystem error: {}", e),
            Error::InvalidPieceIndex { index } => {
                write!(f, "invalid piece index: {}", index)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Filesystem(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Error::DialTimeout
        } else {
            Error::Io(e)
        }
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "operation timed out",
        ))
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Metainfo(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Tracker(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
