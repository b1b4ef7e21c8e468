//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default client id used when none is supplied.
pub const DEFAULT_CLIENT_ID: &PeerId = b"-LC0001-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default client id, [`DEFAULT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *DEFAULT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to this.
    pub announce_interval: Duration,

    /// After this many failed announces in a row, the torrent stops trying
    /// the current tracker and fails over to the next backup tracker (if
    /// any).
    pub tracker_error_threshold: usize,

    /// After this many failed block downloads in a row, a peer session
    /// disconnects.
    pub max_strikes: u32,

    /// The number of peers the choking algorithm reciprocates uploads to.
    pub reciprocation_slots: usize,

    /// How often the choking algorithm re-ranks peers.
    pub choke_interval: Duration,

    /// The read/write deadline used outside of active piece downloads
    /// (handshake, bitfield exchange, idle control messages).
    pub control_timeout: Duration,

    /// The read deadline used while a piece download is in flight.
    pub piece_timeout: Duration,

    /// How long a session waits between establish failures before retrying.
    pub reconnect_backoff: Duration,

    /// How many times a session retries establishing a connection before
    /// giving up.
    pub reconnect_attempts: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a
            // waste of network round trip and it allows us to buffer up a
            // bit more than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(60 * 60),
            tracker_error_threshold: 15,
            max_strikes: crate::MAX_STRIKES,
            reciprocation_slots: crate::RECIPROCATION_SLOTS,
            choke_interval: Duration::from_secs(crate::CHOKE_INTERVAL_SECS),
            control_timeout: Duration::from_secs(10),
            piece_timeout: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(30),
            reconnect_attempts: 3,
        }
    }
}
