//! The public entry point: wires metainfo parsing, tracker announce, and the
//! session coordinator together into one running download.

use std::{path::Path, sync::Arc};

use crate::{
    conf::Conf, coordinator, error::*, metainfo::Metainfo, storage_info::StorageInfo,
    tracker, Bitfield,
};

/// Drives a single torrent from its metainfo file to a fully downloaded and
/// verified payload.
pub struct Engine {
    conf: Conf,
}

impl Engine {
    pub fn new(conf: Conf) -> Self {
        Self { conf }
    }

    /// Reads and parses the metainfo file at `torrent_path`, announces to its
    /// tracker(s), and runs the swarm to completion.
    ///
    /// Returns once every piece has been downloaded, verified, and written to
    /// disk. Sessions keep running afterwards to seed; call
    /// [`Download::shutdown`] on the returned handle to end them.
    pub async fn run(&self, torrent_path: impl AsRef<Path>) -> Result<Download> {
        let torrent_path = torrent_path.as_ref();
        log::info!("Reading metainfo file {}", torrent_path.display());
        let buf = tokio::fs::read(torrent_path).await?;
        let metainfo = Metainfo::from_bytes(&buf)?;
        let info_hash = metainfo.info_hash()?;
        log::info!(
            "Parsed metainfo for {:?}, info hash {}",
            metainfo.info.name,
            hex::encode(info_hash)
        );

        let storage =
            Arc::new(StorageInfo::new(&metainfo, self.conf.torrent.download_dir.clone()));
        let hashes: Arc<Vec<_>> = Arc::new(
            (0..storage.piece_count).map(|i| metainfo.piece_hash(i)).collect(),
        );

        let trackers = metainfo.trackers();
        let client_id = self.conf.engine.client_id;
        let announce =
            tracker::announce(&trackers, info_hash, client_id, storage.download_len).await?;
        log::info!("Tracker returned {} peers", announce.peers.len());

        let torrent_conf = Arc::new(self.conf.torrent.clone());
        let (bitfield, coordinator) = coordinator::run(
            client_id,
            info_hash,
            storage,
            hashes,
            announce.peers,
            torrent_conf,
        )
        .await?;

        Ok(Download { bitfield, coordinator })
    }
}

/// A completed download, whose peer sessions may still be running to seed.
pub struct Download {
    bitfield: Bitfield,
    coordinator: coordinator::Coordinator,
}

impl Download {
    /// The final bitfield: every piece, since [`Engine::run`] only returns
    /// once the torrent is fully downloaded and verified.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Tells every still-running (seeding) peer session to end.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}
