use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{stream::StreamExt as _, time};

use super::{DataReceiver, Piece, PieceData, SharedAssembly, SharedWorkQueue};
use crate::{
    error::*, storage_info::StorageInfo, Bitfield, Sha1Hash,
    THROUGHPUT_INTERVAL_MILLIS,
};

/// Owns the assembly buffer and the owned bitfield (through [`SharedAssembly`])
/// and drives the torrent to completion by draining verified pieces off the
/// data sink.
pub(crate) struct PieceScheduler {
    storage: Arc<StorageInfo>,
    hashes: Arc<Vec<Sha1Hash>>,
    work_queue: SharedWorkQueue,
    data_rx: DataReceiver,
    assembly: SharedAssembly,
    active_sessions: Arc<AtomicUsize>,
    choke_interval: Duration,

    done: usize,
    downloaded_since_tick: u64,
}

impl PieceScheduler {
    pub fn new(
        storage: Arc<StorageInfo>,
        hashes: Arc<Vec<Sha1Hash>>,
        work_queue: SharedWorkQueue,
        data_rx: DataReceiver,
        assembly: SharedAssembly,
        active_sessions: Arc<AtomicUsize>,
        choke_interval: Duration,
    ) -> Self {
        Self {
            storage,
            hashes,
            work_queue,
            data_rx,
            assembly,
            active_sessions,
            choke_interval,
            done: 0,
            downloaded_since_tick: 0,
        }
    }

    /// Pushes every piece into the work queue. Called once, before any
    /// session starts pulling from it.
    pub async fn bootstrap(&self) -> Result<()> {
        log::info!(
            "Bootstrapping work queue with {} pieces",
            self.storage.piece_count
        );
        for index in 0..self.storage.piece_count {
            let piece = Piece {
                index,
                len: self.storage.piece_len(index)?,
                expected_hash: self.hashes[index],
            };
            self.work_queue.push(piece).await?;
        }
        Ok(())
    }

    /// Runs the scheduler to completion, returning the torrent's final owned
    /// bitfield. The completed content lives in the shared assembly buffer
    /// for the lifetime of the process (the request server keeps serving out
    /// of it while seeding).
    ///
    /// Returns [`Error::NoPeers`] if every session goes inactive before the
    /// torrent is fully downloaded.
    pub async fn run(mut self) -> Result<Bitfield> {
        let mut throughput_tick = time::interval(Duration::from_millis(
            THROUGHPUT_INTERVAL_MILLIS,
        ));
        let mut liveness_tick = time::interval(self.choke_interval);

        while self.done < self.storage.piece_count {
            tokio::select! {
                piece = self.data_rx.recv() => {
                    match piece {
                        Some(piece) => self.receive_piece(piece).await?,
                        None => {
                            // every sender (every session) dropped its data
                            // sink handle; nothing more can ever arrive
                            log::warn!("Data sink closed before completion");
                            return Err(Error::NoPeers);
                        }
                    }
                }
                _ = throughput_tick.next() => {
                    self.report_throughput();
                }
                _ = liveness_tick.next() => {
                    if self.active_sessions.load(Ordering::SeqCst) == 0 {
                        log::warn!("All peer sessions inactive, giving up");
                        return Err(Error::NoPeers);
                    }
                }
            }
        }

        log::info!("All {} pieces downloaded", self.storage.piece_count);
        // close the work queue: signals every session still consuming it to
        // stop requesting new work and transition to seeding. Every piece
        // has, by construction, succeeded exactly once by this point, so the
        // queue is already drained; this never needs the receiver lock.
        self.work_queue.close();

        let owned = self.write_out().await?;

        Ok(owned)
    }

    async fn receive_piece(&mut self, piece: PieceData) -> Result<()> {
        let index = piece.index;
        let (start, end) = self.storage.piece_bounds(index)?;
        debug_assert_eq!(end - start, piece.bytes.len() as u64);

        self.assembly.write().await.write_piece(index, start, &piece.bytes);
        self.done += 1;
        self.downloaded_since_tick += piece.bytes.len() as u64;

        log::info!(
            "Piece {} verified and written ({}/{})",
            index,
            self.done,
            self.storage.piece_count
        );

        Ok(())
    }

    fn report_throughput(&mut self) {
        let bytes_per_sec = self.downloaded_since_tick as f64
            / (THROUGHPUT_INTERVAL_MILLIS as f64 / 1000.0);
        log::debug!(
            "Download speed: {:.2} KiB/s ({}/{} pieces)",
            bytes_per_sec / 1024.0,
            self.done,
            self.storage.piece_count
        );
        self.downloaded_since_tick = 0;
    }

    /// Writes the assembled buffer out to disk, per the torrent's file
    /// structure, once every piece has been downloaded and verified.
    /// Returns the owned bitfield (all bits set) for the caller to report.
    async fn write_out(&self) -> Result<Bitfield> {
        use crate::storage_info::FsStructure;

        log::info!("Writing out to {}", self.storage.download_dir.display());

        let assembly = self.assembly.read().await;
        match &self.storage.structure {
            FsStructure::File(file) => {
                let path = self.storage.download_dir.join(&file.path);
                write_file(&assembly, &path, 0, file.len as usize)?;
            }
            FsStructure::Archive { files } => {
                for file in files {
                    let path = self.storage.download_dir.join(&file.path);
                    write_file(
                        &assembly,
                        &path,
                        file.torrent_offset as usize,
                        file.len as usize,
                    )?;
                }
            }
        }

        Ok(assembly.owned_bitfield().clone())
    }
}

fn write_file(
    assembly: &super::Assembly,
    path: &std::path::Path,
    offset: usize,
    len: usize,
) -> Result<()> {
    use std::{fs, io::Write};

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::Filesystem)?;
    }
    if path.exists() {
        return Err(Error::Filesystem(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("refusing to overwrite existing file {:?}", path),
        )));
    }

    let mut file = fs::File::create(path).map_err(Error::Filesystem)?;
    file.write_all(&assembly.buf()[offset..offset + len])
        .map_err(Error::Filesystem)?;
    Ok(())
}
