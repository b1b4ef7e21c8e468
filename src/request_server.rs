//! Serves block requests from peers we have unchoked.
//!
//! Runs as its own task, decoupled from the scheduler: it only ever reads
//! the shared assembly buffer, so it never contends with the scheduler's
//! writes beyond the ordinary read/write-lock arbitration.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{piece::SharedAssembly, proto::Message, storage_info::StorageInfo, PieceIndex};

/// A block request forwarded from a peer session, carrying a capability
/// reference back to that peer's outbound mailbox.
///
/// This reference grants the request server permission to enqueue a reply on
/// the originating peer's `Q_out`, nothing more; the request server does not
/// otherwise own or manage that peer's session.
pub(crate) struct BlockRequest {
    pub peer_out: mpsc::Sender<Message>,
    pub index: PieceIndex,
    pub offset: u32,
    pub len: u32,
}

pub(crate) type RequestSender = mpsc::Sender<BlockRequest>;
pub(crate) type RequestReceiver = mpsc::Receiver<BlockRequest>;

/// Capacity of the request queue. Generous, since a stalled request server
/// should never back up into peer sessions blocking on other work; sessions
/// use `try_send` when forwarding a request so a full queue here just drops
/// the newest requests.
const REQUEST_CHANNEL_CAPACITY: usize = 256;

pub(crate) fn request_channel() -> (RequestSender, RequestReceiver) {
    mpsc::channel(REQUEST_CHANNEL_CAPACITY)
}

/// Drains the request queue and serves block requests out of the shared
/// assembly buffer, for as long as the queue has any senders left.
pub(crate) struct RequestServer {
    storage: Arc<StorageInfo>,
    assembly: SharedAssembly,
    req_rx: RequestReceiver,
}

impl RequestServer {
    pub fn new(
        storage: Arc<StorageInfo>,
        assembly: SharedAssembly,
        req_rx: RequestReceiver,
    ) -> Self {
        Self {
            storage,
            assembly,
            req_rx,
        }
    }

    /// Runs until every request sender has been dropped (i.e. every peer
    /// session has ended).
    pub async fn run(mut self) {
        log::info!("Starting request server");
        while let Some(req) = self.req_rx.recv().await {
            self.serve(req).await;
        }
        log::info!("Request server shutting down: no senders left");
    }

    async fn serve(&self, req: BlockRequest) {
        let (piece_start, piece_end) = match self.storage.piece_bounds(req.index) {
            Ok(bounds) => bounds,
            Err(_) => {
                log::warn!("Discarding request for invalid piece {}", req.index);
                return;
            }
        };
        let piece_len = piece_end - piece_start;
        if req.offset as u64 + req.len as u64 > piece_len {
            log::warn!(
                "Discarding out-of-bounds request for piece {} offset {} len {}",
                req.index,
                req.offset,
                req.len
            );
            return;
        }

        let assembly = self.assembly.read().await;
        if !assembly.has(req.index) {
            log::trace!(
                "Discarding request for piece {} we don't have",
                req.index
            );
            return;
        }
        let data = assembly.slice(piece_start + req.offset as u64, req.len);
        drop(assembly);

        let msg = Message::Piece {
            piece_index: req.index,
            offset: req.offset,
            data,
        };
        // never block the request server on a slow/stuck peer: drop the
        // reply if its outbound mailbox is full, the peer will re-request
        if req.peer_out.try_send(msg).is_err() {
            log::trace!(
                "Dropping reply for piece {} offset {}: peer mailbox full \
                 or closed",
                req.index,
                req.offset
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};

    fn storage() -> Arc<StorageInfo> {
        Arc::new(StorageInfo {
            piece_count: 3,
            piece_len: 16384,
            last_piece_len: 7232,
            download_len: 40000,
            download_dir: PathBuf::from("/tmp"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("out.bin"),
                len: 40000,
                torrent_offset: 0,
            }),
        })
    }

    #[tokio::test]
    async fn serves_block_from_owned_piece() {
        let storage = storage();
        let assembly = crate::piece::new_shared_assembly(40000, 3);
        {
            let mut a = assembly.write().await;
            a.write_piece(1, 16384, &vec![7u8; 16384]);
        }
        let (req_tx, req_rx) = request_channel();
        let server = RequestServer::new(storage, assembly, req_rx);
        let handle = tokio::spawn(server.run());

        let (peer_tx, mut peer_rx) = mpsc::channel(4);
        req_tx
            .send(BlockRequest {
                peer_out: peer_tx,
                index: 1,
                offset: 0,
                len: 16384,
            })
            .await
            .unwrap();
        drop(req_tx);

        let msg = peer_rx.recv().await.unwrap();
        match msg {
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                assert_eq!(piece_index, 1);
                assert_eq!(offset, 0);
                assert_eq!(data, vec![7u8; 16384]);
            }
            other => panic!("expected Piece message, got {:?}", other),
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn discards_request_for_unowned_piece() {
        let storage = storage();
        let assembly = crate::piece::new_shared_assembly(40000, 3);
        let (req_tx, req_rx) = request_channel();
        let server = RequestServer::new(storage, assembly, req_rx);
        let handle = tokio::spawn(server.run());

        let (peer_tx, mut peer_rx) = mpsc::channel(4);
        req_tx
            .send(BlockRequest {
                peer_out: peer_tx,
                index: 1,
                offset: 0,
                len: 16384,
            })
            .await
            .unwrap();
        drop(req_tx);

        handle.await.unwrap();
        assert!(peer_rx.try_recv().is_err());
    }
}
