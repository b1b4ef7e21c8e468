use crate::{PieceIndex, Sha1Hash};

/// A piece of work handed out via the work queue: everything a peer session
/// needs to download and verify one piece, without reaching back into the
/// torrent's metainfo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Piece {
    pub index: PieceIndex,
    pub len: u32,
    pub expected_hash: Sha1Hash,
}

/// A successfully downloaded and hash-verified piece, handed from a peer
/// session to the scheduler via the data sink.
#[derive(Debug)]
pub(crate) struct PieceData {
    pub index: PieceIndex,
    pub bytes: Vec<u8>,
}
