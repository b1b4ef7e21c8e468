use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{Bitfield, PieceIndex};

/// The torrent's content buffer and owned-piece bitfield, shared between the
/// scheduler (sole writer), and the request server (reader, once a piece is
/// marked owned).
///
/// The bitfield's bit for a piece is only ever set by the scheduler
/// immediately after copying that piece's bytes into `buf`, under the same
/// write-lock acquisition, so a reader that observes the bit set is
/// guaranteed to see the fully written bytes too.
pub(crate) struct Assembly {
    buf: Vec<u8>,
    owned: Bitfield,
}

impl Assembly {
    pub fn new(download_len: u64, piece_count: usize) -> Self {
        Self {
            buf: vec![0; download_len as usize],
            owned: Bitfield::new(piece_count),
        }
    }

    /// Copies a verified piece's bytes into the buffer and marks it owned.
    ///
    /// Bit-set happens right after the copy, under the caller's write-lock
    /// guard, so there is no window where the bit is visible without the
    /// bytes it covers also being visible.
    pub fn write_piece(&mut self, index: PieceIndex, start: u64, bytes: &[u8]) {
        let start = start as usize;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.owned.set(index);
    }

    pub fn has(&self, index: PieceIndex) -> bool {
        self.owned.has(index)
    }

    /// Returns a copy of the byte range, used by the request server to serve
    /// a block. Panics if the range is out of bounds, which would indicate a
    /// bug upstream (the caller must have already checked `has`).
    pub fn slice(&self, start: u64, len: u32) -> Vec<u8> {
        let start = start as usize;
        self.buf[start..start + len as usize].to_vec()
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn owned_bitfield(&self) -> &Bitfield {
        &self.owned
    }
}

pub(crate) type SharedAssembly = Arc<RwLock<Assembly>>;

pub(crate) fn new_shared(
    download_len: u64,
    piece_count: usize,
) -> SharedAssembly {
    Arc::new(RwLock::new(Assembly::new(download_len, piece_count)))
}
