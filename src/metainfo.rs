//! Parsing of `.torrent` metainfo files (BEP-3).
//!
//! The info hash is computed by re-serializing the parsed `info` dictionary
//! and hashing the result. This only produces the byte-identical hash the
//! original publisher intended because bencode dictionaries are required to
//! have their keys in lexicographic order, so a decode-then-encode round
//! trip reproduces the exact bytes that were originally hashed.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

/// A parsed `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,

    /// The tracker's primary announce URL.
    pub announce: Option<String>,

    /// Backup tracker tiers, per BEP-12. Each inner vector is a tier of
    /// trackers considered equivalent; tiers are tried in order.
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes.
    ///
    /// Rejects a `pieces` field whose length isn't a multiple of 20 (the
    /// length of a SHA-1 digest), or one that's empty, before any network
    /// activity starts.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        if metainfo.info.pieces.is_empty() {
            return Err(Error::Metainfo("torrent has no pieces".into()));
        }
        if metainfo.info.pieces.len() % 20 != 0 {
            return Err(Error::Metainfo(
                "pieces field length is not a multiple of 20".into(),
            ));
        }
        Ok(metainfo)
    }

    /// Computes the torrent's info hash, the SHA-1 digest of the bencoded
    /// `info` dictionary, used to identify the torrent to trackers and
    /// peers.
    pub fn info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the expected SHA-1 hash of the piece at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let start = index * 20;
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[start..start + 20]);
        hash
    }

    /// Returns every tracker URL worth announcing to, primary announce
    /// first, followed by each backup tier's URLs in order. Used to drive
    /// failover when a tracker is unreachable or keeps erroring out.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        urls
    }

    /// Builds the on-disk file structure this torrent describes, with paths
    /// relative to the eventual download directory (see
    /// [`storage_info::StorageInfo`]).
    pub fn build_fs_structure(&self) -> FsStructure {
        match &self.info.files {
            None => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len: self.info.length.unwrap_or(0),
                torrent_offset: 0,
            }),
            Some(files) => {
                let mut torrent_offset = 0;
                let files = files
                    .iter()
                    .map(|file| {
                        let path: PathBuf = file.path.iter().collect();
                        let info = FileInfo {
                            path,
                            len: file.length as u64,
                            torrent_offset,
                        };
                        torrent_offset += info.len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
        }
    }
}

/// The `info` dictionary of a metainfo file.
///
/// Field order matters here: it must match the order the original publisher
/// serialized the dictionary in (lexicographic, per BEP-3), or else
/// [`Metainfo::info_hash`] would produce a different hash than the one
/// trackers and peers expect.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

/// A single file entry in a multi-file torrent's `info.files` list.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}
