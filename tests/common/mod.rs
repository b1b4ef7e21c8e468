//! Shared fixtures for the mock-peer integration tests in this directory.
//!
//! `peer`, `proto`, `piece`, `coordinator`, `request_server` and `choke` are
//! all private modules, so these tests can only reach the session state
//! machine through `leechcrate`'s public API (`Engine`, `Conf`, `Metainfo`,
//! `Bitfield`) plus a peer standing on the other end of a real TCP socket.
//! The mock peer is hand-rolled against std's blocking `TcpListener`/
//! `TcpStream` rather than `tokio::io::{AsyncReadExt, AsyncWriteExt}`, since
//! the crate doesn't carry the "io-util" tokio feature and pulling it in just
//! for tests isn't worth it when a background OS thread does the job fine.

use std::{
    convert::TryInto,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    path::PathBuf,
    time::Duration,
};

use sha1::{Digest, Sha1};

pub const MSG_CHOKE: u8 = 0;
pub const MSG_UNCHOKE: u8 = 1;
pub const MSG_INTERESTED: u8 = 2;
#[allow(dead_code)]
pub const MSG_NOT_INTERESTED: u8 = 3;
#[allow(dead_code)]
pub const MSG_HAVE: u8 = 4;
pub const MSG_BITFIELD: u8 = 5;
pub const MSG_REQUEST: u8 = 6;
pub const MSG_PIECE: u8 = 7;

const PSTR: &[u8] = b"BitTorrent protocol";
// Short enough that a mock peer's idle tail (once the client has nothing
// left to ask it for but keeps the connection open to seed) exits quickly,
// long enough to comfortably cover every real exchange these tests drive.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);

/// A scratch directory under the OS temp dir, removed on drop. Mirrors the
/// shim already used by `piece::scheduler`'s own tests.
pub struct TempDir(PathBuf);

impl TempDir {
    pub fn new(label: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "leechcrate-itest-{}-{}",
            label,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

pub fn sha1_hash(bytes: &[u8]) -> [u8; 20] {
    let digest = Sha1::digest(bytes);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    hash
}

/// Concatenates the SHA-1 digest of every `piece_len`-sized chunk of
/// `content`, exactly as a `.torrent` file's `pieces` field is laid out.
pub fn piece_hashes(content: &[u8], piece_len: usize) -> Vec<u8> {
    let mut hashes = Vec::new();
    for chunk in content.chunks(piece_len) {
        hashes.extend_from_slice(&sha1_hash(chunk));
    }
    hashes
}

/// The wire bitfield payload for a torrent with every piece set, mirroring
/// `Bitfield::from_payload`'s normalization of the spare trailing bits.
pub fn all_set_bitfield_bytes(piece_count: usize) -> Vec<u8> {
    let byte_len = (piece_count + 7) / 8;
    let mut bytes = vec![0xffu8; byte_len];
    let spare = byte_len * 8 - piece_count;
    if spare > 0 {
        let mask = 0xffu8 << spare;
        *bytes.last_mut().unwrap() &= mask;
    }
    bytes
}

/// Bencodes a single-file `.torrent`, returning its bytes and info hash.
/// `announce_url` is written as the torrent's sole tracker.
pub fn build_torrent_bytes(
    name: &str,
    content: &[u8],
    piece_len: usize,
    announce_url: &str,
) -> (Vec<u8>, [u8; 20]) {
    let info = leechcrate::metainfo::Info {
        name: name.to_string(),
        pieces: piece_hashes(content, piece_len),
        piece_length: piece_len as u64,
        length: Some(content.len() as u64),
        files: None,
        private: None,
    };
    let info_bytes = serde_bencode::to_bytes(&info).unwrap();
    let info_hash = sha1_hash(&info_bytes);

    let mut buf = Vec::new();
    buf.extend_from_slice(b"d8:announce");
    buf.extend_from_slice(announce_url.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(announce_url.as_bytes());
    buf.extend_from_slice(b"4:info");
    buf.extend_from_slice(&info_bytes);
    buf.push(b'e');

    (buf, info_hash)
}

fn compact_peer_bytes(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            bytes.extend_from_slice(&v4.ip().octets());
            bytes.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    bytes
}

fn bencoded_tracker_response(peers: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"d8:intervali1800e5:peers");
    buf.extend_from_slice(peers.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(&peers);
    buf.push(b'e');
    buf
}

/// Registers a mock tracker response at `path` (e.g. "/announce-s1")
/// listing `addrs` as the compact peers field. The returned `Mock` must be
/// kept alive for the duration of the test.
pub fn mock_tracker(path: &str, addrs: &[SocketAddr]) -> mockito::Mock {
    let body = bencoded_tracker_response(compact_peer_bytes(addrs));
    mockito::mock(
        "GET",
        mockito::Matcher::Regex(format!("^{}", path)),
    )
    .with_status(200)
    .with_body(body)
    .create()
}

pub fn tracker_url(path: &str) -> String {
    mockito::server_url() + path
}

/// Reads exactly one 68-byte BEP-3 handshake.
pub fn read_handshake(stream: &mut TcpStream) -> [u8; 68] {
    let mut buf = [0u8; 68];
    stream.read_exact(&mut buf).unwrap();
    buf
}

pub fn handshake_info_hash(hs: &[u8; 68]) -> [u8; 20] {
    hs[28..48].try_into().unwrap()
}

/// Writes a handshake reply carrying `info_hash` and an arbitrary peer id.
pub fn write_handshake(
    stream: &mut TcpStream,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) {
    let mut buf = Vec::with_capacity(68);
    buf.push(19u8);
    buf.extend_from_slice(PSTR);
    buf.extend_from_slice(&[0u8; 8]);
    buf.extend_from_slice(&info_hash);
    buf.extend_from_slice(&peer_id);
    stream.write_all(&buf).unwrap();
}

pub fn write_message(stream: &mut TcpStream, id: u8, payload: &[u8]) {
    let len = (1 + payload.len()) as u32;
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).unwrap();
}

pub fn write_bitfield(stream: &mut TcpStream, bytes: &[u8]) {
    write_message(stream, MSG_BITFIELD, bytes);
}

pub fn write_piece(
    stream: &mut TcpStream,
    piece_index: u32,
    offset: u32,
    data: &[u8],
) {
    let mut payload = Vec::with_capacity(8 + data.len());
    payload.extend_from_slice(&piece_index.to_be_bytes());
    payload.extend_from_slice(&offset.to_be_bytes());
    payload.extend_from_slice(data);
    write_message(stream, MSG_PIECE, &payload);
}

/// One parsed, length-prefixed frame; `None` represents the wire's
/// zero-length keep-alive, which carries no message id.
pub enum RawMessage {
    KeepAlive,
    Msg(u8, Vec<u8>),
}

pub fn read_message(stream: &mut TcpStream) -> std::io::Result<RawMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(RawMessage::KeepAlive);
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(RawMessage::Msg(payload[0], payload[1..].to_vec()))
}

/// Decodes a `Request`/`Cancel` payload into `(piece_index, offset, len)`.
pub fn decode_request(body: &[u8]) -> (u32, u32, u32) {
    let piece_index = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let offset = u32::from_be_bytes(body[4..8].try_into().unwrap());
    let len = u32::from_be_bytes(body[8..12].try_into().unwrap());
    (piece_index, offset, len)
}

pub fn set_socket_timeout(stream: &TcpStream) {
    stream.set_read_timeout(Some(SOCKET_TIMEOUT)).unwrap();
    stream.set_write_timeout(Some(SOCKET_TIMEOUT)).unwrap();
}
