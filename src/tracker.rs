//! Announces to a torrent's tracker(s) over HTTP, per BEP-3 (§4.9).

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

use crate::{error::*, PeerId, Sha1Hash};

/// The port we listen on and announce to trackers, fixed per the spec.
const ANNOUNCE_PORT: u16 = 6881;

/// The tracker's bencoded announce response.
///
/// `peers` is the raw compact string (groups of 4-byte IPv4 + 2-byte port);
/// decoding it into [`SocketAddr`]s is this module's job, not serde's, since
/// its length must be validated first.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    #[serde(with = "serde_bytes", default)]
    peers: Vec<u8>,
}

/// A successful announce.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub peers: Vec<SocketAddr>,
    pub interval: Option<Duration>,
}

/// Announces to each tracker URL in order (the torrent's primary announce
/// URL, then its `announce-list` backups), returning the first response that
/// succeeds.
///
/// Per the backup-tracker failover design note: a transport error, a
/// non-success HTTP status, or an undecodable body are all treated as this
/// tracker having failed, advancing to the next one.
pub async fn announce(
    trackers: &[String],
    info_hash: Sha1Hash,
    peer_id: PeerId,
    left: u64,
) -> Result<AnnounceResponse> {
    if trackers.is_empty() {
        return Err(Error::Tracker("torrent has no trackers".to_string()));
    }

    let mut last_err = None;
    for (i, url) in trackers.iter().enumerate() {
        match announce_one(url, info_hash, peer_id, left).await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                log::warn!(
                    "Tracker {} ({}/{}) failed: {}",
                    url,
                    i + 1,
                    trackers.len(),
                    e
                );
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap())
}

async fn announce_one(
    url: &str,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    left: u64,
) -> Result<AnnounceResponse> {
    // info_hash/peer_id are arbitrary 20-byte strings, not valid UTF-8 in
    // general, so they can't go through reqwest's query-pair builder: build
    // the query string by hand and percent-encode the raw bytes ourselves.
    let full_url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        url,
        percent_encode(&info_hash, NON_ALPHANUMERIC),
        percent_encode(&peer_id, NON_ALPHANUMERIC),
        ANNOUNCE_PORT,
        left,
    );

    log::info!("Announcing to {}", url);
    let resp = reqwest::get(&full_url).await?;
    if !resp.status().is_success() {
        return Err(Error::Tracker(format!(
            "tracker responded with status {}",
            resp.status()
        )));
    }

    let body = resp.bytes().await?;
    let parsed: RawResponse = serde_bencode::from_bytes(&body)?;

    if let Some(reason) = parsed.failure_reason {
        return Err(Error::Tracker(reason));
    }
    if parsed.peers.len() % 6 != 0 {
        return Err(Error::Tracker(format!(
            "peers field length {} is not a multiple of 6",
            parsed.peers.len()
        )));
    }

    let peers = parsed
        .peers
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect();

    Ok(AnnounceResponse {
        peers,
        interval: parsed
            .interval
            .map(|secs| Duration::from_secs(secs.max(0) as u64)),
    })
}
