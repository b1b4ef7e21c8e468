use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, PeerId, Sha1Hash};

/// The protocol string sent in every handshake, per BEP-3.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

const RESERVED_LEN: usize = 8;
const HANDSHAKE_LEN: usize =
    1 + PROTOCOL_STRING.len() + RESERVED_LEN + 20 + 20;

/// The first message exchanged on a peer connection, before any
/// length-prefixed messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; RESERVED_LEN],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; RESERVED_LEN],
            info_hash,
            peer_id,
        }
    }
}

/// Encodes and decodes [`Handshake`] messages.
///
/// This codec is used only for the first exchange on a connection; once the
/// handshake completes the socket is handed over to a [`MessageCodec`](
/// super::MessageCodec) via `Framed::into_parts`/`FramedParts`.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(prot.len() as u8);
        buf.put_slice(&prot);
        buf.put_slice(&reserved);
        buf.put_slice(&info_hash);
        buf.put_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 1 {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::Handshake(format!(
                "invalid protocol string length: {}",
                prot_len
            )));
        }

        let total_len = 1 + prot_len + RESERVED_LEN + 20 + 20;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(1);

        let mut prot = [0; 19];
        prot.copy_from_slice(&buf[..prot_len]);
        buf.advance(prot_len);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::Handshake(
                "invalid protocol string".to_string(),
            ));
        }

        let mut reserved = [0; RESERVED_LEN];
        reserved.copy_from_slice(&buf[..RESERVED_LEN]);
        buf.advance(RESERVED_LEN);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[..20]);
        buf.advance(20);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let info_hash = [1; 20];
        let peer_id = [2; 20];
        let handshake = Handshake::new(info_hash, peer_id);

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_wrong_protocol_string_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(5);
        buf.put_slice(&[0; 5]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn decode_waits_for_more_bytes() {
        let info_hash = [1; 20];
        let peer_id = [2; 20];
        let handshake = Handshake::new(info_hash, peer_id);
        let mut full = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..10]);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }
}
