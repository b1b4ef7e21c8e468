use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, BlockInfo, PieceIndex};

const LEN_PREFIX_LEN: usize = 4;

/// The numeric message ID that prefixes every non-keep-alive message's
/// payload, per BEP-3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Choke),
            1 => Some(Self::Unchoke),
            2 => Some(Self::Interested),
            3 => Some(Self::NotInterested),
            4 => Some(Self::Have),
            5 => Some(Self::Bitfield),
            6 => Some(Self::Request),
            7 => Some(Self::Piece),
            8 => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// A single protocol message, after the handshake has completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    /// Length-0 message with no ID; merely keeps the connection alive.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Announces that the sender now has the given piece.
    Have { piece_index: PieceIndex },
    /// The raw bitfield payload; the caller is responsible for validating
    /// its length against the torrent's piece count (the codec doesn't
    /// carry that context) and turning it into a [`crate::Bitfield`].
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns this message's wire ID, or `None` for the ID-less keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Encodes and decodes the length-prefixed [`Message`] stream that follows
/// a successful handshake.
pub(crate) struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(LEN_PREFIX_LEN);
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.reserve(LEN_PREFIX_LEN + 1);
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.reserve(LEN_PREFIX_LEN + 1 + 4);
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bytes) => {
                buf.reserve(LEN_PREFIX_LEN + 1 + bytes.len());
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) | Message::Cancel(block) => {
                let id = msg.id().unwrap();
                buf.reserve(LEN_PREFIX_LEN + 1 + 12);
                buf.put_u32(1 + 12);
                buf.put_u8(id as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.reserve(LEN_PREFIX_LEN + 1 + 8 + data.len());
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < LEN_PREFIX_LEN {
            return Ok(None);
        }

        let mut len_buf = &buf[..LEN_PREFIX_LEN];
        let len = len_buf.get_u32() as usize;

        if len == 0 {
            buf.advance(LEN_PREFIX_LEN);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < LEN_PREFIX_LEN + len {
            buf.reserve(LEN_PREFIX_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(LEN_PREFIX_LEN);
        let id = buf[0];
        buf.advance(1);
        let payload_len = len - 1;

        let id = MessageId::from_u8(id).ok_or_else(|| {
            Error::MalformedMessage(format!("unknown message id: {}", id))
        })?;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload_len != 4 {
                    return Err(Error::MalformedMessage(
                        "have payload must be 4 bytes".to_string(),
                    ));
                }
                let piece_index = (&buf[..4]).get_u32() as PieceIndex;
                buf.advance(4);
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bytes = buf[..payload_len].to_vec();
                buf.advance(payload_len);
                Message::Bitfield(bytes)
            }
            MessageId::Request | MessageId::Cancel => {
                if payload_len != 12 {
                    return Err(Error::MalformedMessage(
                        "request/cancel payload must be 12 bytes".to_string(),
                    ));
                }
                let piece_index = (&buf[0..4]).get_u32() as PieceIndex;
                let offset = (&buf[4..8]).get_u32();
                let len = (&buf[8..12]).get_u32();
                buf.advance(12);
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len,
                };
                if id == MessageId::Request {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(Error::MalformedMessage(
                        "piece payload shorter than its header".to_string(),
                    ));
                }
                let piece_index = (&buf[0..4]).get_u32() as PieceIndex;
                let offset = (&buf[4..8]).get_u32();
                let data = buf[8..payload_len].to_vec();
                buf.advance(payload_len);
                Message::Piece {
                    piece_index,
                    offset,
                    data,
                }
            }
        };

        Ok(Some(msg))
    }
}
