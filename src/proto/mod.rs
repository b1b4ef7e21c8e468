//! The wire protocol: the handshake and the length-prefixed message stream
//! that follows it (BEP-3).

mod handshake;
mod message;

pub(crate) use handshake::{Handshake, HandshakeCodec, PROTOCOL_STRING};
pub(crate) use message::{Message, MessageCodec, MessageId};
