//! Datagram encoding shared by both peers.
//!
//! Every datagram starts with a one byte tag. Control messages are the tag alone,
//! a chat message is the tag followed by a secure frame (`nonce || ciphertext`).

use crate::error::{Error, Result};

const TAG_PUNCH: u8 = 0x01;
const TAG_ACK: u8 = 0x02;
const TAG_KEEPALIVE: u8 = 0x03;
const TAG_CHAT: u8 = 0x10;

/// Largest datagram the receive loop reads.
pub const MAX_DATAGRAM: usize = 65507;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Punch,
    Ack,
    Keepalive,
    /// Encrypted chat payload, see [`crate::crypto::SecureFrame`].
    Chat(Vec<u8>),
}

impl WireMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            WireMessage::Punch => vec![TAG_PUNCH],
            WireMessage::Ack => vec![TAG_ACK],
            WireMessage::Keepalive => vec![TAG_KEEPALIVE],
            WireMessage::Chat(frame) => {
                let mut buf = Vec::with_capacity(frame.len() + 1);
                buf.push(TAG_CHAT);
                buf.extend_from_slice(frame);
                buf
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (&tag, payload) = buf
            .split_first()
            .ok_or_else(|| Error::Malformed("empty datagram".into()))?;

        let control = |msg: WireMessage| {
            if payload.is_empty() {
                Ok(msg)
            } else {
                Err(Error::Malformed(format!(
                    "{} trailing bytes after control tag {:#04x}",
                    payload.len(),
                    tag
                )))
            }
        };

        match tag {
            TAG_PUNCH => control(WireMessage::Punch),
            TAG_ACK => control(WireMessage::Ack),
            TAG_KEEPALIVE => control(WireMessage::Keepalive),
            TAG_CHAT => Ok(WireMessage::Chat(payload.to_vec())),
            _ => Err(Error::Malformed(format!("unknown tag {:#04x}", tag))),
        }
    }

    /// Punch, ack and keepalive; everything the hole punch engine consumes.
    pub fn is_control(&self) -> bool {
        !matches!(self, WireMessage::Chat(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_tags() {
        assert_eq!(WireMessage::Punch.encode(), vec![0x01]);
        assert_eq!(WireMessage::decode(&[0x02]).unwrap(), WireMessage::Ack);
        assert_eq!(WireMessage::decode(&[0x03]).unwrap(), WireMessage::Keepalive);
        assert!(WireMessage::Keepalive.is_control());
    }

    #[test]
    fn test_chat_carries_frame() {
        let frame = vec![7u8; 40];
        let bytes = WireMessage::Chat(frame.clone()).encode();
        assert_eq!(bytes[0], 0x10);
        assert_eq!(bytes.len(), 41);

        let msg = WireMessage::decode(&bytes).unwrap();
        assert!(!msg.is_control());
        assert_eq!(msg, WireMessage::Chat(frame));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(WireMessage::decode(&[]).is_err());
        assert!(WireMessage::decode(&[0x01, 0x00]).is_err());
        assert!(WireMessage::decode(&[0xff]).is_err());
        // legacy ascii control payloads are not valid tags
        assert!(WireMessage::decode(b"PUNCH").is_err());
        assert!(WireMessage::decode(b"ACK").is_err());
    }
}
