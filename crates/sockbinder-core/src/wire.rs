//! Byte-level layout of everything that crosses a connection.
//!
//! All integers are little-endian. A frame is `command: u32`,
//! `body_len: u32`, then `body_len` bytes of command-specific body.
//! Before the first frame, the client sends a [`ConnectionHeader`] and the
//! server answers with a [`ConnectionAck`].

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Version spoken by this implementation.
pub const RPC_WIRE_PROTOCOL_VERSION: u32 = 1;

/// Size of the `command` + `body_len` prefix.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Address reserved for session-level special transactions.
pub const SPECIAL_ADDRESS: u64 = 0;

/// Set on addresses allocated by the server end of a session.
pub const ADDRESS_SERVER_BIT: u64 = 1 << 63;

bitflags! {
    /// Per-transaction flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransactFlags: u32 {
        /// Fire and forget: no reply is sent.
        const ONEWAY = 0x01;
    }
}

bitflags! {
    /// Options carried in a [`ConnectionHeader`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConnectionOptions: u32 {
        /// The connection carries server-to-client calls.
        const REVERSE = 0x01;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated {what}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("unknown command {0}")]
    UnknownCommand(u32),
    #[error("{extra} trailing bytes after {what}")]
    TrailingBytes { what: &'static str, extra: usize },
    #[error("object offset {offset} outside parcel of {len} bytes")]
    BadOffset { offset: u32, len: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Transact = 0,
    Reply = 1,
    DecStrong = 2,
    SessionShutdown = 3,
}

impl Command {
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::Transact),
            1 => Ok(Self::Reply),
            2 => Ok(Self::DecStrong),
            3 => Ok(Self::SessionShutdown),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

/// Parcel contents as carried inside a transaction or reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireParcel {
    pub data: Bytes,
    /// Byte offsets of binder slots within `data`.
    pub offsets: Vec<u32>,
}

impl WireParcel {
    fn encoded_len(&self) -> usize {
        4 + self.data.len() + 4 + 4 * self.offsets.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.put_u32_le(self.offsets.len() as u32);
        for offset in &self.offsets {
            buf.put_u32_le(*offset);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let data_len = take_u32(buf, "parcel length")? as usize;
        ensure(buf, data_len, "parcel data")?;
        let data = buf.split_to(data_len);
        let count = take_u32(buf, "object count")? as usize;
        ensure(buf, count.saturating_mul(4), "object offsets")?;
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = buf.get_u32_le();
            // A binder slot is at least a 4-byte presence marker.
            if offset as usize + 4 > data.len() {
                return Err(WireError::BadOffset {
                    offset,
                    len: data.len(),
                });
            }
            offsets.push(offset);
        }
        Ok(Self { data, offsets })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transact {
    pub address: u64,
    pub code: u32,
    pub flags: TransactFlags,
    pub async_number: u64,
    pub txn_id: u64,
    pub parcel: WireParcel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub txn_id: u64,
    pub status: i32,
    pub parcel: WireParcel,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Transact(Transact),
    Reply(Reply),
    /// Release `amount` strong references. `mentions` is how many messages
    /// naming `address` the sender wrote since its previous `DecStrong` for
    /// it; the owner keeps the object until it has seen all of them.
    DecStrong {
        address: u64,
        amount: u64,
        mentions: u64,
    },
    SessionShutdown,
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Self::Transact(_) => Command::Transact,
            Self::Reply(_) => Command::Reply,
            Self::DecStrong { .. } => Command::DecStrong,
            Self::SessionShutdown => Command::SessionShutdown,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Transact(t) => 8 + 4 + 4 + 8 + 8 + t.parcel.encoded_len(),
            Self::Reply(r) => 8 + 4 + r.parcel.encoded_len(),
            Self::DecStrong { .. } => 24,
            Self::SessionShutdown => 0,
        }
    }

    /// Encode the whole frame, header included.
    pub fn encode(&self) -> BytesMut {
        let body_len = self.body_len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body_len);
        buf.put_u32_le(self.command() as u32);
        buf.put_u32_le(body_len as u32);
        match self {
            Self::Transact(t) => {
                buf.put_u64_le(t.address);
                buf.put_u32_le(t.code);
                buf.put_u32_le(t.flags.bits());
                buf.put_u64_le(t.async_number);
                buf.put_u64_le(t.txn_id);
                t.parcel.encode(&mut buf);
            }
            Self::Reply(r) => {
                buf.put_u64_le(r.txn_id);
                buf.put_i32_le(r.status);
                r.parcel.encode(&mut buf);
            }
            Self::DecStrong {
                address,
                amount,
                mentions,
            } => {
                buf.put_u64_le(*address);
                buf.put_u64_le(*amount);
                buf.put_u64_le(*mentions);
            }
            Self::SessionShutdown => {}
        }
        debug_assert_eq!(buf.len(), FRAME_HEADER_SIZE + body_len);
        buf
    }

    /// Decode a body previously split off by the frame reader.
    pub fn decode(command: Command, mut body: Bytes) -> Result<Self, WireError> {
        let message = match command {
            Command::Transact => {
                ensure(&body, 32, "transaction header")?;
                let address = body.get_u64_le();
                let code = body.get_u32_le();
                let flags = TransactFlags::from_bits_retain(body.get_u32_le());
                let async_number = body.get_u64_le();
                let txn_id = body.get_u64_le();
                let parcel = WireParcel::decode(&mut body)?;
                Self::Transact(Transact {
                    address,
                    code,
                    flags,
                    async_number,
                    txn_id,
                    parcel,
                })
            }
            Command::Reply => {
                ensure(&body, 12, "reply header")?;
                let txn_id = body.get_u64_le();
                let status = body.get_i32_le();
                let parcel = WireParcel::decode(&mut body)?;
                Self::Reply(Reply {
                    txn_id,
                    status,
                    parcel,
                })
            }
            Command::DecStrong => {
                ensure(&body, 24, "dec-strong")?;
                Self::DecStrong {
                    address: body.get_u64_le(),
                    amount: body.get_u64_le(),
                    mentions: body.get_u64_le(),
                }
            }
            Command::SessionShutdown => Self::SessionShutdown,
        };
        if body.has_remaining() {
            return Err(WireError::TrailingBytes {
                what: "frame body",
                extra: body.remaining(),
            });
        }
        Ok(message)
    }
}

/// First bytes a client writes on every new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    pub version: u32,
    pub options: ConnectionOptions,
    /// Zero asks the server for a new session.
    pub session_id: u64,
}

impl ConnectionHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.options.bits());
        buf.put_u64_le(self.session_id);
        out
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < Self::SIZE {
            return Err(WireError::Truncated {
                what: "connection header",
                needed: Self::SIZE,
                remaining: bytes.len(),
            });
        }
        Ok(Self {
            version: bytes.get_u32_le(),
            options: ConnectionOptions::from_bits_retain(bytes.get_u32_le()),
            session_id: bytes.get_u64_le(),
        })
    }
}

/// Server answer to a [`ConnectionHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAck {
    pub version: u32,
    /// Non-zero when the connection was refused.
    pub status: i32,
    pub session_id: u64,
    pub max_threads: u32,
}

impl ConnectionAck {
    pub const SIZE: usize = 20;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.version);
        buf.put_i32_le(self.status);
        buf.put_u64_le(self.session_id);
        buf.put_u32_le(self.max_threads);
        out
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < Self::SIZE {
            return Err(WireError::Truncated {
                what: "connection ack",
                needed: Self::SIZE,
                remaining: bytes.len(),
            });
        }
        Ok(Self {
            version: bytes.get_u32_le(),
            status: bytes.get_i32_le(),
            session_id: bytes.get_u64_le(),
            max_threads: bytes.get_u32_le(),
        })
    }
}

fn ensure(buf: &Bytes, needed: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            what,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn take_u32(buf: &mut Bytes, what: &'static str) -> Result<u32, WireError> {
    ensure(buf, 4, what)?;
    Ok(buf.get_u32_le())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn split(frame: BytesMut) -> (Command, Bytes) {
        let mut frame = frame.freeze();
        let command = Command::from_u32(frame.get_u32_le()).unwrap();
        let len = frame.get_u32_le() as usize;
        assert_eq!(len, frame.len());
        (command, frame)
    }

    #[test]
    fn transact_layout() {
        let message = Message::Transact(Transact {
            address: ADDRESS_SERVER_BIT | 7,
            code: 42,
            flags: TransactFlags::ONEWAY,
            async_number: 3,
            txn_id: 99,
            parcel: WireParcel {
                data: Bytes::from_static(&[1, 0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0]),
                offsets: vec![0],
            },
        });
        let frame = message.encode();
        assert_eq!(&frame[..4], &0u32.to_le_bytes());
        assert_eq!(&frame[8..16], &(ADDRESS_SERVER_BIT | 7).to_le_bytes());

        let (command, body) = split(frame);
        assert_eq!(Message::decode(command, body).unwrap(), message);
    }

    #[test]
    fn housekeeping_messages_decode() {
        for message in [
            Message::DecStrong {
                address: 5,
                amount: 2,
                mentions: 1,
            },
            Message::SessionShutdown,
        ] {
            let (command, body) = split(message.encode());
            assert_eq!(Message::decode(command, body).unwrap(), message);
        }
    }

    #[test]
    fn truncated_reply_is_rejected() {
        let err = Message::decode(Command::Reply, Bytes::from_static(&[0; 6])).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn offsets_must_point_inside_data() {
        let mut body = BytesMut::new();
        body.put_u64_le(1);
        body.put_i32_le(0);
        body.put_u32_le(4);
        body.put_slice(&[0; 4]);
        body.put_u32_le(1);
        body.put_u32_le(2);
        let err = Message::decode(Command::Reply, body.freeze()).unwrap_err();
        assert_eq!(err, WireError::BadOffset { offset: 2, len: 4 });
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut frame = Message::DecStrong {
            address: 1,
            amount: 1,
            mentions: 0,
        }
        .encode();
        frame.put_u8(0);
        let mut frame = frame.freeze();
        frame.advance(FRAME_HEADER_SIZE);
        let err = Message::decode(Command::DecStrong, frame).unwrap_err();
        assert!(matches!(err, WireError::TrailingBytes { extra: 1, .. }));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(Command::from_u32(77), Err(WireError::UnknownCommand(77)));
    }

    #[test]
    fn connection_header_layout() {
        let header = ConnectionHeader {
            version: RPC_WIRE_PROTOCOL_VERSION,
            options: ConnectionOptions::REVERSE,
            session_id: 0xdead_beef,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(ConnectionHeader::decode(&bytes).unwrap(), header);
        assert!(ConnectionAck::decode(&bytes).is_err());
    }
}
