//! Tessera wire format.
//!
//! A TCP stream carries a sequence of frames. Each frame is a fixed 8-byte
//! header followed by one MessagePack-encoded `TransportPacket`. The header
//! is #[repr(C, packed)] with zerocopy derives, so reading it needs no
//! allocation and no unsafe code.
//!
//! The receive buffer is treated as a byte stream: `has_full_packet` says
//! whether a complete frame is buffered, `decode_packet` consumes exactly one.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::capsule::{array_serde, bytes_serde};
use crate::codec::{self, CodecError};
use crate::crypto::{SealedBox, CHALLENGE_LEN};

// ── Frame header ──────────────────────────────────────────────────────────────

/// Precedes every transport packet on the stream.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Always `FRAME_MAGIC`. Anything else means the stream is desynchronised.
    pub magic: [u8; 2],

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Body length in bytes, little-endian.
    pub length: [u8; 4],
}

assert_eq_size!(FrameHeader, [u8; 8]);

impl FrameHeader {
    pub fn new(length: u32) -> Self {
        Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            flags: 0,
            length: length.to_le_bytes(),
        }
    }

    pub fn body_len(&self) -> usize {
        u32::from_le_bytes(self.length) as usize
    }

    fn validate(&self) -> Result<(), WireError> {
        if self.magic != FRAME_MAGIC {
            return Err(WireError::BadMagic(self.magic));
        }
        if self.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        if self.body_len() > MAX_FRAME {
            return Err(WireError::FrameTooLarge(self.body_len()));
        }
        Ok(())
    }
}

pub const FRAME_MAGIC: [u8; 2] = *b"TS";

pub const FRAME_VERSION: u8 = 0x01;

pub const FRAME_HEADER_LEN: usize = 8;

/// Largest frame body a receiver will buffer. Larger frames are a protocol
/// error and close the connection.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

// ── Transport packet ──────────────────────────────────────────────────────────

/// Transport id for packets whose data is an encoded [`EncryptedPacket`].
pub const TRANSPORT_ENCRYPTED: &str = "encrypted";

/// Transport id for packets whose data is a raw bundle. Only accepted by
/// listeners configured to allow it.
pub const TRANSPORT_PLAIN: &str = "plain";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportPacket {
    pub transport_id: String,
    #[serde(with = "bytes_serde")]
    pub data: Vec<u8>,
}

impl TransportPacket {
    pub fn encrypted(packet: &EncryptedPacket) -> Result<Self, WireError> {
        Ok(Self {
            transport_id: TRANSPORT_ENCRYPTED.to_string(),
            data: codec::encode(packet)?,
        })
    }

    pub fn plain(data: Vec<u8>) -> Self {
        Self {
            transport_id: TRANSPORT_PLAIN.to_string(),
            data,
        }
    }
}

/// Frame a packet for the stream.
pub fn encode_packet(packet: &TransportPacket) -> Result<Vec<u8>, WireError> {
    let body = codec::encode(packet)?;
    if body.len() > MAX_FRAME {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    let header = FrameHeader::new(body.len() as u32);
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Whether `buf` begins with a complete frame.
///
/// A malformed header is reported as an error as soon as its 8 bytes are
/// buffered; there is no way to resynchronise after that.
pub fn has_full_packet(buf: &[u8]) -> Result<bool, WireError> {
    let Some(header) = FrameHeader::read_from_prefix(buf) else {
        return Ok(false);
    };
    header.validate()?;
    Ok(buf.len() >= FRAME_HEADER_LEN + header.body_len())
}

/// Consume one frame from the front of `buf`.
///
/// Returns `Ok(None)` if the frame is not complete yet; the buffer is left
/// untouched in that case.
pub fn decode_packet(buf: &mut BytesMut) -> Result<Option<TransportPacket>, WireError> {
    if !has_full_packet(buf)? {
        return Ok(None);
    }
    let Some(header) = FrameHeader::read_from_prefix(&buf[..]) else {
        return Ok(None);
    };
    let len = header.body_len();
    buf.advance(FRAME_HEADER_LEN);
    let body = buf.split_to(len);
    Ok(Some(codec::decode(&body)?))
}

// ── Encrypted packet ──────────────────────────────────────────────────────────

/// Contents of an `"encrypted"` transport packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptedPacket {
    /// First packet of a session. Carries the AES session key wrapped with
    /// the responder's RSA public key.
    Initial {
        #[serde(with = "bytes_serde")]
        encrypted_session_key: Vec<u8>,
        sealed: SealedBox,
    },
    /// Every later packet, in both directions.
    Subsequent(SealedBox),
}

impl EncryptedPacket {
    pub fn sealed(&self) -> &SealedBox {
        match self {
            Self::Initial { sealed, .. } => sealed,
            Self::Subsequent(sealed) => sealed,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        Ok(codec::decode(data)?)
    }
}

// ── Session messages ──────────────────────────────────────────────────────────

/// Plaintext of an encrypted packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// An encoded bundle carrying an RPC message.
    Payload(#[serde(with = "bytes_serde")] Vec<u8>),

    /// Responder asks the initiator to prove key possession.
    PopChallenge {
        #[serde(with = "array_serde")]
        challenge: [u8; CHALLENGE_LEN],
    },

    /// One signature per identity the initiator holds.
    PopResponse {
        #[serde(with = "array_serde")]
        challenge: [u8; CHALLENGE_LEN],
        pop_records: Vec<PopRecord>,
    },
}

impl SessionMessage {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(codec::encode(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(codec::decode(bytes)?)
    }
}

/// Proof that the sender holds the private half of `public_key_der`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopRecord {
    #[serde(with = "bytes_serde")]
    pub public_key_der: Vec<u8>,
    /// RSA-PSS(SHA-256) over the challenge bytes.
    #[serde(with = "bytes_serde")]
    pub signature: Vec<u8>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame length {0} exceeds maximum {}", MAX_FRAME)]
    FrameTooLarge(usize),

    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("encode failed: {0}")]
    Encode(#[source] CodecError),

    #[error("decode failed: {0}")]
    Decode(#[source] CodecError),

    #[error("unknown transport id: {0:?}")]
    UnknownTransport(String),
}

impl From<CodecError> for WireError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Encode(_) => Self::Encode(e),
            CodecError::Decode(_) => Self::Decode(e),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
