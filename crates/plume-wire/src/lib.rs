// Wire format for the sequencer feed: framing plus message bodies.
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const MAGIC: u32 = 0x504C4D46;
pub const VERSION: u16 = 1;
// Handshake protocol version carried in Hello; bumped independently of the
// frame layout version above.
pub const PROTOCOL_VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    // Create a header with the current protocol constants. Flags are
    // reserved; every frame currently carries 0.
    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Always encode in network byte order for portability.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn encode_into(&self, buf: &mut [u8; Self::LEN]) {
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use plume_wire::Frame;
///
/// let frame = Frame::new(0, Bytes::from_static(b"hello")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        // Pre-allocate the exact size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        // Split header and payload based on the declared length.
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Outcome of comparing a message's claimed block hash to a locally
/// computed one. A mismatch is advisory: consumers log it and keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHashCheck {
    Match,
    Mismatch,
    Unclaimed,
}

/// One sequenced feed message.
///
/// The payload is opaque to the feed core; `block_hash` is the producer's
/// claim for the block this message will produce, and is advisory only.
/// Replay of the same sequence number is byte-identical.
///
/// ```
/// use bytes::Bytes;
/// use plume_wire::FeedMessage;
///
/// let message = FeedMessage::new(1, Bytes::from_static(b"tx"), None);
/// assert_eq!(message.sequence_number, 1);
/// assert!(message.signature.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMessage {
    pub sequence_number: u64,
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
    #[serde(
        with = "base64_opt_hash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub block_hash: Option<[u8; 32]>,
    #[serde(
        with = "base64_option_bytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub signature: Option<Bytes>,
}

impl FeedMessage {
    pub fn new(sequence_number: u64, payload: Bytes, block_hash: Option<[u8; 32]>) -> Self {
        Self {
            sequence_number,
            payload,
            block_hash,
            signature: None,
        }
    }

    // Approximate retained size, used for backlog byte accounting.
    pub fn wire_len(&self) -> usize {
        let signature = self.signature.as_ref().map(Bytes::len).unwrap_or(0);
        let block_hash = if self.block_hash.is_some() { 32 } else { 0 };
        8 + self.payload.len() + block_hash + signature
    }

    pub fn check_block_hash(&self, computed: [u8; 32]) -> BlockHashCheck {
        match self.block_hash {
            None => BlockHashCheck::Unclaimed,
            Some(claimed) if claimed == computed => BlockHashCheck::Match,
            Some(_) => BlockHashCheck::Mismatch,
        }
    }
}

/// Batch of feed messages sent as one wire unit.
///
/// `confirmed_sequence` announces the newest sequence number the producer
/// considers settled on the parent chain, so receivers may prune replay
/// state up to and including it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub messages: Vec<FeedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_sequence: Option<u64>,
}

impl Envelope {
    pub fn new(messages: Vec<FeedMessage>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            messages,
            confirmed_sequence: None,
        }
    }

    pub fn confirmation(confirmed_sequence: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            messages: Vec::new(),
            confirmed_sequence: Some(confirmed_sequence),
        }
    }
}

/// Feed wire messages encoded in framed payloads.
///
/// ```
/// use plume_wire::Message;
///
/// let message = Message::Resume {
///     from_sequence: Some(42),
/// };
/// let frame = message.encode().expect("encode");
/// let decoded = Message::decode(frame).expect("decode");
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // Client's first message: where to start the stream. None means
    // "from now".
    Resume {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_sequence: Option<u64>,
    },
    // Server handshake; clients reject incompatible versions before
    // reading anything else. `head` is the newest retained sequence, if
    // the feed has produced anything yet.
    Hello {
        version: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        head: Option<u64>,
    },
    // Requested resume point has fallen out of backlog retention; the
    // client must resync out of band.
    Unavailable {
        oldest: u64,
        requested: u64,
    },
    // Catch-up and live delivery both use the same envelope.
    Feed(Envelope),
    // Protocol-level error for invalid requests or unexpected message types.
    Error {
        message: String,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Frame> {
        // JSON-encode into a framed payload.
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(0, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }
}

mod base64_bytes {
    use super::*;
    use serde::de::Error;

    // Encode Bytes as base64 string for JSON payloads.
    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Decode base64 string into Bytes.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

mod base64_option_bytes {
    use super::*;
    use serde::de::Error;

    // Encode Option<Bytes> as nullable base64 string.
    pub fn serialize<S>(
        value: &Option<Bytes>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match value {
            Some(bytes) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                serializer.serialize_some(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    // Decode optional base64 string into Option<Bytes>.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Bytes>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(value) => base64::engine::general_purpose::STANDARD
                .decode(value.as_bytes())
                .map(|decoded| Some(Bytes::from(decoded)))
                .map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

mod base64_opt_hash {
    use super::*;
    use serde::de::Error;

    // Encode Option<[u8; 32]> as nullable base64 string.
    pub fn serialize<S>(
        value: &Option<[u8; 32]>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match value {
            Some(hash) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(hash);
                serializer.serialize_some(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    // Decode optional base64 string into Option<[u8; 32]>.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<[u8; 32]>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(value) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(value.as_bytes())
                    .map_err(D::Error::custom)?;
                let hash: [u8; 32] = decoded
                    .as_slice()
                    .try_into()
                    .map_err(|_| D::Error::custom("block hash must be 32 bytes"))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }
}
