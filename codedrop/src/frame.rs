//! Binary data-channel framing.
//!
//! Every message on a data channel is a fixed 16-byte header followed by the
//! payload. Integers are big-endian. The header checksum is a cheap 16-bit
//! wrap-around sum over the leading payload bytes; end-to-end integrity is
//! provided by the AEAD tag and the whole-file digest, not by this field.

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use bytes::Bytes;
use std::{fmt, io};

use crate::seq::Seq;

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Number of leading payload bytes covered by the header checksum.
pub const CHECKSUM_SPAN: usize = 100;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// An encrypted file chunk.
    Data,
    /// Single-sequence acknowledgement.
    Ack,
    /// Selective acknowledgement with coalesced ranges.
    Sack,
    /// Ack-less streaming data. Decoded for wire compatibility; the receiver
    /// rejects it as unsupported.
    VideoData,
    /// Forward error correction frame. Decoded but unused.
    Fec,
    /// Control record routed over a data channel.
    Control,
}

impl FrameKind {
    const ID_DATA: u8 = 1;
    const ID_ACK: u8 = 2;
    const ID_SACK: u8 = 3;
    const ID_VIDEO_DATA: u8 = 4;
    const ID_FEC: u8 = 5;
    const ID_CONTROL: u8 = 6;
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> Self {
        match kind {
            FrameKind::Data => FrameKind::ID_DATA,
            FrameKind::Ack => FrameKind::ID_ACK,
            FrameKind::Sack => FrameKind::ID_SACK,
            FrameKind::VideoData => FrameKind::ID_VIDEO_DATA,
            FrameKind::Fec => FrameKind::ID_FEC,
            FrameKind::Control => FrameKind::ID_CONTROL,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::ID_DATA => Ok(Self::Data),
            Self::ID_ACK => Ok(Self::Ack),
            Self::ID_SACK => Ok(Self::Sack),
            Self::ID_VIDEO_DATA => Ok(Self::VideoData),
            Self::ID_FEC => Ok(Self::Fec),
            Self::ID_CONTROL => Ok(Self::Control),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A frame decoding error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    /// The message is shorter than the fixed header.
    HeaderTooShort,
    /// Unknown frame type tag.
    UnknownKind(u8),
    /// The message length does not match the header payload length.
    LengthMismatch {
        /// Sequence number of the truncated or padded frame.
        seq: Seq,
        /// Payload length announced by the header.
        announced: u32,
        /// Payload length actually present.
        actual: usize,
    },
    /// The payload checksum does not match the header.
    ChecksumMismatch {
        /// Sequence number of the corrupted frame.
        seq: Seq,
    },
    /// The payload of a SACK frame is malformed.
    MalformedSack,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::HeaderTooShort => write!(f, "frame shorter than header"),
            Self::UnknownKind(tag) => write!(f, "unknown frame type {tag}"),
            Self::LengthMismatch { seq, announced, actual } => {
                write!(f, "seq {seq} announced payload length {announced} but got {actual}")
            }
            Self::ChecksumMismatch { seq } => write!(f, "checksum mismatch for seq {seq}"),
            Self::MalformedSack => write!(f, "malformed SACK payload"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Per-frame flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// The chunk is the last of the file.
    pub const IS_LAST: Self = Self(0b0000_0001);
    /// The payload is AEAD ciphertext.
    pub const IS_ENCRYPTED: Self = Self(0b0000_0010);

    /// Whether all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both flag sets.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// 16-bit wrap-around sum over the first [`CHECKSUM_SPAN`] payload bytes.
pub fn checksum(payload: &[u8]) -> u16 {
    payload.iter().take(CHECKSUM_SPAN).fold(0u16, |sum, b| sum.wrapping_add(*b as u16))
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type.
    pub kind: FrameKind,
    /// Sequence number.
    pub seq: Seq,
    /// Payload length in bytes.
    pub len: u32,
    /// Byte offset of the chunk within the file.
    pub offset: u32,
    /// Flags.
    pub flags: FrameFlags,
    /// Payload checksum.
    pub checksum: u16,
}

impl FrameHeader {
    fn write(&self, mut writer: impl io::Write) -> Result<(), io::Error> {
        writer.write_u8(self.kind.into())?;
        writer.write_u32::<BE>(self.seq.into())?;
        writer.write_u32::<BE>(self.len)?;
        writer.write_u32::<BE>(self.offset)?;
        writer.write_u8(self.flags.0)?;
        writer.write_u16::<BE>(self.checksum)?;
        Ok(())
    }

    fn read(mut reader: impl io::Read) -> Result<Self, FrameError> {
        let mut buf = [0; HEADER_LEN];
        reader.read_exact(&mut buf).map_err(|_| FrameError::HeaderTooShort)?;
        let mut buf = &buf[..];
        Ok(Self {
            kind: FrameKind::try_from(buf.read_u8().unwrap())?,
            seq: buf.read_u32::<BE>().unwrap().into(),
            len: buf.read_u32::<BE>().unwrap(),
            offset: buf.read_u32::<BE>().unwrap(),
            flags: FrameFlags(buf.read_u8().unwrap()),
            checksum: buf.read_u16::<BE>().unwrap(),
        })
    }
}

/// A frame as it travels over a data channel.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header.
    pub header: FrameHeader,
    /// Payload bytes following the header.
    pub payload: Bytes,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.header.kind)
            .field("seq", &self.header.seq)
            .field("len", &self.header.len)
            .field("offset", &self.header.offset)
            .field("flags", &self.header.flags)
            .finish()
    }
}

impl Frame {
    /// Builds a DATA frame around a chunk payload, computing length and checksum.
    pub fn data(seq: Seq, offset: u32, is_last: bool, encrypted: bool, payload: Bytes) -> Self {
        let mut flags = FrameFlags::default();
        if is_last {
            flags = flags.with(FrameFlags::IS_LAST);
        }
        if encrypted {
            flags = flags.with(FrameFlags::IS_ENCRYPTED);
        }
        Self {
            header: FrameHeader {
                kind: FrameKind::Data,
                seq,
                len: payload.len() as u32,
                offset,
                flags,
                checksum: checksum(&payload),
            },
            payload,
        }
    }

    /// Encodes the frame into a single wire message.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.header.write(&mut buf).unwrap();
        buf.extend_from_slice(&self.payload);
        buf.into()
    }

    /// Decodes a wire message.
    ///
    /// A message whose size disagrees with the announced payload length, or
    /// whose payload fails the checksum, is a hard framing error; the caller
    /// requests a retransmission of the affected sequence number.
    pub fn decode(src: Bytes) -> Result<Self, FrameError> {
        let header = FrameHeader::read(src.as_ref())?;
        let payload = src.slice(HEADER_LEN..);
        if payload.len() != header.len as usize {
            return Err(FrameError::LengthMismatch {
                seq: header.seq,
                announced: header.len,
                actual: payload.len(),
            });
        }
        if checksum(&payload) != header.checksum {
            return Err(FrameError::ChecksumMismatch { seq: header.seq });
        }
        Ok(Self { header, payload })
    }

    /// Whether the chunk is marked as the last of the file.
    pub fn is_last(&self) -> bool {
        self.header.flags.contains(FrameFlags::IS_LAST)
    }

    /// Whether the payload is AEAD ciphertext.
    pub fn is_encrypted(&self) -> bool {
        self.header.flags.contains(FrameFlags::IS_ENCRYPTED)
    }
}

/// Selective acknowledgement: a cumulative lower bound plus coalesced
/// inclusive ranges of received sequence numbers above it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sack {
    /// All sequence numbers below this have been received.
    pub cumulative: Seq,
    /// Received ranges above the cumulative bound, inclusive on both ends.
    pub ranges: Vec<(Seq, Seq)>,
}

impl Sack {
    /// Builds a SACK from an unordered list of received sequence numbers and
    /// the receiver's next expected sequence, coalescing adjacent numbers.
    pub fn from_sequences(next_expected: Seq, mut seqs: Vec<Seq>) -> Self {
        seqs.sort_unstable();
        seqs.dedup();

        let mut ranges: Vec<(Seq, Seq)> = Vec::new();
        for seq in seqs {
            match ranges.last_mut() {
                Some((_, end)) if seq.0 == end.0.wrapping_add(1) => *end = seq,
                Some((_, end)) if seq <= *end => (),
                _ => ranges.push((seq, seq)),
            }
        }
        Self { cumulative: next_expected, ranges }
    }

    /// Iterates over every sequence number covered by the ranges.
    pub fn sequences(&self) -> impl Iterator<Item = Seq> + '_ {
        self.ranges.iter().flat_map(|(start, end)| (start.0..=end.0).map(Seq))
    }

    /// Encodes the SACK as a frame payload.
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = Vec::with_capacity(6 + self.ranges.len() * 8);
        buf.write_u32::<BE>(self.cumulative.into()).unwrap();
        buf.write_u16::<BE>(self.ranges.len() as u16).unwrap();
        for (start, end) in &self.ranges {
            buf.write_u32::<BE>((*start).into()).unwrap();
            buf.write_u32::<BE>((*end).into()).unwrap();
        }
        buf.into()
    }

    /// Decodes a SACK frame payload.
    pub fn decode_payload(src: Bytes) -> Result<Self, FrameError> {
        let mut reader = src.as_ref();
        let cumulative = Seq(reader.read_u32::<BE>().map_err(|_| FrameError::MalformedSack)?);
        let count = reader.read_u16::<BE>().map_err(|_| FrameError::MalformedSack)? as usize;
        if reader.len() != count * 8 {
            return Err(FrameError::MalformedSack);
        }
        let mut ranges = Vec::with_capacity(count);
        for _ in 0..count {
            let start = Seq(reader.read_u32::<BE>().map_err(|_| FrameError::MalformedSack)?);
            let end = Seq(reader.read_u32::<BE>().map_err(|_| FrameError::MalformedSack)?);
            if end < start {
                return Err(FrameError::MalformedSack);
            }
            ranges.push((start, end));
        }
        Ok(Self { cumulative, ranges })
    }

    /// Wraps the SACK into a frame for transmission on a data channel.
    pub fn into_frame(self) -> Frame {
        let payload = self.encode_payload();
        Frame {
            header: FrameHeader {
                kind: FrameKind::Sack,
                seq: self.cumulative,
                len: payload.len() as u32,
                offset: 0,
                flags: FrameFlags::default(),
                checksum: checksum(&payload),
            },
            payload,
        }
    }
}
