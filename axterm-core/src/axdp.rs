//! AXDP: the application-layer TLV datagram protocol carried inside AX.25 UI/I frames.
//!
//! Wire form: magic `"AXT1"` followed by a sequence of `type:u8 | length:u16 BE |
//! value[length]` TLVs. Required TLVs (messageType, sessionId, messageId) always
//! come first; optional TLVs follow in a fixed canonical order. Unknown TLV types
//! are preserved in order so a newer peer's extensions survive a round trip
//! through an older implementation.

use crate::capability::AxdpCapability;
use crate::compression::CompressionAlgorithm;

pub const MAGIC: [u8; 4] = *b"AXT1";

// Core TLVs: 0x01-0x1F
const TLV_MESSAGE_TYPE: u8 = 0x01;
const TLV_SESSION_ID: u8 = 0x02;
const TLV_MESSAGE_ID: u8 = 0x03;
const TLV_CHUNK_INDEX: u8 = 0x04;
const TLV_TOTAL_CHUNKS: u8 = 0x05;
const TLV_PAYLOAD: u8 = 0x06;
const TLV_PAYLOAD_CRC32: u8 = 0x07;
const TLV_SACK_BITMAP: u8 = 0x08;
const TLV_METADATA: u8 = 0x09;

// Capability TLVs: 0x20-0x2F
pub(crate) const TLV_CAPABILITIES: u8 = 0x20;
const TLV_ACKED_MESSAGE_ID: u8 = 0x21;

// Compression TLVs: 0x30-0x3F
const TLV_COMPRESSION_ALGORITHM: u8 = 0x30;
const TLV_ORIGINAL_LENGTH: u8 = 0x31;
const TLV_PAYLOAD_COMPRESSED: u8 = 0x32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    FileMeta,
    FileChunk,
    Ack,
    Nack,
    Ping,
    Pong,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => MessageType::Chat,
            2 => MessageType::FileMeta,
            3 => MessageType::FileChunk,
            4 => MessageType::Ack,
            5 => MessageType::Nack,
            6 => MessageType::Ping,
            7 => MessageType::Pong,
            _ => return None,
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            MessageType::Chat => 1,
            MessageType::FileMeta => 2,
            MessageType::FileChunk => 3,
            MessageType::Ack => 4,
            MessageType::Nack => 5,
            MessageType::Ping => 6,
            MessageType::Pong => 7,
        }
    }
}

/// The payload carried by a message, either verbatim or as a compressed block
/// with the metadata needed to safely decompress it (§4.6's size caps apply at
/// the point of decompression, not here - this type just shuttles bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadField {
    Plain(Vec<u8>),
    Compressed {
        algorithm: CompressionAlgorithm,
        original_length: u32,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTlv {
    pub tlv_type: u8,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxdpMessage {
    pub message_type: MessageType,
    pub session_id: u32,
    pub message_id: u32,
    pub capabilities: Option<AxdpCapability>,
    pub acked_message_id: Option<u32>,
    pub chunk_index: Option<u32>,
    pub total_chunks: Option<u32>,
    pub payload: Option<PayloadField>,
    pub payload_crc32: Option<u32>,
    pub sack_bitmap: Option<Vec<u8>>,
    pub metadata: Option<Vec<u8>>,
    pub unknown_tlvs: Vec<UnknownTlv>,
}

impl AxdpMessage {
    pub fn new(message_type: MessageType, session_id: u32, message_id: u32) -> Self {
        Self {
            message_type,
            session_id,
            message_id,
            capabilities: None,
            acked_message_id: None,
            chunk_index: None,
            total_chunks: None,
            payload: None,
            payload_crc32: None,
            sack_bitmap: None,
            metadata: None,
            unknown_tlvs: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        let crc = crate::crc::crc32(&payload);
        self.payload = Some(PayloadField::Plain(payload));
        self.payload_crc32 = Some(crc);
        self
    }
}

// File metadata sub-TLVs, carried inside a `fileMeta` message's `metadata` field.
const FILE_META_FILENAME: u8 = 0x01;
const FILE_META_FILE_SIZE: u8 = 0x02;
const FILE_META_SHA256: u8 = 0x03;
const FILE_META_CHUNK_SIZE: u8 = 0x04;
const FILE_META_DESCRIPTION: u8 = 0x05;

/// The sub-TLVs carried by a `fileMeta` message, encoded into
/// [`AxdpMessage::metadata`]. `filename` and `sha256` are required; the rest
/// are optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaInfo {
    pub filename: String,
    pub file_size: u64,
    pub sha256: [u8; 32],
    pub chunk_size: Option<u16>,
    pub description: Option<String>,
}

impl FileMetaInfo {
    pub fn new(filename: impl Into<String>, file_size: u64, sha256: [u8; 32]) -> Self {
        Self {
            filename: filename.into(),
            file_size,
            sha256,
            chunk_size: None,
            description: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_tlv(&mut out, FILE_META_FILENAME, self.filename.as_bytes());
        push_tlv(&mut out, FILE_META_FILE_SIZE, &self.file_size.to_be_bytes());
        push_tlv(&mut out, FILE_META_SHA256, &self.sha256);
        if let Some(chunk_size) = self.chunk_size {
            push_tlv(&mut out, FILE_META_CHUNK_SIZE, &chunk_size.to_be_bytes());
        }
        if let Some(description) = &self.description {
            push_tlv(&mut out, FILE_META_DESCRIPTION, description.as_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut filename = None;
        let mut file_size = None;
        let mut sha256 = None;
        let mut chunk_size = None;
        let mut description = None;
        for (tlv_type, value) in TlvReader::new(data) {
            match tlv_type {
                FILE_META_FILENAME => filename = std::str::from_utf8(value).ok().map(str::to_owned),
                FILE_META_FILE_SIZE => file_size = Some(u64::from_be_bytes(value.try_into().ok()?)),
                FILE_META_SHA256 => sha256 = value.try_into().ok(),
                FILE_META_CHUNK_SIZE => chunk_size = Some(u16::from_be_bytes(value.try_into().ok()?)),
                FILE_META_DESCRIPTION => {
                    description = std::str::from_utf8(value).ok().map(str::to_owned)
                }
                _ => {}
            }
        }
        Some(Self {
            filename: filename?,
            file_size: file_size?,
            sha256: sha256?,
            chunk_size,
            description,
        })
    }
}

pub(crate) fn push_tlv(out: &mut Vec<u8>, tlv_type: u8, value: &[u8]) {
    out.push(tlv_type);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

/// Iterates `type:u8 | length:u16 BE | value` TLVs, stopping (without error) as
/// soon as a declared length would run past the end of the buffer. Used both
/// for the top-level message and for nested sub-TLV lists (capabilities, file
/// metadata).
pub(crate) struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 3 > self.data.len() {
            return None;
        }
        let tlv_type = self.data[self.pos];
        let len = u16::from_be_bytes([self.data[self.pos + 1], self.data[self.pos + 2]]) as usize;
        let value_start = self.pos + 3;
        if value_start + len > self.data.len() {
            return None;
        }
        let value = &self.data[value_start..value_start + len];
        self.pos = value_start + len;
        Some((tlv_type, value))
    }
}

pub fn encode(msg: &AxdpMessage) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);

    push_tlv(&mut out, TLV_MESSAGE_TYPE, &[msg.message_type.as_u8()]);
    push_tlv(&mut out, TLV_SESSION_ID, &msg.session_id.to_be_bytes());
    push_tlv(&mut out, TLV_MESSAGE_ID, &msg.message_id.to_be_bytes());

    if let Some(caps) = &msg.capabilities {
        let encoded = caps.encode_sub_tlvs();
        push_tlv(&mut out, TLV_CAPABILITIES, &encoded);
    }
    if let Some(acked) = msg.acked_message_id {
        push_tlv(&mut out, TLV_ACKED_MESSAGE_ID, &acked.to_be_bytes());
    }
    if let Some(idx) = msg.chunk_index {
        push_tlv(&mut out, TLV_CHUNK_INDEX, &idx.to_be_bytes());
    }
    if let Some(total) = msg.total_chunks {
        push_tlv(&mut out, TLV_TOTAL_CHUNKS, &total.to_be_bytes());
    }
    match &msg.payload {
        Some(PayloadField::Plain(bytes)) => push_tlv(&mut out, TLV_PAYLOAD, bytes),
        Some(PayloadField::Compressed {
            algorithm,
            original_length,
            data,
        }) => {
            push_tlv(&mut out, TLV_COMPRESSION_ALGORITHM, &[algorithm.as_u8()]);
            push_tlv(&mut out, TLV_ORIGINAL_LENGTH, &original_length.to_be_bytes());
            push_tlv(&mut out, TLV_PAYLOAD_COMPRESSED, data);
        }
        None => {}
    }
    if let Some(crc) = msg.payload_crc32 {
        push_tlv(&mut out, TLV_PAYLOAD_CRC32, &crc.to_be_bytes());
    }
    if let Some(bitmap) = &msg.sack_bitmap {
        push_tlv(&mut out, TLV_SACK_BITMAP, bitmap);
    }
    if let Some(metadata) = &msg.metadata {
        push_tlv(&mut out, TLV_METADATA, metadata);
    }
    for unknown in &msg.unknown_tlvs {
        push_tlv(&mut out, unknown.tlv_type, &unknown.value);
    }
    out
}

#[derive(Default)]
struct PartialMessage {
    message_type: Option<MessageType>,
    session_id: Option<u32>,
    message_id: Option<u32>,
    capabilities: Option<AxdpCapability>,
    acked_message_id: Option<u32>,
    chunk_index: Option<u32>,
    total_chunks: Option<u32>,
    payload_plain: Option<Vec<u8>>,
    compression_algorithm: Option<CompressionAlgorithm>,
    original_length: Option<u32>,
    payload_compressed: Option<Vec<u8>>,
    payload_crc32: Option<u32>,
    sack_bitmap: Option<Vec<u8>>,
    metadata: Option<Vec<u8>>,
    unknown_tlvs: Vec<UnknownTlv>,
}

impl PartialMessage {
    fn finish(self) -> Option<AxdpMessage> {
        let payload = match (self.payload_plain, self.compression_algorithm, self.original_length, self.payload_compressed) {
            (Some(bytes), _, _, _) => Some(PayloadField::Plain(bytes)),
            (None, Some(algorithm), Some(original_length), Some(data)) => {
                Some(PayloadField::Compressed {
                    algorithm,
                    original_length,
                    data,
                })
            }
            _ => None,
        };
        Some(AxdpMessage {
            message_type: self.message_type?,
            session_id: self.session_id?,
            message_id: self.message_id?,
            capabilities: self.capabilities,
            acked_message_id: self.acked_message_id,
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            payload,
            payload_crc32: self.payload_crc32,
            sack_bitmap: self.sack_bitmap,
            metadata: self.metadata,
            unknown_tlvs: self.unknown_tlvs,
        })
    }
}

fn u32_be(value: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(value.try_into().ok()?))
}

/// Decode a complete AXDP message from bytes.
///
/// Fails (returns `None`) only when the magic is missing, there are no TLVs at
/// all, or no `messageType` TLV was found. A truncated buffer (e.g. any strict
/// prefix of a valid encoding) simply yields whatever was accumulated before
/// the cut-off, or `None` if that omitted messageType.
pub fn decode(data: &[u8]) -> Option<AxdpMessage> {
    if data.len() < MAGIC.len() || data[0..MAGIC.len()] != MAGIC {
        return None;
    }
    let mut partial = PartialMessage::default();
    let mut saw_any_tlv = false;
    for (tlv_type, value) in TlvReader::new(&data[MAGIC.len()..]) {
        saw_any_tlv = true;
        match tlv_type {
            TLV_MESSAGE_TYPE => {
                if let Some(&b) = value.first() {
                    partial.message_type = MessageType::from_u8(b);
                }
            }
            TLV_SESSION_ID => partial.session_id = u32_be(value),
            TLV_MESSAGE_ID => partial.message_id = u32_be(value),
            TLV_CAPABILITIES => partial.capabilities = AxdpCapability::decode_sub_tlvs(value),
            TLV_ACKED_MESSAGE_ID => partial.acked_message_id = u32_be(value),
            TLV_CHUNK_INDEX => partial.chunk_index = u32_be(value),
            TLV_TOTAL_CHUNKS => partial.total_chunks = u32_be(value),
            TLV_PAYLOAD => partial.payload_plain = Some(value.to_vec()),
            TLV_COMPRESSION_ALGORITHM => {
                partial.compression_algorithm = value.first().and_then(|b| CompressionAlgorithm::from_u8(*b))
            }
            TLV_ORIGINAL_LENGTH => partial.original_length = u32_be(value),
            TLV_PAYLOAD_COMPRESSED => partial.payload_compressed = Some(value.to_vec()),
            TLV_PAYLOAD_CRC32 => partial.payload_crc32 = u32_be(value),
            TLV_SACK_BITMAP => partial.sack_bitmap = Some(value.to_vec()),
            TLV_METADATA => partial.metadata = Some(value.to_vec()),
            other => partial.unknown_tlvs.push(UnknownTlv {
                tlv_type: other,
                value: value.to_vec(),
            }),
        }
    }
    if !saw_any_tlv {
        return None;
    }
    partial.finish()
}
