//! Realtime update packet codec.
//!
//! The Protect updates socket delivers one binary message per update.
//! Each message is a *packet* made of two *frames*, and every frame starts
//! with the same 8-byte header:
//!
//! | Offset | Width | Meaning                                                   |
//! |--------|-------|-----------------------------------------------------------|
//! | 0      | 1     | frame kind: `1` header frame, `2` payload frame           |
//! | 1      | 1     | payload format: `1` JSON, `2` UTF-8 text, `3` raw bytes   |
//! | 2      | 1     | `0` plain, `1` zlib-deflated                              |
//! | 3      | 1     | reserved, always `0`                                      |
//! | 4..8   | 4     | big-endian length of the bytes that follow this header   |
//!
//! The header frame always carries a JSON object naming the action, the
//! device id, its model key and a per-update id. The payload frame carries
//! the update itself; for JSON payloads that is a partial object of the
//! bootstrap entry indexed by `modelKey`.
//!
//! Decoding never panics: every malformed input maps to a [`DecodeError`]
//! so the socket reader can log and move on to the next message.

use std::borrow::Cow;
use std::io::{self, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the header that prefixes every frame.
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on an inflated frame body. Real updates are a few KiB.
pub const MAX_INFLATED_LEN: u64 = 16 * 1024 * 1024;

const OFFSET_KIND: usize = 0;
const OFFSET_FORMAT: usize = 1;
const OFFSET_DEFLATED: usize = 2;
const OFFSET_SIZE: usize = 4;

// ── Wire enumerations ────────────────────────────────────────────────

/// Position of a frame within a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Header = 1,
    Payload = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Header),
            2 => Ok(Self::Payload),
            other => Err(other),
        }
    }
}

/// Encoding of the bytes carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadFormat {
    Json = 1,
    Text = 2,
    Bytes = 3,
}

impl TryFrom<u8> for PayloadFormat {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Json),
            2 => Ok(Self::Text),
            3 => Ok(Self::Bytes),
            other => Err(other),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────

/// Why a packet could not be decoded. Never fatal to the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The packet is shorter or longer than its size fields declare.
    #[error("packet length {actual} does not match header information (expected {expected})")]
    LengthMismatch { expected: usize, actual: usize },

    /// A frame carried the wrong kind byte for its position.
    #[error("expected {expected:?} frame, found kind {found}")]
    UnexpectedFrameKind { expected: FrameKind, found: u8 },

    /// The deflated frame body could not be inflated.
    #[error("failed to inflate frame: {0}")]
    InflateFailed(String),

    /// Header frames must be JSON.
    #[error("header frame has non-JSON payload format {0}")]
    InvalidHeaderFormat(u8),

    /// JSON in a header or payload frame failed to parse.
    #[error("malformed JSON in frame: {0}")]
    MalformedJson(String),

    /// A text payload was not valid UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    /// The payload frame used a format byte we don't know.
    #[error("unknown payload format {0}")]
    UnknownPayloadFormat(u8),
}

// ── Decoded model ────────────────────────────────────────────────────

/// What happened to the device named in the header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UpdateAction {
    Add,
    Update,
    Remove,
    /// Any action this crate doesn't know about yet.
    Other(String),
}

impl UpdateAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for UpdateAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "add" => Self::Add,
            "update" => Self::Update,
            "remove" => Self::Remove,
            _ => Self::Other(value),
        }
    }
}

impl From<UpdateAction> for String {
    fn from(value: UpdateAction) -> Self {
        match value {
            UpdateAction::Other(s) => s,
            known => known.as_str().to_owned(),
        }
    }
}

impl std::fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of the header frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHeader {
    pub action: UpdateAction,
    /// Identifier of the device (or event) being updated.
    pub id: String,
    /// Bootstrap category: `camera`, `event`, `nvr`, `user`, ...
    pub model_key: String,
    #[serde(default)]
    pub new_update_id: String,
}

/// Contents of the payload frame, typed by its wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
}

impl UpdatePayload {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn format(&self) -> PayloadFormat {
        match self {
            Self::Json(_) => PayloadFormat::Json,
            Self::Text(_) => PayloadFormat::Text,
            Self::Bytes(_) => PayloadFormat::Bytes,
        }
    }
}

/// A fully decoded realtime update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub header: UpdateHeader,
    pub payload: UpdatePayload,
}

// ── Decoding ─────────────────────────────────────────────────────────

/// Decode one realtime update packet.
pub fn decode_update_packet(packet: &[u8]) -> Result<UpdateEvent, DecodeError> {
    // The header frame's size tells us where the payload frame begins.
    let data_offset = read_size(packet, 0)?.saturating_add(FRAME_HEADER_LEN);
    let payload_size = read_size(packet, data_offset)?;

    let expected = data_offset
        .saturating_add(FRAME_HEADER_LEN)
        .saturating_add(payload_size);
    if packet.len() != expected {
        return Err(DecodeError::LengthMismatch {
            expected,
            actual: packet.len(),
        });
    }

    let (header_frame, payload_frame) = packet.split_at(data_offset);
    let header = decode_header_frame(header_frame)?;
    let payload = decode_payload_frame(payload_frame)?;

    Ok(UpdateEvent { header, payload })
}

/// Read the size field of the frame header starting at `offset`.
fn read_size(packet: &[u8], offset: usize) -> Result<usize, DecodeError> {
    let start = offset.saturating_add(OFFSET_SIZE);
    let end = offset.saturating_add(FRAME_HEADER_LEN);
    let field: [u8; 4] = packet
        .get(start..end)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::LengthMismatch {
            expected: end,
            actual: packet.len(),
        })?;

    usize::try_from(u32::from_be_bytes(field)).map_err(|_| DecodeError::LengthMismatch {
        expected: usize::MAX,
        actual: packet.len(),
    })
}

/// Check the frame kind and return `(format byte, inflated body)`.
fn open_frame(frame: &[u8], expected: FrameKind) -> Result<(u8, Cow<'_, [u8]>), DecodeError> {
    let (head, body) = frame
        .split_at_checked(FRAME_HEADER_LEN)
        .ok_or(DecodeError::LengthMismatch {
            expected: FRAME_HEADER_LEN,
            actual: frame.len(),
        })?;

    let kind = head[OFFSET_KIND];
    if kind != expected as u8 {
        return Err(DecodeError::UnexpectedFrameKind {
            expected,
            found: kind,
        });
    }

    let body = if head[OFFSET_DEFLATED] == 0 {
        Cow::Borrowed(body)
    } else {
        Cow::Owned(inflate(body)?)
    };

    Ok((head[OFFSET_FORMAT], body))
}

fn decode_header_frame(frame: &[u8]) -> Result<UpdateHeader, DecodeError> {
    let (format, body) = open_frame(frame, FrameKind::Header)?;

    match PayloadFormat::try_from(format) {
        Ok(PayloadFormat::Json) => serde_json::from_slice(&body)
            .map_err(|e| DecodeError::MalformedJson(e.to_string())),
        Ok(PayloadFormat::Text | PayloadFormat::Bytes) | Err(_) => {
            Err(DecodeError::InvalidHeaderFormat(format))
        }
    }
}

fn decode_payload_frame(frame: &[u8]) -> Result<UpdatePayload, DecodeError> {
    let (format, body) = open_frame(frame, FrameKind::Payload)?;

    match PayloadFormat::try_from(format) {
        Ok(PayloadFormat::Json) => serde_json::from_slice(&body)
            .map(UpdatePayload::Json)
            .map_err(|e| DecodeError::MalformedJson(e.to_string())),
        Ok(PayloadFormat::Text) => String::from_utf8(body.into_owned())
            .map(UpdatePayload::Text)
            .map_err(|_| DecodeError::InvalidUtf8),
        Ok(PayloadFormat::Bytes) => Ok(UpdatePayload::Bytes(Bytes::from(body.into_owned()))),
        Err(unknown) => Err(DecodeError::UnknownPayloadFormat(unknown)),
    }
}

fn inflate(body: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(body.len() * 4);
    ZlibDecoder::new(body)
        .take(MAX_INFLATED_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::InflateFailed(e.to_string()))?;

    if u64::try_from(out.len()).unwrap_or(u64::MAX) > MAX_INFLATED_LEN {
        return Err(DecodeError::InflateFailed(format!(
            "inflated frame exceeds {MAX_INFLATED_LEN} bytes"
        )));
    }
    Ok(out)
}

// ── Encoding ─────────────────────────────────────────────────────────

/// Encode an update into the packet layout the controller sends.
///
/// Both frames are deflated when `compress` is set. Mostly useful for
/// replaying captured updates and for exercising consumers in tests.
pub fn encode_update_packet(event: &UpdateEvent, compress: bool) -> io::Result<Bytes> {
    let header = serde_json::to_vec(&event.header)?;
    let payload: Cow<'_, [u8]> = match &event.payload {
        UpdatePayload::Json(v) => Cow::Owned(serde_json::to_vec(v)?),
        UpdatePayload::Text(s) => Cow::Borrowed(s.as_bytes()),
        UpdatePayload::Bytes(b) => Cow::Borrowed(b),
    };

    let mut out = BytesMut::with_capacity(2 * FRAME_HEADER_LEN + header.len() + payload.len());
    write_frame(&mut out, FrameKind::Header, PayloadFormat::Json, &header, compress)?;
    write_frame(
        &mut out,
        FrameKind::Payload,
        event.payload.format(),
        &payload,
        compress,
    )?;
    Ok(out.freeze())
}

fn write_frame(
    out: &mut BytesMut,
    kind: FrameKind,
    format: PayloadFormat,
    body: &[u8],
    compress: bool,
) -> io::Result<()> {
    let body: Cow<'_, [u8]> = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body)?;
        Cow::Owned(encoder.finish()?)
    } else {
        Cow::Borrowed(body)
    };

    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame body exceeds 4 GiB"))?;

    out.put_u8(kind as u8);
    out.put_u8(format as u8);
    out.put_u8(u8::from(compress));
    out.put_u8(0);
    out.put_u32(len);
    out.extend_from_slice(&body);
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────
