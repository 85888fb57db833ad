//! Fragmented MP4 box demuxer for the livestream socket.
//!
//! The livestream socket delivers an fMP4 byte stream with no regard for
//! box boundaries: one socket message may hold several boxes, or a slice
//! of one. [`BoxDemuxer`] buffers the stream, cuts it at box boundaries and
//! groups the boxes into:
//!
//! - one **initialization segment**: every box seen before the first
//!   `moof` (`ftyp`, `moov`, ...), concatenated in arrival order;
//! - a **media segment** per `moof` + `mdat` pair (plus anything the
//!   controller slips between the two).
//!
//! Partial boxes are never emitted.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::{trace, warn};

/// Size of a compact box header: 32-bit size + four-character type.
pub const BOX_HEADER_LEN: usize = 8;

/// Size of a box header that carries a 64-bit `largesize`.
pub const LARGE_BOX_HEADER_LEN: usize = 16;

/// Upper bound on a single box. Livestream fragments are a few hundred
/// kilobytes; anything near this is a corrupt size field.
pub const MAX_BOX_SIZE: u64 = 64 * 1024 * 1024;

/// Four-character box type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MOOF: Self = Self(*b"moof");
    pub const MDAT: Self = Self(*b"mdat");

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: BoxType,
    /// Box size including the header.
    pub size: u64,
    /// 8, or 16 when a `largesize` follows the type.
    pub header_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DemuxError {
    #[error("box '{box_type}' declares size {size}, smaller than its {header_len}-byte header")]
    UndersizedBox {
        box_type: BoxType,
        size: u64,
        header_len: usize,
    },

    #[error("box '{box_type}' extends to end of stream, which a live stream cannot have")]
    UnboundedBox { box_type: BoxType },

    #[error("box '{box_type}' declares size {size}, above the {MAX_BOX_SIZE}-byte limit")]
    OversizedBox { box_type: BoxType, size: u64 },
}

/// Parse the box header at the start of `buf`.
///
/// Returns `Ok(None)` when `buf` doesn't hold a complete header yet.
pub fn parse_box_header(buf: &[u8]) -> Result<Option<BoxHeader>, DemuxError> {
    let Some(compact) = buf.get(..BOX_HEADER_LEN) else {
        return Ok(None);
    };
    let mut compact = compact;
    let size32 = compact.get_u32();
    let box_type = BoxType([compact[0], compact[1], compact[2], compact[3]]);

    let (size, header_len) = match size32 {
        0 => return Err(DemuxError::UnboundedBox { box_type }),
        1 => {
            let Some(mut large) = buf.get(BOX_HEADER_LEN..LARGE_BOX_HEADER_LEN) else {
                return Ok(None);
            };
            (large.get_u64(), LARGE_BOX_HEADER_LEN)
        }
        n => (u64::from(n), BOX_HEADER_LEN),
    };

    if size < header_len as u64 {
        return Err(DemuxError::UndersizedBox {
            box_type,
            size,
            header_len,
        });
    }
    if size > MAX_BOX_SIZE {
        return Err(DemuxError::OversizedBox { box_type, size });
    }

    Ok(Some(BoxHeader {
        box_type,
        size,
        header_len,
    }))
}

/// Output of the demuxer, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxOutput {
    /// Emitted exactly once, right before the first media segment.
    InitSegment(Bytes),
    MediaSegment(Bytes),
}

/// Incremental fMP4 demuxer. One per livestream connection.
#[derive(Debug, Default)]
pub struct BoxDemuxer {
    /// Bytes received but not yet cut into a complete box.
    buffer: BytesMut,
    /// Boxes collected before the first `moof`.
    init: BytesMut,
    init_emitted: bool,
    /// `moof` (and anything after it) waiting for its `mdat`.
    pending: Option<BytesMut>,
}

impl BoxDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one socket message. Returns every segment it completed.
    ///
    /// After an error the demuxer state is undefined; call
    /// [`reset`](Self::reset) or drop it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<DemuxOutput>, DemuxError> {
        self.buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(header) = parse_box_header(&self.buffer)? {
            // Bounded by MAX_BOX_SIZE, so this fits in usize.
            let size = usize::try_from(header.size).unwrap_or(usize::MAX);
            if self.buffer.len() < size {
                trace!(
                    box_type = %header.box_type,
                    have = self.buffer.len(),
                    need = size,
                    "waiting for the rest of the box"
                );
                break;
            }

            let whole = self.buffer.split_to(size);
            self.route(header.box_type, &whole, &mut out);
        }

        Ok(out)
    }

    fn route(&mut self, box_type: BoxType, whole: &[u8], out: &mut Vec<DemuxOutput>) {
        match box_type {
            BoxType::MOOF => {
                if !self.init_emitted {
                    self.init_emitted = true;
                    if self.init.is_empty() {
                        warn!("livestream started with a fragment; init segment is empty");
                    }
                    out.push(DemuxOutput::InitSegment(self.init.split().freeze()));
                }
                if self.pending.is_some() {
                    trace!("moof superseded before its mdat arrived");
                }
                self.pending = Some(BytesMut::from(whole));
            }
            BoxType::MDAT => match self.pending.take() {
                Some(mut segment) => {
                    segment.extend_from_slice(whole);
                    out.push(DemuxOutput::MediaSegment(segment.freeze()));
                }
                None if !self.init_emitted => self.init.extend_from_slice(whole),
                None => trace!("mdat without a preceding moof, dropped"),
            },
            _ if !self.init_emitted => self.init.extend_from_slice(whole),
            other => match self.pending.as_mut() {
                Some(segment) => segment.extend_from_slice(whole),
                None => trace!(box_type = %other, "box outside any fragment, dropped"),
            },
        }
    }

    /// Whether the initialization segment has been emitted.
    pub fn init_complete(&self) -> bool {
        self.init_emitted
    }

    /// Bytes held for a box that hasn't fully arrived.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered state, as if freshly constructed.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    fn mp4_box(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut b = u32::try_from(body.len() + BOX_HEADER_LEN)
            .unwrap()
            .to_be_bytes()
            .to_vec();
        b.extend_from_slice(kind);
        b.extend_from_slice(body);
        b
    }

    fn stream(fragments: usize) -> (Vec<u8>, Vec<u8>, Vec<Vec<u8>>) {
        let init = [mp4_box(b"ftyp", b"iso5avc1"), mp4_box(b"moov", &[7; 40])].concat();
        let segments: Vec<Vec<u8>> = (0..fragments)
            .map(|i| {
                let tag = u8::try_from(i).unwrap();
                [mp4_box(b"moof", &[tag; 24]), mp4_box(b"mdat", &[tag; 100])].concat()
            })
            .collect();
        let all = [init.clone(), segments.concat()].concat();
        (all, init, segments)
    }

    fn collect(demuxer: &mut BoxDemuxer, bytes: &[u8], chunk: usize) -> Vec<DemuxOutput> {
        bytes
            .chunks(chunk)
            .flat_map(|c| demuxer.push(c).unwrap())
            .collect()
    }

    #[test]
    fn one_init_then_segments_in_order() {
        let (all, init, segments) = stream(4);
        let mut demuxer = BoxDemuxer::new();

        let out = collect(&mut demuxer, &all, all.len());

        let mut expected = vec![DemuxOutput::InitSegment(Bytes::from(init))];
        expected.extend(
            segments
                .into_iter()
                .map(|s| DemuxOutput::MediaSegment(Bytes::from(s))),
        );
        assert_eq!(out, expected);
        assert_eq!(demuxer.buffered_len(), 0);
    }

    #[test]
    fn chunking_does_not_change_output() {
        let (all, _, _) = stream(3);
        let whole = collect(&mut BoxDemuxer::new(), &all, all.len());

        for chunk in [1, 3, 7, 64, 131] {
            let pieces = collect(&mut BoxDemuxer::new(), &all, chunk);
            assert_eq!(pieces, whole, "chunk size {chunk}");
        }
    }

    #[test]
    fn partial_box_is_held_back() {
        let moov = mp4_box(b"moov", &[1; 32]);
        let moof = mp4_box(b"moof", &[2; 16]);
        let mut demuxer = BoxDemuxer::new();

        assert!(demuxer.push(&moov).unwrap().is_empty());
        assert!(demuxer.push(&moof[..10]).unwrap().is_empty());
        assert_eq!(demuxer.buffered_len(), 10);
        assert!(!demuxer.init_complete());

        let out = demuxer.push(&moof[10..]).unwrap();
        assert_eq!(out, vec![DemuxOutput::InitSegment(Bytes::from(moov))]);
        assert!(demuxer.init_complete());
    }

    #[test]
    fn boxes_between_moof_and_mdat_stay_in_segment() {
        let mut demuxer = BoxDemuxer::new();
        demuxer.push(&mp4_box(b"ftyp", b"isom")).unwrap();

        let seg = [
            mp4_box(b"moof", &[1; 8]),
            mp4_box(b"prft", &[2; 12]),
            mp4_box(b"mdat", &[3; 20]),
        ]
        .concat();
        let out = demuxer.push(&seg).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[1], DemuxOutput::MediaSegment(Bytes::from(seg)));
    }

    #[test]
    fn stray_boxes_after_init_are_dropped() {
        let mut demuxer = BoxDemuxer::new();
        demuxer.push(&mp4_box(b"ftyp", b"isom")).unwrap();
        demuxer.push(&mp4_box(b"moof", &[1; 8])).unwrap();
        demuxer.push(&mp4_box(b"mdat", &[1; 8])).unwrap();

        let out = demuxer
            .push(&[mp4_box(b"free", &[0; 4]), mp4_box(b"mdat", &[9; 4])].concat())
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn large_size_header_is_supported() {
        let body = [5u8; 30];
        let mut large = 1u32.to_be_bytes().to_vec();
        large.extend_from_slice(b"mdat");
        large.extend_from_slice(&(u64::try_from(body.len() + LARGE_BOX_HEADER_LEN).unwrap()).to_be_bytes());
        large.extend_from_slice(&body);

        let mut demuxer = BoxDemuxer::new();
        demuxer.push(&mp4_box(b"ftyp", b"isom")).unwrap();
        let moof = mp4_box(b"moof", &[1; 8]);
        demuxer.push(&moof).unwrap();

        let out = demuxer.push(&large).unwrap();
        assert_eq!(
            out,
            vec![DemuxOutput::MediaSegment(Bytes::from([moof, large].concat()))]
        );
    }

    #[test]
    fn undersized_box_is_an_error() {
        let mut bad = 4u32.to_be_bytes().to_vec();
        bad.extend_from_slice(b"moov");

        assert!(matches!(
            BoxDemuxer::new().push(&bad),
            Err(DemuxError::UndersizedBox { size: 4, .. })
        ));
    }

    #[test]
    fn zero_size_box_is_an_error() {
        let mut bad = 0u32.to_be_bytes().to_vec();
        bad.extend_from_slice(b"mdat");

        assert_eq!(
            BoxDemuxer::new().push(&bad),
            Err(DemuxError::UnboundedBox {
                box_type: BoxType::MDAT
            })
        );
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut demuxer = BoxDemuxer::new();
        demuxer.push(&mp4_box(b"ftyp", b"isom")[..5]).unwrap();
        demuxer.reset();

        assert_eq!(demuxer.buffered_len(), 0);
        assert!(!demuxer.init_complete());
    }
}
