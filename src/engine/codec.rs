//! Host-side packing codec and range math.
//!
//! Everything in this module is pure: no device, no locks. It provides
//!
//! * the lane transforms that stage host data for the device conversion
//!   kernels ([`widen_lanes`], [`narrow_lanes`]),
//! * a complete CPU implementation of the packed layout ([`pack_words`],
//!   [`unpack_words`]) used by the host packing strategy and by tests as the
//!   reference for the kernels,
//! * the two-step bounds contract for partial reads ([`clamp_read_range`]
//!   followed by [`physical_span`]).
//!
//! Host data arrives as raw bytes of a [`LogicalType`] in host byte order, so
//! a single runtime-typed code path serves all ten element types. Large arrays
//! are processed in parallel with `rayon`.
//!
//! ## Bit layout
//!
//! Lane `k` of a word occupies bits `k * lane_bits .. (k + 1) * lane_bits`.
//! Wide values keep their low 32 bits in the first word of the pair. Lanes of a
//! trailing partial word beyond the logical length are zero.

use rayon::prelude::*;

use crate::engine::error::{BoundsError, PhysicalRangeError};
use crate::engine::types::{LogicalType, PackKind, WordLayout, WORD_BYTES};


/// Element count above which conversions run on the rayon pool.
pub const PARALLEL_THRESHOLD: usize = 1 << 15;

// ─────────────────────────────────────────────────────────────────────────────
// Lane transforms
// ─────────────────────────────────────────────────────────────────────────────

/// Widens one lane value to a full word, sign-extending signed narrow types.
///
/// `raw` holds the lane in its low bits. Native and wide types return `raw`
/// unchanged.
#[inline]
pub fn extend_lane(ty: LogicalType, raw: u32) -> u32 {
    let bits = ty.pack_kind().lane_bits();
    if bits == 32 {
        return raw;
    }
    let shift = 32 - bits;
    if ty.is_signed() {
        (((raw << shift) as i32) >> shift) as u32
    } else {
        raw & (u32::MAX >> shift)
    }
}

/// Reads lane `lane` of a packed `word` and widens it to 32 bits.
///
/// With `word = 0x0000_00FF`, lane 0 reads `-1` as int8 and `255` as uint8.
#[inline]
pub fn extract_lane(ty: LogicalType, word: u32, lane: usize) -> u32 {
    let bits = ty.pack_kind().lane_bits();
    if bits == 32 {
        return word;
    }
    extend_lane(ty, word >> (lane as u32 * bits))
}

#[inline]
fn raw_lane(ty: LogicalType, src: &[u8]) -> u32 {
    match ty.pack_kind() {
        PackKind::Narrow8 => src[0] as u32,
        PackKind::Narrow16 => u16::from_ne_bytes([src[0], src[1]]) as u32,
        PackKind::Native | PackKind::Wide64 => {
            u32::from_ne_bytes([src[0], src[1], src[2], src[3]])
        }
    }
}

#[inline]
fn widen_one(ty: LogicalType, src: &[u8], dst: &mut [u32]) {
    match ty.pack_kind() {
        PackKind::Wide64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[..8]);
            let value = u64::from_ne_bytes(raw);
            dst[0] = value as u32;
            dst[1] = (value >> 32) as u32;
        }
        _ => dst[0] = extend_lane(ty, raw_lane(ty, src)),
    }
}

#[inline]
fn narrow_one(ty: LogicalType, src: &[u32], dst: &mut [u8]) {
    match ty.pack_kind() {
        PackKind::Narrow8 => dst[0] = src[0] as u8,
        PackKind::Narrow16 => dst.copy_from_slice(&(src[0] as u16).to_ne_bytes()),
        PackKind::Native => dst.copy_from_slice(&src[0].to_ne_bytes()),
        PackKind::Wide64 => {
            let value = (src[0] as u64) | ((src[1] as u64) << 32);
            dst.copy_from_slice(&value.to_ne_bytes());
        }
    }
}

/// Expands host elements into the one-word-per-lane staging layout.
///
/// Narrow lanes are widened (sign-extended for signed types); wide values are
/// split into `(low, high)` word pairs. Trailing bytes that do not form a whole
/// element are ignored.
pub fn widen_lanes(ty: LogicalType, bytes: &[u8]) -> Vec<u32> {
    let size = ty.size_bytes();
    let per = ty.pack_kind().words_per_element();
    let count = bytes.len() / size;
    let bytes = &bytes[..count * size];

    let mut out = vec![0u32; count * per];
    if count >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(per)
            .zip(bytes.par_chunks(size))
            .for_each(|(dst, src)| widen_one(ty, src, dst));
    } else {
        out.chunks_mut(per)
            .zip(bytes.chunks(size))
            .for_each(|(dst, src)| widen_one(ty, src, dst));
    }
    out
}

/// Collapses staging lanes back into host elements.
///
/// Writes `min(out.len() / size, lanes.len() / words_per_element)` elements
/// and returns that count.
pub fn narrow_lanes(ty: LogicalType, lanes: &[u32], out: &mut [u8]) -> usize {
    let size = ty.size_bytes();
    let per = ty.pack_kind().words_per_element();
    let count = (out.len() / size).min(lanes.len() / per);
    let out = &mut out[..count * size];
    let lanes = &lanes[..count * per];

    if count >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(size)
            .zip(lanes.par_chunks(per))
            .for_each(|(dst, src)| narrow_one(ty, src, dst));
    } else {
        out.chunks_mut(size)
            .zip(lanes.chunks(per))
            .for_each(|(dst, src)| narrow_one(ty, src, dst));
    }
    count
}

// ─────────────────────────────────────────────────────────────────────────────
// Packed layout
// ─────────────────────────────────────────────────────────────────────────────

/// Packs host elements into the persistent device layout.
///
/// The result holds exactly `ty.packed_words(count)` words.
pub fn pack_words(ty: LogicalType, bytes: &[u8]) -> Vec<u32> {
    let kind = ty.pack_kind();
    if !matches!(kind, PackKind::Narrow8 | PackKind::Narrow16) {
        // native and wide layouts coincide with their staging layout
        return widen_lanes(ty, bytes);
    }

    let size = ty.size_bytes();
    let lanes = kind.lane_bits();
    let per_word = kind.lanes_per_word();
    let count = bytes.len() / size;
    let mask = u32::MAX >> (32 - lanes);

    let pack_word = |(word_index, word): (usize, &mut u32)| {
        let mut packed = 0u32;
        for lane in 0..per_word {
            let index = word_index * per_word + lane;
            if index >= count {
                break;
            }
            let value = raw_lane(ty, &bytes[index * size..(index + 1) * size]) & mask;
            packed |= value << (lane as u32 * lanes);
        }
        *word = packed;
    };

    let mut out = vec![0u32; kind.packed_words(count)];
    if count >= PARALLEL_THRESHOLD {
        out.par_iter_mut().enumerate().for_each(pack_word);
    } else {
        out.iter_mut().enumerate().for_each(pack_word);
    }
    out
}

/// Unpacks host elements from a span of packed words.
///
/// `words[0]` is the word holding logical element `first` of the span's
/// first word, i.e. `first` is the lane offset into the span (always `0` for
/// native and wide types). Fills `out` with as many whole elements as both
/// `out` and `words` provide and returns that count.
pub fn unpack_words(ty: LogicalType, words: &[u32], first: usize, out: &mut [u8]) -> usize {
    let kind = ty.pack_kind();
    let size = ty.size_bytes();
    let per_word = kind.lanes_per_word();
    let per_element = kind.words_per_element();

    let available = (words.len() * per_word).saturating_sub(first) / per_element;
    let count = (out.len() / size).min(available);
    let out = &mut out[..count * size];

    let unpack_one = |(j, dst): (usize, &mut [u8])| {
        let index = first + j;
        match kind {
            PackKind::Wide64 => narrow_one(ty, &words[index * 2..index * 2 + 2], dst),
            _ => {
                let lane = extract_lane(ty, words[index / per_word], index % per_word);
                narrow_one(ty, &[lane], dst);
            }
        }
    };

    if count >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(size).enumerate().for_each(unpack_one);
    } else {
        out.chunks_mut(size).enumerate().for_each(unpack_one);
    }
    count
}

// ─────────────────────────────────────────────────────────────────────────────
// Ranges
// ─────────────────────────────────────────────────────────────────────────────

/// A clamped logical element range.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    /// First logical element.
    pub offset: usize,
    /// Number of logical elements.
    pub count: usize,
}

impl ReadRange {
    /// One past the last logical element.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.count
    }
}

/// First step of the bounds contract: clamps a requested range to the logical
/// length.
///
/// An offset at or past `length` is rejected; a count running past the end is
/// shortened to what remains.
///
/// ```
/// use minigpu::engine::codec::clamp_read_range;
///
/// let range = clamp_read_range(950, 900, 1000).unwrap();
/// assert_eq!(range.count, 50);
/// assert!(clamp_read_range(950, 1000, 1).is_err());
/// ```
pub fn clamp_read_range(length: usize, offset: usize, count: usize) -> Result<ReadRange, BoundsError> {
    if offset >= length {
        return Err(BoundsError { offset, length });
    }
    Ok(ReadRange { offset, count: count.min(length - offset) })
}

/// Word-aligned byte span a logical range occupies in a layout.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    /// First byte (multiple of 4).
    pub start: u64,
    /// One past the last byte (multiple of 4).
    pub end: u64,
    /// Lane offset of the range's first element inside the first word.
    pub first_lane: usize,
}

impl ByteSpan {
    /// Span length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// `true` for an empty span.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Second step of the bounds contract: maps a clamped range onto whole words
/// of `layout` and checks the span against the allocation size.
pub fn physical_span(
    layout: WordLayout,
    range: ReadRange,
    physical_bytes: u64,
) -> Result<ByteSpan, PhysicalRangeError> {
    let kind = layout.logical().pack_kind();
    let per_element = kind.words_per_element();
    let (first_word, end_word, first_lane) = match layout {
        WordLayout::Packed(_) => {
            let per_word = kind.lanes_per_word();
            (
                range.offset / per_word * per_element,
                range.end().div_ceil(per_word) * per_element,
                range.offset % per_word,
            )
        }
        WordLayout::Lanes(_) => (range.offset * per_element, range.end() * per_element, 0),
    };

    let start = first_word as u64 * WORD_BYTES;
    let end = end_word as u64 * WORD_BYTES;
    if end > physical_bytes || start > end {
        return Err(PhysicalRangeError { start, end, physical_bytes });
    }
    Ok(ByteSpan { start, end, first_lane })
}
