//! Logical Types, Packing Relationships, and Identifiers
//!
//! This module defines the **fundamental types and identifiers** shared by the
//! codec, the buffer layer and the C boundary. It is the single place where the
//! relationship between a caller's element type and the device's 32-bit word
//! is written down.
//!
//! ## Logical vs. physical
//!
//! The shading language only stores 32-bit scalars. Every logical type is
//! therefore mapped onto 32-bit words by one of four [`PackKind`]s:
//!
//! ```text
//! Narrow8   | b3 | b2 | b1 | b0 |   4 elements per word, byte 0 in bits 0..8
//! Narrow16  |   h1    |   h0    |   2 elements per word, half 0 in bits 0..16
//! Native    |        v0         |   1 element per word
//! Wide64    | lo word | hi word |   1 element per 2 words, raw bit pattern
//! ```
//!
//! Signed narrow kinds sign-extend when a lane is widened back to 32 bits, so
//! the byte `0xFF` reads as `-1` through `int8` and as `255` through `uint8`.
//!
//! ## Word layouts
//!
//! Device buffers are tagged with a [`WordLayout`]: either the packed layout of
//! a logical type (the persistent form), or the one-word-per-lane layout the
//! conversion kernels read from and write to (the staging form). Kernels check
//! these tags before they are dispatched.
//!
//! ## Type codes
//!
//! Callers across the C boundary name types by a small closed integer code.
//! Codes with no logical counterpart (including `0`, half precision) fall back
//! to `float32` with a warning rather than failing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};


/// Size in bytes of one device word.
pub const WORD_BYTES: u64 = 4;

/// Smallest allocation made for any buffer, in bytes.
pub const MIN_BUFFER_BYTES: u64 = WORD_BYTES;

// ─────────────────────────────────────────────────────────────────────────────
// Packing relationships
// ─────────────────────────────────────────────────────────────────────────────

/// How a logical element maps onto 32-bit device words.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackKind {
    /// Four 8-bit elements per word.
    Narrow8,
    /// Two 16-bit elements per word.
    Narrow16,
    /// One 32-bit element per word.
    Native,
    /// One 64-bit element split across two words.
    Wide64,
}

impl PackKind {
    /// Logical elements stored in one word (`1` for native and wide kinds).
    #[inline]
    pub const fn lanes_per_word(self) -> usize {
        match self {
            PackKind::Narrow8 => 4,
            PackKind::Narrow16 => 2,
            PackKind::Native | PackKind::Wide64 => 1,
        }
    }

    /// Words occupied by one logical element (`2` for wide, else `1`).
    #[inline]
    pub const fn words_per_element(self) -> usize {
        match self {
            PackKind::Wide64 => 2,
            _ => 1,
        }
    }

    /// Bit width of one lane within a word.
    #[inline]
    pub const fn lane_bits(self) -> u32 {
        match self {
            PackKind::Narrow8 => 8,
            PackKind::Narrow16 => 16,
            PackKind::Native | PackKind::Wide64 => 32,
        }
    }

    /// Physical word count needed for `length` logical elements.
    #[inline]
    pub const fn packed_words(self, length: usize) -> usize {
        match self {
            PackKind::Narrow8 => length.div_ceil(4),
            PackKind::Narrow16 => length.div_ceil(2),
            PackKind::Native => length,
            PackKind::Wide64 => length * 2,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logical types
// ─────────────────────────────────────────────────────────────────────────────

/// Element type as the caller understands it.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    Uint64,
    /// 32-bit IEEE float.
    Float32,
    /// 64-bit IEEE float, stored as an opaque bit pattern.
    Float64,
}

impl LogicalType {
    /// Every logical type, in type-code order.
    pub const ALL: [LogicalType; 10] = [
        LogicalType::Float32,
        LogicalType::Float64,
        LogicalType::Int8,
        LogicalType::Int16,
        LogicalType::Int32,
        LogicalType::Int64,
        LogicalType::Uint8,
        LogicalType::Uint16,
        LogicalType::Uint32,
        LogicalType::Uint64,
    ];

    /// Width of one element in host memory.
    #[inline]
    pub const fn size_bytes(self) -> usize {
        match self {
            LogicalType::Int8 | LogicalType::Uint8 => 1,
            LogicalType::Int16 | LogicalType::Uint16 => 2,
            LogicalType::Int32 | LogicalType::Uint32 | LogicalType::Float32 => 4,
            LogicalType::Int64 | LogicalType::Uint64 | LogicalType::Float64 => 8,
        }
    }

    /// How this type maps onto device words.
    #[inline]
    pub const fn pack_kind(self) -> PackKind {
        match self {
            LogicalType::Int8 | LogicalType::Uint8 => PackKind::Narrow8,
            LogicalType::Int16 | LogicalType::Uint16 => PackKind::Narrow16,
            LogicalType::Int32 | LogicalType::Uint32 | LogicalType::Float32 => PackKind::Native,
            LogicalType::Int64 | LogicalType::Uint64 | LogicalType::Float64 => PackKind::Wide64,
        }
    }

    /// `true` for types whose narrow lanes sign-extend on unpack.
    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            LogicalType::Int8 | LogicalType::Int16 | LogicalType::Int32 | LogicalType::Int64
        )
    }

    /// `true` when physical storage differs from one element per word.
    #[inline]
    pub const fn is_packed(self) -> bool {
        !matches!(self.pack_kind(), PackKind::Native)
    }

    /// Physical word count for `length` elements.
    #[inline]
    pub const fn packed_words(self, length: usize) -> usize {
        self.pack_kind().packed_words(length)
    }

    /// Physical allocation size for `length` elements: whole words, never
    /// below [`MIN_BUFFER_BYTES`].
    #[inline]
    pub const fn physical_bytes(self, length: usize) -> u64 {
        let bytes = self.packed_words(length) as u64 * WORD_BYTES;
        if bytes < MIN_BUFFER_BYTES { MIN_BUFFER_BYTES } else { bytes }
    }

    /// Bytes needed to hold `length` elements in the one-word-per-lane
    /// staging layout used by the conversion kernels.
    #[inline]
    pub const fn lane_bytes(self, length: usize) -> u64 {
        let bytes = (length * self.pack_kind().words_per_element()) as u64 * WORD_BYTES;
        if bytes < MIN_BUFFER_BYTES { MIN_BUFFER_BYTES } else { bytes }
    }

    /// Boundary type code for this type.
    #[inline]
    pub const fn code(self) -> i32 {
        match self {
            LogicalType::Float32 => type_code::FLOAT32,
            LogicalType::Float64 => type_code::FLOAT64,
            LogicalType::Int8 => type_code::INT8,
            LogicalType::Int16 => type_code::INT16,
            LogicalType::Int32 => type_code::INT32,
            LogicalType::Int64 => type_code::INT64,
            LogicalType::Uint8 => type_code::UINT8,
            LogicalType::Uint16 => type_code::UINT16,
            LogicalType::Uint32 => type_code::UINT32,
            LogicalType::Uint64 => type_code::UINT64,
        }
    }

    /// Strict lookup of a boundary type code.
    pub const fn try_from_code(code: i32) -> Option<Self> {
        match code {
            type_code::FLOAT32 => Some(LogicalType::Float32),
            type_code::FLOAT64 => Some(LogicalType::Float64),
            type_code::INT8 => Some(LogicalType::Int8),
            type_code::INT16 => Some(LogicalType::Int16),
            type_code::INT32 => Some(LogicalType::Int32),
            type_code::INT64 => Some(LogicalType::Int64),
            type_code::UINT8 => Some(LogicalType::Uint8),
            type_code::UINT16 => Some(LogicalType::Uint16),
            type_code::UINT32 => Some(LogicalType::Uint32),
            type_code::UINT64 => Some(LogicalType::Uint64),
            _ => None,
        }
    }

    /// Lenient lookup used at the C boundary.
    ///
    /// Unknown codes (and half precision, which has no device representation
    /// here) resolve to [`LogicalType::Float32`] and log a warning.
    pub fn from_code(code: i32) -> Self {
        match Self::try_from_code(code) {
            Some(ty) => ty,
            None => {
                log::warn!("unsupported type code {code}; defaulting to float32");
                LogicalType::Float32
            }
        }
    }

    /// Lower-case name used in logs and shader labels.
    pub const fn name(self) -> &'static str {
        match self {
            LogicalType::Int8 => "int8",
            LogicalType::Uint8 => "uint8",
            LogicalType::Int16 => "int16",
            LogicalType::Uint16 => "uint16",
            LogicalType::Int32 => "int32",
            LogicalType::Uint32 => "uint32",
            LogicalType::Int64 => "int64",
            LogicalType::Uint64 => "uint64",
            LogicalType::Float32 => "float32",
            LogicalType::Float64 => "float64",
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Integer codes naming logical types at the C boundary.
pub mod type_code {
    /// Half precision. Not representable; maps to float32.
    pub const FLOAT16: i32 = 0;
    /// `float32`.
    pub const FLOAT32: i32 = 1;
    /// `float64`.
    pub const FLOAT64: i32 = 2;
    /// `int8`.
    pub const INT8: i32 = 3;
    /// `int16`.
    pub const INT16: i32 = 4;
    /// `int32`.
    pub const INT32: i32 = 5;
    /// `int64`.
    pub const INT64: i32 = 6;
    /// `uint8`.
    pub const UINT8: i32 = 7;
    /// `uint16`.
    pub const UINT16: i32 = 8;
    /// `uint32`.
    pub const UINT32: i32 = 9;
    /// `uint64`.
    pub const UINT64: i32 = 10;
}

// ─────────────────────────────────────────────────────────────────────────────
// Word layouts
// ─────────────────────────────────────────────────────────────────────────────

/// Arrangement of logical elements inside a device buffer's words.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordLayout {
    /// Persistent packed layout of the given type.
    Packed(LogicalType),
    /// One word per element (two for wide types); narrow lanes widened to 32
    /// bits, sign-extended for signed types.
    Lanes(LogicalType),
}

impl WordLayout {
    /// Logical type carried by the layout.
    #[inline]
    pub const fn logical(self) -> LogicalType {
        match self {
            WordLayout::Packed(ty) | WordLayout::Lanes(ty) => ty,
        }
    }

    /// Bytes the layout needs for `length` elements.
    #[inline]
    pub const fn required_bytes(self, length: usize) -> u64 {
        match self {
            WordLayout::Packed(ty) => ty.physical_bytes(length),
            WordLayout::Lanes(ty) => ty.lane_bytes(length),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host element types
// ─────────────────────────────────────────────────────────────────────────────

/// Host scalar that can be written to and read from a buffer.
///
/// Implemented for the ten scalar types that have a [`LogicalType`].
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    /// Logical type this scalar maps to.
    const LOGICAL: LogicalType;
}

macro_rules! impl_element {
    ($($t:ty => $logical:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const LOGICAL: LogicalType = LogicalType::$logical;
            }
        )*
    };
}

impl_element! {
    i8 => Int8,
    u8 => Uint8,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of one device allocation.
///
/// Every allocation made for a buffer gets a fresh id, so two equal ids mean
/// the same device handle. Shaders compare ids to notice reallocation.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(u64);

static NEXT_ALLOCATION: AtomicU64 = AtomicU64::new(1);

impl AllocationId {
    /// Returns a process-unique id.
    #[inline]
    pub(crate) fn next() -> Self {
        AllocationId(NEXT_ALLOCATION.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logs.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}
