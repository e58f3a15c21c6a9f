//! Typed windows onto the module's linear memory.
//!
//! A [`TypedView`] covers the *whole* current memory for one element kind.
//! Views are cached per kind in a [`ViewCache`] and rebuilt lazily whenever
//! the memory buffer changes identity (the module grew it, the allocator
//! moved it) or is observed with zero length.
//!
//! Offsets handed over by the module are always byte offsets; helpers divide
//! by the element width before indexing a view.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Element kind of a typed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    /// Signed 8-bit integers
    Int8,
    /// Unsigned 8-bit integers
    Uint8,
    /// Signed 16-bit integers
    Int16,
    /// Unsigned 16-bit integers
    Uint16,
    /// Signed 32-bit integers
    Int32,
    /// Unsigned 32-bit integers
    Uint32,
    /// 32-bit floats
    Float32,
    /// 64-bit floats
    Float64,
}

impl ViewKind {
    /// All kinds, in cache slot order.
    pub const ALL: [ViewKind; 8] = [
        ViewKind::Int8,
        ViewKind::Uint8,
        ViewKind::Int16,
        ViewKind::Uint16,
        ViewKind::Int32,
        ViewKind::Uint32,
        ViewKind::Float32,
        ViewKind::Float64,
    ];

    /// Element width in bytes.
    pub const fn width(self) -> usize {
        match self {
            ViewKind::Int8 | ViewKind::Uint8 => 1,
            ViewKind::Int16 | ViewKind::Uint16 => 2,
            ViewKind::Int32 | ViewKind::Uint32 | ViewKind::Float32 => 4,
            ViewKind::Float64 => 8,
        }
    }

    /// Host-side class name of arrays of this kind.
    pub const fn class_name(self) -> &'static str {
        match self {
            ViewKind::Int8 => "Int8Array",
            ViewKind::Uint8 => "Uint8Array",
            ViewKind::Int16 => "Int16Array",
            ViewKind::Uint16 => "Uint16Array",
            ViewKind::Int32 => "Int32Array",
            ViewKind::Uint32 => "Uint32Array",
            ViewKind::Float32 => "Float32Array",
            ViewKind::Float64 => "Float64Array",
        }
    }

    /// Numeric code used by the `array_new` intrinsic.
    pub const fn code(self) -> i32 {
        self.slot() as i32
    }

    /// Inverse of [`ViewKind::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        usize::try_from(code).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    const fn slot(self) -> usize {
        match self {
            ViewKind::Int8 => 0,
            ViewKind::Uint8 => 1,
            ViewKind::Int16 => 2,
            ViewKind::Uint16 => 3,
            ViewKind::Int32 => 4,
            ViewKind::Uint32 => 5,
            ViewKind::Float32 => 6,
            ViewKind::Float64 => 7,
        }
    }
}

/// A primitive that can be stored in a typed view (little-endian).
pub trait Element: Copy + Send + Sync + 'static {
    /// Kind of the view holding this element.
    const KIND: ViewKind;

    /// Decode one element from exactly `KIND.width()` bytes.
    fn read(bytes: &[u8]) -> Self;

    /// Encode one element into exactly `KIND.width()` bytes.
    fn write(self, out: &mut [u8]);

    /// Numeric value as seen by the host.
    fn to_f64(self) -> f64;
}

macro_rules! element {
    ($ty:ty, $kind:expr) => {
        impl Element for $ty {
            const KIND: ViewKind = $kind;

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn write(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

element!(i8, ViewKind::Int8);
element!(u8, ViewKind::Uint8);
element!(i16, ViewKind::Int16);
element!(u16, ViewKind::Uint16);
element!(i32, ViewKind::Int32);
element!(u32, ViewKind::Uint32);
element!(f32, ViewKind::Float32);
element!(f64, ViewKind::Float64);

/// Identity of a linear memory buffer: base address and byte length.
///
/// Growing memory either moves the buffer or changes its length, so two
/// observations with equal identity see the same buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId {
    base: usize,
    byte_len: usize,
}

impl BufferId {
    /// Identity of a raw buffer.
    pub fn new(base: usize, byte_len: usize) -> Self {
        Self { base, byte_len }
    }

    /// Identity of the memory currently backing `data`.
    pub fn of(data: &[u8]) -> Self {
        Self::new(data.as_ptr() as usize, data.len())
    }

    /// Byte length of the buffer.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

/// A typed window over the entire current linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedView {
    kind: ViewKind,
    buffer: BufferId,
}

impl TypedView {
    fn new(kind: ViewKind, buffer: BufferId) -> Self {
        Self { kind, buffer }
    }

    /// Element kind.
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    /// Number of whole elements covered.
    pub fn len(&self) -> usize {
        self.buffer.byte_len / self.kind.width()
    }

    /// True when the view covers no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length in bytes of the underlying buffer.
    pub fn byte_len(&self) -> usize {
        self.buffer.byte_len
    }

    /// Whether this view was derived from `current`.
    pub fn is_current(&self, current: BufferId) -> bool {
        self.buffer.byte_len != 0 && self.buffer == current
    }

    /// Element range for `len` elements starting at byte offset `ptr`.
    ///
    /// The byte offset is divided by the element width, truncating like a
    /// typed-array `subarray(ptr / width, ptr / width + len)`.
    pub fn subarray(&self, ptr: u32, len: usize) -> Result<Range<usize>> {
        let start = ptr as usize / self.kind.width();
        let end = start.checked_add(len).ok_or(BridgeError::OutOfBounds {
            offset: ptr as usize,
            len,
            size: self.byte_len(),
        })?;
        if end > self.len() {
            return Err(BridgeError::OutOfBounds {
                offset: ptr as usize,
                len: len * self.kind.width(),
                size: self.byte_len(),
            });
        }
        Ok(start..end)
    }

    /// Byte range backing [`TypedView::subarray`].
    pub fn byte_range(&self, ptr: u32, len: usize) -> Result<Range<usize>> {
        let elements = self.subarray(ptr, len)?;
        let width = self.kind.width();
        Ok(elements.start * width..elements.end * width)
    }

    /// Copy `len` elements starting at byte offset `ptr` out of `data`.
    pub fn read<T: Element>(&self, data: &[u8], ptr: u32, len: usize) -> Result<Vec<T>> {
        self.check_element::<T>()?;
        let range = self.byte_range(ptr, len)?;
        Ok(data[range]
            .chunks_exact(T::KIND.width())
            .map(T::read)
            .collect())
    }

    /// Store `values` starting at byte offset `ptr` in `data`.
    pub fn write<T: Element>(&self, data: &mut [u8], ptr: u32, values: &[T]) -> Result<()> {
        self.check_element::<T>()?;
        let range = self.byte_range(ptr, values.len())?;
        for (chunk, value) in data[range].chunks_exact_mut(T::KIND.width()).zip(values) {
            value.write(chunk);
        }
        Ok(())
    }

    fn check_element<T: Element>(&self) -> Result<()> {
        if T::KIND != self.kind {
            return Err(BridgeError::Signature(format!(
                "{} view accessed as {}",
                self.kind.class_name(),
                T::KIND.class_name()
            )));
        }
        Ok(())
    }
}

/// Per-kind cache of typed views.
#[derive(Debug, Default)]
pub struct ViewCache {
    slots: [Option<TypedView>; 8],
    rebuilds: u64,
}

impl ViewCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// View of `kind` over `current`, rebuilding the cached one if stale.
    pub fn get(&mut self, kind: ViewKind, current: BufferId) -> TypedView {
        let slot = &mut self.slots[kind.slot()];
        match slot {
            Some(view) if view.is_current(current) => *view,
            _ => {
                let view = TypedView::new(kind, current);
                tracing::trace!(kind = kind.class_name(), bytes = current.byte_len(), "rebuilding memory view");
                *slot = Some(view);
                self.rebuilds += 1;
                view
            }
        }
    }

    /// The cached view of `kind`, stale or not.
    pub fn cached(&self, kind: ViewKind) -> Option<TypedView> {
        self.slots[kind.slot()]
    }

    /// Drop every cached view.
    pub fn invalidate_all(&mut self) {
        self.slots = [None; 8];
    }

    /// Number of views built so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}
