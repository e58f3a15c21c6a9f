//! Moving strings and arrays across the memory boundary.
//!
//! Every helper here takes the store context, looks up the memory export,
//! and derives its view through the cache at the moment of access. Nothing
//! holds a view across a call into the module: `malloc` and `realloc` may
//! grow memory, so the helpers that call them re-derive afterwards.

use std::str::Utf8Error;

use wasmtime::{AsContextMut, StoreContextMut};

use super::views::{BufferId, Element, TypedView, ViewKind};
use crate::error::{BridgeError, Result};
use crate::state::BridgeState;
use crate::value::TypedArray;

/// Decoded byte count after which the decoder is recreated.
pub const DEFAULT_ROTATION_BYTES: usize = 2_146_435_072;

/// Strict UTF-8 decoder with a bounded lifetime.
///
/// Some hosts degrade after a single decoder has processed about 2 GB, so
/// the decoder is recreated once the cumulative decoded length reaches the
/// threshold. A fresh decoder is primed with a zero-length decode, and the
/// counter restarts at the length of the string that triggered the rotation.
#[derive(Debug, Clone)]
pub struct Utf8Decoder {
    threshold: usize,
    decoded: usize,
    generation: u64,
    passes: u64,
}

impl Utf8Decoder {
    /// Create a decoder that rotates after `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            decoded: 0,
            generation: 0,
            passes: 0,
        }
    }

    /// Decode `bytes`, failing on malformed input.
    pub fn decode<'a>(&mut self, bytes: &'a [u8]) -> std::result::Result<&'a str, Utf8Error> {
        self.decoded = self.decoded.saturating_add(bytes.len());
        if self.decoded >= self.threshold {
            self.rotate();
            self.decoded = bytes.len();
        }
        self.pass(bytes)
    }

    fn pass<'a>(&mut self, bytes: &'a [u8]) -> std::result::Result<&'a str, Utf8Error> {
        self.passes += 1;
        std::str::from_utf8(bytes)
    }

    fn rotate(&mut self) {
        self.generation += 1;
        self.passes = 0;
        let primed = self.pass(&[]).is_ok();
        tracing::debug!(generation = self.generation, primed, "utf-8 decoder rotated");
    }

    /// Bytes counted since the last rotation.
    pub fn decoded(&self) -> usize {
        self.decoded
    }

    /// Decode passes run by the current decoder, priming included.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Number of rotations so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Rotation threshold in bytes.
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_ROTATION_BYTES)
    }
}

/// Run `f` over the current memory bytes, a fresh view of `kind`, and the state.
fn with_view<R>(
    cx: &mut StoreContextMut<'_, BridgeState>,
    kind: ViewKind,
    f: impl FnOnce(&mut [u8], TypedView, &mut BridgeState) -> Result<R>,
) -> Result<R> {
    let memory = cx.data().exports()?.memory;
    let (data, state) = memory.data_and_store_mut(cx.as_context_mut());
    let view = state.views.get(kind, BufferId::of(data));
    f(data, view, state)
}

/// Current view of `kind`.
pub fn view(cx: &mut StoreContextMut<'_, BridgeState>, kind: ViewKind) -> Result<TypedView> {
    with_view(cx, kind, |_, view, _| Ok(view))
}

/// Decode the UTF-8 string at `(ptr, len)`.
pub fn read_string(cx: &mut StoreContextMut<'_, BridgeState>, ptr: u32, len: usize) -> Result<String> {
    with_view(cx, ViewKind::Uint8, |data, view, state| {
        let range = view.byte_range(ptr, len)?;
        let s = state.decoder.decode(&data[range])?;
        Ok(s.to_owned())
    })
}

/// Copy `len` elements of type `T` starting at byte offset `ptr`.
pub fn read_array<T: Element>(
    cx: &mut StoreContextMut<'_, BridgeState>,
    ptr: u32,
    len: usize,
) -> Result<Vec<T>> {
    with_view(cx, T::KIND, |data, view, _| view.read::<T>(data, ptr, len))
}

/// Copy `len` elements of `kind` into a host-owned array.
pub fn read_typed(
    cx: &mut StoreContextMut<'_, BridgeState>,
    kind: ViewKind,
    ptr: u32,
    len: usize,
) -> Result<TypedArray> {
    with_view(cx, kind, |data, view, _| {
        let range = view.byte_range(ptr, len)?;
        Ok(TypedArray::from_bytes(kind, data[range].to_vec()))
    })
}

/// Copy a host array back over `array.len()` elements at `ptr`.
pub fn write_typed(
    cx: &mut StoreContextMut<'_, BridgeState>,
    ptr: u32,
    array: &TypedArray,
) -> Result<()> {
    with_view(cx, array.kind(), |data, view, _| {
        let range = view.byte_range(ptr, array.len())?;
        array.with_bytes_mut(|bytes| data[range].copy_from_slice(bytes));
        Ok(())
    })
}

/// Store `values` starting at byte offset `ptr`.
pub fn write_array<T: Element>(
    cx: &mut StoreContextMut<'_, BridgeState>,
    ptr: u32,
    values: &[T],
) -> Result<()> {
    with_view(cx, T::KIND, |data, view, _| view.write::<T>(data, ptr, values))
}

/// Store raw bytes at `ptr`.
pub fn write_bytes(cx: &mut StoreContextMut<'_, BridgeState>, ptr: u32, bytes: &[u8]) -> Result<()> {
    with_view(cx, ViewKind::Uint8, |data, view, _| {
        let range = view.byte_range(ptr, bytes.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    })
}

/// Store a little-endian i32 at any byte offset.
pub fn write_i32(cx: &mut StoreContextMut<'_, BridgeState>, ptr: u32, value: i32) -> Result<()> {
    write_bytes(cx, ptr, &value.to_le_bytes())
}

/// Store a little-endian f64 at any byte offset.
pub fn write_f64(cx: &mut StoreContextMut<'_, BridgeState>, ptr: u32, value: f64) -> Result<()> {
    write_bytes(cx, ptr, &value.to_le_bytes())
}

fn malloc(cx: &mut StoreContextMut<'_, BridgeState>, size: usize, align: usize) -> Result<u32> {
    let malloc = cx.data().exports()?.require_malloc()?;
    let ptr = malloc
        .call(&mut *cx, (size as i32, align as i32))
        .map_err(BridgeError::from_wasm)?;
    Ok(ptr as u32)
}

/// Copy `s` into module memory as UTF-8 and return `(ptr, len)`.
///
/// The first allocation is sized for the UTF-16 length, which is exact for
/// ASCII. The first non-ASCII character triggers one `realloc` to the worst
/// case of three bytes per remaining unit, and a final `realloc` shrinks to
/// the written length. The length is also published as the last written
/// length.
pub fn pass_string(cx: &mut StoreContextMut<'_, BridgeState>, s: &str) -> Result<(u32, usize)> {
    let realloc = cx.data().exports()?.realloc.clone();
    let Some(realloc) = realloc else {
        let bytes = s.as_bytes();
        let ptr = malloc(cx, bytes.len(), 1)?;
        write_bytes(cx, ptr, bytes)?;
        cx.data_mut().last_written_len = bytes.len();
        return Ok((ptr, bytes.len()));
    };

    let units = s.encode_utf16().count();
    let mut ptr = malloc(cx, units, 1)?;

    let ascii = s.bytes().take_while(u8::is_ascii).count();
    write_bytes(cx, ptr, &s.as_bytes()[..ascii])?;
    let mut offset = ascii;

    if ascii != s.len() {
        let rest = &s[ascii..];
        let capacity = offset + rest.encode_utf16().count() * 3;
        ptr = realloc
            .call(&mut *cx, (ptr as i32, units as i32, capacity as i32, 1))
            .map_err(BridgeError::from_wasm)? as u32;
        write_bytes(cx, ptr + offset as u32, rest.as_bytes())?;
        offset += rest.len();
        ptr = realloc
            .call(&mut *cx, (ptr as i32, capacity as i32, offset as i32, 1))
            .map_err(BridgeError::from_wasm)? as u32;
    }

    cx.data_mut().last_written_len = offset;
    Ok((ptr, offset))
}

/// Copy `values` into a fresh module allocation and return `(ptr, len)`.
pub fn pass_array<T: Element>(
    cx: &mut StoreContextMut<'_, BridgeState>,
    values: &[T],
) -> Result<(u32, usize)> {
    let width = T::KIND.width();
    let ptr = malloc(cx, values.len() * width, width)?;
    write_array(cx, ptr, values)?;
    cx.data_mut().last_written_len = values.len();
    Ok((ptr, values.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_strict() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode("abc€".as_bytes()).unwrap(), "abc€");
        assert!(decoder.decode(&[0x61, 0xff]).is_err());
        assert_eq!(decoder.decoded(), 8);
    }

    #[test]
    fn test_rotation_resets_counter_to_triggering_length() {
        let mut decoder = Utf8Decoder::new(10);
        decoder.decode(b"abcdef").unwrap();
        assert_eq!(decoder.generation(), 0);
        decoder.decode(b"ghij").unwrap();
        assert_eq!(decoder.generation(), 1);
        assert_eq!(decoder.decoded(), 4);
        decoder.decode(b"klm").unwrap();
        assert_eq!(decoder.generation(), 1);
        assert_eq!(decoder.decoded(), 7);
    }

    #[test]
    fn test_rotated_decoder_is_primed() {
        let mut decoder = Utf8Decoder::new(10);
        decoder.decode(b"abcdef").unwrap();
        assert_eq!(decoder.passes(), 1);

        // Rotation primes the fresh decoder, then decodes the triggering string
        assert_eq!(decoder.decode(b"ghij").unwrap(), "ghij");
        assert_eq!(decoder.generation(), 1);
        assert_eq!(decoder.passes(), 2);
        assert_eq!(decoder.decoded(), 4);

        decoder.decode(b"klm").unwrap();
        assert_eq!(decoder.passes(), 3);
        assert_eq!(decoder.generation(), 1);
        assert_eq!(decoder.decoded(), 7);
    }

    #[test]
    fn test_rotation_on_single_large_string() {
        let mut decoder = Utf8Decoder::new(4);
        assert_eq!(decoder.decode(b"hello").unwrap(), "hello");
        assert_eq!(decoder.generation(), 1);
        assert_eq!(decoder.decoded(), 5);
        decoder.decode(b"").unwrap();
        assert_eq!(decoder.generation(), 2);
        assert_eq!(decoder.decoded(), 0);
    }
}
