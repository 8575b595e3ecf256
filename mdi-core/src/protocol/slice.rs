//! SLICE_DATA payload and the zero-copy pixel buffer it carries.
//!
//! # Wire Layout
//!
//! ```text
//! offset  size  field
//!      0    32  file_id         UTF-8, NUL-padded
//!     32     4  slice_index     u32
//!     36     4  width           u32
//!     40     4  height          u32
//!     44     4  dtype_code      u32
//!     48     4  min_value       f32
//!     52     4  max_value       f32
//!     56     4  window_center   f32
//!     60     4  window_width    f32
//!     64     4  reserved
//!     68     …  pixels          width × height × element_size bytes
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::slice::ChunksExact;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::header::{read_f32, read_u32};
use crate::message::DType;

pub const SLICE_HEADER_SIZE: usize = 68;
pub const FILE_ID_LEN: usize = 32;

// ── Pixel ────────────────────────────────────────────────────────

/// A numeric element type that can live in a [`PixelBuffer`].
pub trait Pixel: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    /// Decode one little-endian element. `bytes.len()` equals the
    /// dtype's element size.
    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, out: &mut BytesMut);

    fn to_f64(self) -> f64;
}

macro_rules! impl_pixel {
    ($ty:ty, $dtype:expr, $size:expr) => {
        impl Pixel for $ty {
            const DTYPE: DType = $dtype;

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $size];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn write_le(self, out: &mut BytesMut) {
                out.put_slice(&self.to_le_bytes());
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

impl_pixel!(u8, DType::Uint8, 1);
impl_pixel!(u16, DType::Uint16, 2);
impl_pixel!(i16, DType::Int16, 2);
impl_pixel!(f32, DType::Float32, 4);
impl_pixel!(f64, DType::Float64, 8);

fn read_as_f64<T: Pixel>(bytes: &[u8]) -> f64 {
    T::read_le(bytes).to_f64()
}

fn reader_for(dtype: DType) -> fn(&[u8]) -> f64 {
    match dtype {
        DType::Uint8 => read_as_f64::<u8>,
        DType::Uint16 => read_as_f64::<u16>,
        DType::Int16 => read_as_f64::<i16>,
        DType::Float32 => read_as_f64::<f32>,
        DType::Float64 => read_as_f64::<f64>,
    }
}

// ── PixelBuffer ──────────────────────────────────────────────────

/// Raw little-endian pixel bytes tagged with their element type.
///
/// Cloning is a reference-count bump; the bytes are shared, never copied.
/// Moving a `PixelBuffer` into another task hands off the allocation.
#[derive(Clone, PartialEq)]
pub struct PixelBuffer {
    dtype: DType,
    bytes: Bytes,
}

impl PixelBuffer {
    /// Wrap `bytes` as elements of `dtype`.
    ///
    /// Fails when the byte count is not a whole number of elements.
    pub fn new(dtype: DType, bytes: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let bytes = bytes.into();
        let size = dtype.element_size();
        if bytes.len() % size != 0 {
            return Err(ProtocolError::InvalidPixelDataSize {
                expected: bytes.len() - bytes.len() % size,
                actual: bytes.len(),
            });
        }
        Ok(Self { dtype, bytes })
    }

    pub fn from_values<T: Pixel>(values: &[T]) -> Self {
        let mut out = BytesMut::with_capacity(values.len() * T::DTYPE.element_size());
        for v in values {
            v.write_le(&mut out);
        }
        Self {
            dtype: T::DTYPE,
            bytes: out.freeze(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.dtype.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Typed view when `T` matches the buffer's dtype.
    pub fn typed<T: Pixel>(&self) -> Option<TypedView<'_, T>> {
        (T::DTYPE == self.dtype).then(|| TypedView {
            bytes: &self.bytes,
            _marker: PhantomData,
        })
    }

    /// Element `index` widened to `f64`.
    pub fn get(&self, index: usize) -> Option<f64> {
        let size = self.dtype.element_size();
        let start = index.checked_mul(size)?;
        let chunk = self.bytes.get(start..start.checked_add(size)?)?;
        Some(reader_for(self.dtype)(chunk))
    }

    /// All elements widened to `f64`, in order.
    pub fn values(&self) -> Values<'_> {
        Values {
            chunks: self.bytes.chunks_exact(self.dtype.element_size()),
            read: reader_for(self.dtype),
        }
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("dtype", &self.dtype)
            .field("len", &self.len())
            .finish()
    }
}

/// Iterator over a buffer's elements as `f64`.
#[derive(Clone)]
pub struct Values<'a> {
    chunks: ChunksExact<'a, u8>,
    read: fn(&[u8]) -> f64,
}

impl Iterator for Values<'_> {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        self.chunks.next().map(self.read)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Values<'_> {}

/// Borrowed, typed window over a [`PixelBuffer`]'s bytes.
///
/// Elements are decoded on access, so the view has no alignment
/// requirement and never copies the buffer.
#[derive(Clone, Copy)]
pub struct TypedView<'a, T: Pixel> {
    bytes: &'a [u8],
    _marker: PhantomData<T>,
}

impl<'a, T: Pixel> TypedView<'a, T> {
    pub fn len(&self) -> usize {
        self.bytes.len() / T::DTYPE.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        let size = T::DTYPE.element_size();
        let start = index.checked_mul(size)?;
        self.bytes.get(start..start.checked_add(size)?).map(T::read_le)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = T> + use<'a, T> {
        self.bytes
            .chunks_exact(T::DTYPE.element_size())
            .map(T::read_le)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }
}

// ── SliceDataPayload ─────────────────────────────────────────────

/// One decoded slice.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceDataPayload {
    pub file_id: String,
    pub slice_index: u32,
    pub width: u32,
    pub height: u32,
    pub min_value: f32,
    pub max_value: f32,
    pub window_center: f32,
    pub window_width: f32,
    pub data: PixelBuffer,
}

impl SliceDataPayload {
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Bytes held by the pixel buffer; the unit of L2 accounting.
    pub fn size_bytes(&self) -> usize {
        self.data.byte_len()
    }

    /// Serialize the sub-header and pixels.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let id = self.file_id.as_bytes();
        if id.len() > FILE_ID_LEN {
            return Err(ProtocolError::FileIdTooLong(id.len()));
        }
        let expected = expected_pixel_bytes(self.width, self.height, self.dtype());
        if expected != Some(self.data.byte_len()) {
            return Err(ProtocolError::InvalidPixelDataSize {
                expected: expected.unwrap_or(usize::MAX),
                actual: self.data.byte_len(),
            });
        }

        let mut buf = BytesMut::with_capacity(SLICE_HEADER_SIZE + self.data.byte_len());
        buf.put_slice(id);
        buf.put_bytes(0, FILE_ID_LEN - id.len());
        buf.put_u32_le(self.slice_index);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.dtype().code());
        buf.put_f32_le(self.min_value);
        buf.put_f32_le(self.max_value);
        buf.put_f32_le(self.window_center);
        buf.put_f32_le(self.window_width);
        buf.put_u32_le(0);
        buf.put_slice(self.data.as_bytes());
        Ok(buf.freeze())
    }

    /// Parse a SLICE_DATA payload. The pixel buffer aliases `payload`.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < SLICE_HEADER_SIZE {
            return Err(ProtocolError::PayloadTooShort {
                kind: "slice",
                expected: SLICE_HEADER_SIZE,
                actual: payload.len(),
            });
        }

        let id_field = &payload[..FILE_ID_LEN];
        let id_len = id_field.iter().position(|&b| b == 0).unwrap_or(FILE_ID_LEN);
        let file_id = std::str::from_utf8(&id_field[..id_len])
            .map_err(|_| ProtocolError::InvalidUtf8("file id"))?
            .to_owned();

        let slice_index = read_u32(&payload, 32);
        let width = read_u32(&payload, 36);
        let height = read_u32(&payload, 40);
        let dtype = DType::try_from(read_u32(&payload, 44))?;

        let actual = payload.len() - SLICE_HEADER_SIZE;
        let expected = expected_pixel_bytes(width, height, dtype);
        if expected != Some(actual) {
            return Err(ProtocolError::InvalidPixelDataSize {
                expected: expected.unwrap_or(usize::MAX),
                actual,
            });
        }

        Ok(Self {
            file_id,
            slice_index,
            width,
            height,
            min_value: read_f32(&payload, 48),
            max_value: read_f32(&payload, 52),
            window_center: read_f32(&payload, 56),
            window_width: read_f32(&payload, 60),
            data: PixelBuffer {
                dtype,
                bytes: payload.slice(SLICE_HEADER_SIZE..),
            },
        })
    }
}

fn expected_pixel_bytes(width: u32, height: u32, dtype: DType) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(dtype.element_size())
}
