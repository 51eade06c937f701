//! Little-endian primitive reads and writes over byte slices.

use crate::{Error::OutOfBounds, Result};

/// Primitive types that can be read from, and written to, a little-endian byte stream.
pub trait CilIO: Sized + Copy {
    /// Fixed-size byte representation of the type
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Build a value from its little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Convert the value to its little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
    f32 => 4,
    f64 => 8,
}

/// Read a `T` at `offset` and advance the offset past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let end = offset.checked_add(size).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(bytes) = T::Bytes::try_from(&data[*offset..end]) else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(bytes))
}

/// Append the little-endian bytes of `value` to `out`.
pub fn write_le<T: CilIO>(out: &mut Vec<u8>, value: T) {
    out.extend_from_slice(value.to_le_bytes().as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_u32() {
        let mut offset = 0;
        let result = read_le_at::<u32>(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(result, 0x0403_0201);
        assert_eq!(offset, 4);
    }

    #[test]
    fn read_le_i8_negative() {
        let mut offset = 0;
        let result = read_le_at::<i8>(&[0xFE], &mut offset).unwrap();
        assert_eq!(result, -2);
    }

    #[test]
    fn read_le_past_end() {
        let mut offset = 6;
        assert!(matches!(
            read_le_at::<u32>(&TEST_BUFFER, &mut offset),
            Err(OutOfBounds)
        ));
        assert_eq!(offset, 6);
    }

    #[test]
    fn write_then_read_f64() {
        let mut out = Vec::new();
        write_le(&mut out, 2.5f64);
        assert_eq!(out.len(), 8);

        let mut offset = 0;
        assert_eq!(read_le_at::<f64>(&out, &mut offset).unwrap(), 2.5);
    }
}
