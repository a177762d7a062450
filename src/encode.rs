//! Serialize values into the Kafka wire format.
//!
//! Only the classic (non-flexible) encodings are needed: every Fetch version
//! this crate speaks predates compact arrays and tagged fields.
use bytes::{BufMut, Bytes};

use crate::error::{Error, Result};

pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

macro_rules! impl_to_byte_int {
    ($($ty:ty => $put:ident),* $(,)?) => {
        $(
            impl ToByte for $ty {
                fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
                    buffer.$put(*self);
                    Ok(())
                }
            }
        )*
    };
}

impl_to_byte_int!(i8 => put_i8, i16 => put_i16, i32 => put_i32, i64 => put_i64);

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        let len = i16::try_from(self.len())
            .map_err(|_| Error::InvalidFrame(format!("string of {} bytes", self.len())))?;
        buffer.put_i16(len);
        buffer.put_slice(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

/// BYTES: i32 length followed by the raw payload.
impl ToByte for Bytes {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        let len = i32::try_from(self.len())
            .map_err(|_| Error::InvalidFrame(format!("payload of {} bytes", self.len())))?;
        buffer.put_i32(len);
        buffer.put_slice(self);
        Ok(())
    }
}

/// NULLABLE_BYTES: a length of -1 stands for null.
impl ToByte for Option<Bytes> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(xs) => xs.encode(buffer),
            None => (-1i32).encode(buffer),
        }
    }
}

/// NULLABLE_STRING uses an i16 length prefix.
impl ToByte for Option<String> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(xs) => xs.encode(buffer),
            None => (-1i16).encode(buffer),
        }
    }
}

impl<V: ToByte> ToByte for [V] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_as_array(buffer, self, |buffer, x| x.encode(buffer))
    }
}

impl<V: ToByte> ToByte for Vec<V> {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_slice().encode(buffer)
    }
}

/// Renders the length of `xs` to `buffer` as the start of a
/// protocol array and then for each element of `xs` invokes `f`
/// assuming that function will render the element to the buffer.
pub fn encode_as_array<T, F, W>(buffer: &mut W, xs: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    let len = i32::try_from(xs.len())
        .map_err(|_| Error::InvalidFrame(format!("array of {} elements", xs.len())))?;
    buffer.put_i32(len);
    for x in xs {
        f(buffer, x)?;
    }
    Ok(())
}

/// Like [`encode_as_array`] but a `None` renders the null array (-1).
pub fn encode_nullable_array<T, F, W>(buffer: &mut W, xs: Option<&[T]>, f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    match xs {
        Some(xs) => encode_as_array(buffer, xs, f),
        None => {
            buffer.put_i32(-1);
            Ok(())
        }
    }
}
