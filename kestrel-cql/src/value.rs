//! The seam between typed Rust values and their bytes on the wire.
//!
//! Only the primitive types the driver itself needs are implemented here.
//! Richer codecs plug in by implementing [`SerializeValue`] and
//! [`DeserializeValue`] for their own types.

use bytes::{BufMut, Bytes};
use thiserror::Error;
use uuid::Uuid;

use crate::frame::frame_errors::LowLevelDeserializationError;
use crate::frame::types;

/// Failure to turn a value into bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SerializationError {
    #[error("Too many values: at most {} values can be bound", u16::MAX)]
    TooManyValues,
    #[error("Value too large: {0} bytes")]
    ValueTooBig(usize),
}

/// Failure to turn bytes back into a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeserializationError {
    #[error("Expected non-null value for {rust_type}")]
    UnexpectedNull { rust_type: &'static str },
    #[error("Expected {expected} bytes for {rust_type}, got {actual}")]
    BadLength {
        rust_type: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid UTF-8 in text value")]
    InvalidUtf8,
}

/// A single bound value as it travels in a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

impl<'a> RawValue<'a> {
    #[inline]
    pub fn as_value(&self) -> Option<&'a [u8]> {
        match self {
            RawValue::Value(v) => Some(v),
            RawValue::Null | RawValue::Unset => None,
        }
    }
}

/// Leaves a bound variable untouched on the server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaybeUnset<V> {
    Unset,
    Set(V),
}

/// A value that can be written as a length-prefixed `[value]`.
pub trait SerializeValue {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError>;
}

fn write_sized(bytes: &[u8], buf: &mut Vec<u8>) -> Result<(), SerializationError> {
    let len: i32 = bytes
        .len()
        .try_into()
        .map_err(|_| SerializationError::ValueTooBig(bytes.len()))?;
    buf.put_i32(len);
    buf.put_slice(bytes);
    Ok(())
}

macro_rules! impl_serialize_be_bytes {
    ($($t:ty),*) => {
        $(
            impl SerializeValue for $t {
                fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
                    write_sized(&self.to_be_bytes(), buf)
                }
            }
        )*
    };
}

impl_serialize_be_bytes!(i8, i16, i32, i64, f32, f64);

impl SerializeValue for bool {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        write_sized(&[*self as u8], buf)
    }
}

impl SerializeValue for str {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        write_sized(self.as_bytes(), buf)
    }
}

impl SerializeValue for String {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        self.as_str().serialize(buf)
    }
}

impl SerializeValue for [u8] {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        write_sized(self, buf)
    }
}

impl SerializeValue for Vec<u8> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        write_sized(self, buf)
    }
}

impl SerializeValue for Bytes {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        write_sized(self, buf)
    }
}

impl SerializeValue for Uuid {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        write_sized(self.as_bytes(), buf)
    }
}

impl<T: SerializeValue> SerializeValue for Option<T> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        match self {
            Some(v) => v.serialize(buf),
            None => {
                buf.put_i32(-1);
                Ok(())
            }
        }
    }
}

impl<T: SerializeValue> SerializeValue for MaybeUnset<T> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        match self {
            MaybeUnset::Set(v) => v.serialize(buf),
            MaybeUnset::Unset => {
                buf.put_i32(-2);
                Ok(())
            }
        }
    }
}

impl<T: SerializeValue + ?Sized> SerializeValue for &T {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
        (**self).serialize(buf)
    }
}

/// Positional values bound to a query, already in wire form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized: Vec<u8>,
    count: u16,
}

impl SerializedValues {
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    pub const fn new() -> Self {
        SerializedValues {
            serialized: Vec::new(),
            count: 0,
        }
    }

    pub fn add_value(&mut self, val: &impl SerializeValue) -> Result<(), SerializationError> {
        if self.count == u16::MAX {
            return Err(SerializationError::TooManyValues);
        }
        let len_before = self.serialized.len();
        if let Err(err) = val.serialize(&mut self.serialized) {
            self.serialized.truncate(len_before);
            return Err(err);
        }
        self.count += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> u16 {
        self.count
    }

    pub fn buffer_size(&self) -> usize {
        self.serialized.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = RawValue<'_>> {
        let mut buf = &self.serialized[..];
        std::iter::from_fn(move || {
            if buf.is_empty() {
                return None;
            }
            // Contents were written by `add_value`, so the layout is well-formed.
            read_raw_value(&mut buf).ok()
        })
    }

    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.count);
        buf.put_slice(&self.serialized);
    }

    /// Parses the `[short] n` + `n x [value]` block of a request.
    pub fn new_from_frame(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let count = types::read_short(buf)?;
        let start = *buf;
        for _ in 0..count {
            read_raw_value(buf)?;
        }
        let consumed = start.len() - buf.len();
        Ok(SerializedValues {
            serialized: start[..consumed].to_vec(),
            count,
        })
    }
}

fn read_raw_value<'a>(buf: &mut &'a [u8]) -> Result<RawValue<'a>, LowLevelDeserializationError> {
    let len = types::read_int(buf)?;
    match len {
        -2 => Ok(RawValue::Unset),
        -1 => Ok(RawValue::Null),
        len if len >= 0 => Ok(RawValue::Value(types::read_raw_bytes(len as usize, buf)?)),
        len => Err(LowLevelDeserializationError::InvalidValueLength(len)),
    }
}

/// A row of values that can be bound to a query.
pub trait SerializeRow {
    fn serialize_row(&self, values: &mut SerializedValues) -> Result<(), SerializationError>;
}

impl SerializeRow for () {
    fn serialize_row(&self, _values: &mut SerializedValues) -> Result<(), SerializationError> {
        Ok(())
    }
}

impl<T: SerializeValue> SerializeRow for [T] {
    fn serialize_row(&self, values: &mut SerializedValues) -> Result<(), SerializationError> {
        self.iter().try_for_each(|v| values.add_value(v))
    }
}

impl<T: SerializeValue> SerializeRow for Vec<T> {
    fn serialize_row(&self, values: &mut SerializedValues) -> Result<(), SerializationError> {
        self.as_slice().serialize_row(values)
    }
}

macro_rules! impl_serialize_row_for_tuple {
    ($($t:ident => $idx:tt),+) => {
        impl<$($t: SerializeValue),+> SerializeRow for ($($t,)+) {
            fn serialize_row(&self, values: &mut SerializedValues) -> Result<(), SerializationError> {
                $(values.add_value(&self.$idx)?;)+
                Ok(())
            }
        }
    };
}

impl_serialize_row_for_tuple!(A => 0);
impl_serialize_row_for_tuple!(A => 0, B => 1);
impl_serialize_row_for_tuple!(A => 0, B => 1, C => 2);
impl_serialize_row_for_tuple!(A => 0, B => 1, C => 2, D => 3);
impl_serialize_row_for_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4);

/// A value that can be read back out of a result cell.
pub trait DeserializeValue: Sized {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError>;
}

fn non_null<'a>(
    cell: Option<&'a [u8]>,
    rust_type: &'static str,
) -> Result<&'a [u8], DeserializationError> {
    cell.ok_or(DeserializationError::UnexpectedNull { rust_type })
}

fn exact<const N: usize>(
    cell: Option<&[u8]>,
    rust_type: &'static str,
) -> Result<[u8; N], DeserializationError> {
    let raw = non_null(cell, rust_type)?;
    raw.try_into().map_err(|_| DeserializationError::BadLength {
        rust_type,
        expected: N,
        actual: raw.len(),
    })
}

macro_rules! impl_deserialize_be_bytes {
    ($($t:ty),*) => {
        $(
            impl DeserializeValue for $t {
                fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
                    Ok(<$t>::from_be_bytes(exact(cell, stringify!($t))?))
                }
            }
        )*
    };
}

impl_deserialize_be_bytes!(i8, i16, i32, i64, f32, f64);

impl DeserializeValue for bool {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        let [b] = exact::<1>(cell, "bool")?;
        Ok(b != 0)
    }
}

impl DeserializeValue for String {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        let raw = non_null(cell, "String")?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DeserializationError::InvalidUtf8)
    }
}

impl DeserializeValue for Vec<u8> {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        Ok(non_null(cell, "Vec<u8>")?.to_vec())
    }
}

impl DeserializeValue for Uuid {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        Ok(Uuid::from_bytes(exact(cell, "Uuid")?))
    }
}

impl<T: DeserializeValue> DeserializeValue for Option<T> {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        cell.map(|raw| T::deserialize(Some(raw))).transpose()
    }
}
