//! Wire messages exchanged with the vision system, the referee, the radio
//! and downstream status consumers.
//!
//! Messages are encoded little-endian with protobuf-style varints for
//! lengths. Every message implements [`Encode`] and [`Decode`]; malformed
//! input surfaces as [`Error`] so the caller can drop the packet.

use std::io::{Read, Write};
use std::string::FromUtf8Error;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

pub mod command;
pub mod radio;
pub mod referee;
pub mod vision;
pub mod world;

/// The multicast group ssl-vision publishes detection and geometry frames on.
pub const VISION_MULTICAST_ADDR: &str = "224.5.23.2";
pub const VISION_DEFAULT_PORT: u16 = 10020;

/// The multicast group the league referee box publishes on.
pub const REFEREE_MULTICAST_ADDR: &str = "224.5.23.1";
pub const REFEREE_DEFAULT_PORT: u16 = 10003;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error while encoding or decoding")]
    Io(#[from] std::io::Error),
    #[error("varint is longer than 10 bytes")]
    VarInt,
    #[error("string field is not valid utf-8")]
    Utf8(#[from] FromUtf8Error),
    #[error("unknown enum discriminant {0}")]
    Discriminant(u64),
    #[error("repeated field length {0} exceeds the packet bound")]
    Length(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

// repeated fields larger than this cannot come from a sane packet
const MAX_REPEATED: u64 = 4096;

/// Encodes `self` onto a writer. See [`Decode`] for the inverse.
pub trait Encode {
    fn encode(&self, write: &mut impl Write) -> Result<()>;

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // writing to a Vec cannot fail
        self.encode(&mut buf).unwrap();
        buf
    }
}

/// Decodes `Self` from a reader. See [`Encode`] for the inverse.
pub trait Decode: Sized {
    fn decode(read: &mut impl Read) -> Result<Self>;

    fn decode_from_slice(mut bytes: &[u8]) -> Result<Self> {
        Self::decode(&mut bytes)
    }
}

fn encode_varint(mut value: u64, write: &mut impl Write) -> Result<()> {
    while value >= 0x80 {
        write.write_u8(0b1000_0000 | (value as u8))?;
        value >>= 7;
    }
    write.write_u8(value as u8)?;
    Ok(())
}

fn decode_varint(read: &mut impl Read) -> Result<u64> {
    let mut value = 0u64;
    for shift in 0..10 {
        let byte = read.read_u8()?;
        value |= u64::from(byte & 0b0111_1111) << (shift * 7);
        if byte & 0b1000_0000 == 0 {
            return Ok(value);
        }
    }
    Err(Error::VarInt)
}

macro_rules! impl_primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Encode for $ty {
            fn encode(&self, write: &mut impl Write) -> Result<()> {
                write.$write::<LittleEndian>(*self)?;
                Ok(())
            }
        }
        impl Decode for $ty {
            fn decode(read: &mut impl Read) -> Result<Self> {
                Ok(read.$read::<LittleEndian>()?)
            }
        }
    };
}

impl_primitive!(u16, write_u16, read_u16);
impl_primitive!(u32, write_u32, read_u32);
impl_primitive!(u64, write_u64, read_u64);
impl_primitive!(i16, write_i16, read_i16);
impl_primitive!(i32, write_i32, read_i32);
impl_primitive!(i64, write_i64, read_i64);
impl_primitive!(f32, write_f32, read_f32);
impl_primitive!(f64, write_f64, read_f64);

impl Encode for u8 {
    fn encode(&self, write: &mut impl Write) -> Result<()> {
        write.write_u8(*self)?;
        Ok(())
    }
}

impl Decode for u8 {
    fn decode(read: &mut impl Read) -> Result<Self> {
        Ok(read.read_u8()?)
    }
}

impl Encode for bool {
    fn encode(&self, write: &mut impl Write) -> Result<()> {
        write.write_u8(u8::from(*self))?;
        Ok(())
    }
}

impl Decode for bool {
    fn decode(read: &mut impl Read) -> Result<Self> {
        Ok(read.read_u8()? != 0)
    }
}

impl Encode for String {
    fn encode(&self, write: &mut impl Write) -> Result<()> {
        encode_varint(self.len() as u64, write)?;
        write.write_all(self.as_bytes())?;
        Ok(())
    }
}

impl Decode for String {
    fn decode(read: &mut impl Read) -> Result<Self> {
        let length = decode_varint(read)?;
        if length > MAX_REPEATED {
            return Err(Error::Length(length));
        }
        let mut buf = vec![0; length as usize];
        read.read_exact(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, write: &mut impl Write) -> Result<()> {
        encode_varint(self.len() as u64, write)?;
        for item in self {
            item.encode(write)?;
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(read: &mut impl Read) -> Result<Self> {
        let length = decode_varint(read)?;
        if length > MAX_REPEATED {
            return Err(Error::Length(length));
        }
        let mut vec = Vec::with_capacity(length as usize);
        for _ in 0..length {
            vec.push(T::decode(read)?);
        }
        Ok(vec)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, write: &mut impl Write) -> Result<()> {
        match self {
            Some(value) => {
                true.encode(write)?;
                value.encode(write)
            }
            None => false.encode(write),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(read: &mut impl Read) -> Result<Self> {
        if bool::decode(read)? {
            Ok(Some(T::decode(read)?))
        } else {
            Ok(None)
        }
    }
}

/// Declares a message struct and derives field-by-field [`Encode`] and
/// [`Decode`], in declaration order.
#[macro_export]
macro_rules! message {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$field_meta:meta])* pub $field:ident: $ty:ty,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $name {
            $($(#[$field_meta])* pub $field: $ty,)*
        }

        impl $crate::Encode for $name {
            fn encode(&self, write: &mut impl ::std::io::Write) -> $crate::Result<()> {
                $($crate::Encode::encode(&self.$field, write)?;)*
                Ok(())
            }
        }

        impl $crate::Decode for $name {
            fn decode(read: &mut impl ::std::io::Read) -> $crate::Result<Self> {
                Ok(Self {
                    $($field: $crate::Decode::decode(read)?,)*
                })
            }
        }
    };
}

/// Declares a field-less message enum encoded as its `u8` discriminant.
#[macro_export]
macro_rules! message_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$variant_meta:meta])* $variant:ident = $value:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$variant_meta])* $variant = $value,)*
        }

        impl $crate::Encode for $name {
            fn encode(&self, write: &mut impl ::std::io::Write) -> $crate::Result<()> {
                $crate::Encode::encode(&(*self as u8), write)
            }
        }

        impl $crate::Decode for $name {
            fn decode(read: &mut impl ::std::io::Read) -> $crate::Result<Self> {
                let value = <u8 as $crate::Decode>::decode(read)?;
                match value {
                    $($value => Ok(Self::$variant),)*
                    other => Err($crate::Error::Discriminant(u64::from(other))),
                }
            }
        }
    };
}

message! {
    /// 2-D point, meters unless a message says otherwise.
    pub struct Point {
        pub x: f32,
        pub y: f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Debug;

    fn roundtrip<T>(input: T)
    where
        T: Encode + Decode + Debug + PartialEq,
    {
        let encoded = input.encode_to_vec();
        let decoded = T::decode_from_slice(&encoded).unwrap();
        assert_eq!(input, decoded);
    }

    #[test]
    fn primitives_roundtrip() {
        roundtrip(true);
        roundtrip(false);
        roundtrip(u8::MAX);
        roundtrip(u32::MAX);
        roundtrip(i64::MIN);
        roundtrip(f32::MAX);
        roundtrip(f64::MIN_POSITIVE);
        roundtrip("muninn".to_string());
        roundtrip(vec![1u32, 2, 3]);
        roundtrip(Option::<u32>::None);
        roundtrip(Some(42u32));
        roundtrip(Point { x: 1.5, y: -2.5 });
    }

    #[test]
    fn varint_boundaries() {
        let mut buf = Vec::new();
        encode_varint(127, &mut buf).unwrap();
        assert_eq!(buf.len(), 1);
        buf.clear();
        encode_varint(128, &mut buf).unwrap();
        assert_eq!(buf.len(), 2);
        buf.clear();
        encode_varint(u64::MAX, &mut buf).unwrap();
        assert_eq!(buf.len(), 10);
        assert_eq!(decode_varint(&mut buf.as_slice()).unwrap(), u64::MAX);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let encoded = 42u64.encode_to_vec();
        assert!(u64::decode_from_slice(&encoded[..4]).is_err());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        encode_varint(1 << 32, &mut buf).unwrap();
        assert!(matches!(
            Vec::<u8>::decode_from_slice(&buf),
            Err(Error::Length(_))
        ));
    }
}
