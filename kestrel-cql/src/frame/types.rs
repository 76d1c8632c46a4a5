//! CQL binary protocol in-wire types.

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::net::{IpAddr, SocketAddr};
use std::str;
use thiserror::Error;
use uuid::Uuid;

/// Consistency level of a request, passed through to the coordinator.
///
/// The default, `LocalOne`, is the library-wide constant used when neither
/// the statement nor any execution profile sets a consistency.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    #[default]
    LocalOne = 0x000A,

    // Serial levels are accepted as regular consistency in reads that go through Paxos.
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl TryFrom<u16> for Consistency {
    type Error = TryFromPrimitiveError<u16>;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Consistency::Any),
            0x0001 => Ok(Consistency::One),
            0x0002 => Ok(Consistency::Two),
            0x0003 => Ok(Consistency::Three),
            0x0004 => Ok(Consistency::Quorum),
            0x0005 => Ok(Consistency::All),
            0x0006 => Ok(Consistency::LocalQuorum),
            0x0007 => Ok(Consistency::EachQuorum),
            0x000A => Ok(Consistency::LocalOne),
            0x0008 => Ok(Consistency::Serial),
            0x0009 => Ok(Consistency::LocalSerial),
            _ => Err(TryFromPrimitiveError {
                enum_name: "Consistency",
                primitive: value,
            }),
        }
    }
}

impl Consistency {
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }

    /// Levels that only ever involve replicas of the coordinator's datacenter.
    pub fn is_dc_local(&self) -> bool {
        matches!(
            self,
            Consistency::LocalOne | Consistency::LocalQuorum | Consistency::LocalSerial
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

#[derive(Debug, Error)]
#[error("Expected Consistency Serial or LocalSerial, got: {0}")]
pub struct NonSerialConsistencyError(pub Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
            other => Err(NonSerialConsistencyError(other)),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

fn read_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], LowLevelDeserializationError> {
    let mut array = [0u8; N];
    array.copy_from_slice(read_raw_bytes(N, buf)?);
    Ok(array)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, std::io::Error> {
    buf.read_i32::<BigEndian>()
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    Ok(usize::try_from(read_int(buf)?)?)
}

pub(crate) fn write_int_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_int(i32::try_from(v)?, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, std::io::Error> {
    buf.read_i64::<BigEndian>()
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, std::io::Error> {
    buf.read_u16::<BigEndian>()
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

// Element counts of `[string list]` and the maps share the `[short]` encoding.
fn read_count(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    Ok(read_short(buf)?.into())
}

fn write_count(count: usize, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short(u16::try_from(count)?, buf);
    Ok(())
}

/// Reads `[bytes]`, mapping a negative length to `None`.
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    match usize::try_from(read_int(buf)?) {
        Ok(len) => Ok(Some(read_raw_bytes(len, buf)?)),
        Err(_) => Ok(None),
    }
}

pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    match v {
        Some(bytes) => write_bytes(bytes.as_ref(), buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short(buf)?;
    read_raw_bytes(len.into(), buf)
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short(u16::try_from(v.len())?, buf);
    buf.put_slice(v);
    Ok(())
}

/// Reads `[string]`, a `[short bytes]` holding UTF-8.
pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    Ok(str::from_utf8(read_short_bytes(buf)?)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_bytes(v.as_bytes(), buf)
}

/// Reads `[long string]`, a `[bytes]` holding UTF-8.
pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    Ok(str::from_utf8(read_bytes(buf)?)?)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_bytes(v.as_bytes(), buf)
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    let count = read_count(buf)?;
    (0..count)
        .map(|_| read_string(buf).map(str::to_owned))
        .collect()
}

pub fn write_string_list(
    v: &[impl AsRef<str>],
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_count(v.len(), buf)?;
    v.iter().try_for_each(|item| write_string(item.as_ref(), buf))
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let count = read_count(buf)?;
    (0..count)
        .map(|_| -> Result<_, LowLevelDeserializationError> {
            Ok((read_string(buf)?.to_owned(), read_string(buf)?.to_owned()))
        })
        .collect()
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_count(v.len(), buf)?;
    v.iter().try_for_each(|(key, val)| {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)
    })
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let count = read_count(buf)?;
    (0..count)
        .map(|_| -> Result<_, LowLevelDeserializationError> {
            Ok((read_string(buf)?.to_owned(), read_string_list(buf)?))
        })
        .collect()
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_count(v.len(), buf)?;
    v.iter().try_for_each(|(key, val)| {
        write_string(key, buf)?;
        write_string_list(val.as_slice(), buf)
    })
}

/// Reads the `[bytes map]` of a custom payload.
pub fn read_bytes_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, Bytes>, LowLevelDeserializationError> {
    let count = read_count(buf)?;
    (0..count)
        .map(|_| -> Result<_, LowLevelDeserializationError> {
            let key = read_string(buf)?.to_owned();
            Ok((key, Bytes::copy_from_slice(read_bytes(buf)?)))
        })
        .collect()
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    Ok(Uuid::from_bytes(read_array(buf)?))
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    let raw = read_short(buf)?;
    Consistency::try_from(raw).map_err(LowLevelDeserializationError::UnknownConsistency)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

/// Reads `[inet]`: one length byte, the address octets and an `[int]` port.
pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let ip = match buf.read_u8()? {
        4 => IpAddr::from(read_array::<4>(buf)?),
        16 => IpAddr::from(read_array::<16>(buf)?),
        len => return Err(LowLevelDeserializationError::InvalidInetLength(len)),
    };
    let port = read_int(buf)?;
    Ok(SocketAddr::new(ip, port as u16))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }

    write_int(addr.port() as i32, buf)
}

/// Advances a `Bytes` handle by what a parser consumed from its borrowed view.
pub(crate) fn advance_consumed(body: &mut Bytes, remaining_after_parse: usize) {
    let consumed = body.len() - remaining_after_parse;
    body.advance(consumed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn type_string_multimap() {
        let mut val = HashMap::new();
        val.insert(String::from(""), vec![String::from("")]);
        val.insert(
            String::from("PROTOCOL_VERSIONS"),
            vec![String::from("3/v3"), String::from("4/v4")],
        );
        val.insert(String::from("empty"), vec![]);
        let mut buf = Vec::new();
        write_string_multimap(&val, &mut buf).unwrap();
        assert_eq!(read_string_multimap(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn strings_share_the_bytes_encodings() {
        let mut buf = Vec::new();
        write_string("ks", &mut buf).unwrap();
        write_long_string("SELECT 1", &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 2, b'k', b's']);
        assert_eq!(&buf[4..8], &8_i32.to_be_bytes());

        let mut slice = &buf[..];
        assert_eq!(read_short_bytes(&mut slice).unwrap(), b"ks");
        assert_eq!(read_long_string(&mut slice).unwrap(), "SELECT 1");
        assert!(slice.is_empty());

        let invalid_utf8 = [0u8, 1, 0xff];
        assert!(read_string(&mut &invalid_utf8[..]).is_err());
    }

    #[test]
    fn type_string_map_and_list() {
        let map = HashMap::from([("CQL_VERSION", "3.0.0"), ("COMPRESSION", "lz4")]);
        let mut buf = Vec::new();
        write_string_map(&map, &mut buf).unwrap();
        write_string_list(&["a", "b"], &mut buf).unwrap();

        let mut slice = &buf[..];
        let read = read_string_map(&mut slice).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read["COMPRESSION"], "lz4");
        assert_eq!(read_string_list(&mut slice).unwrap(), vec!["a", "b"]);
        assert!(slice.is_empty());

        // A count promising more entries than the buffer holds.
        let short = [0u8, 3, 0, 1, b'k'];
        assert!(read_string_list(&mut &short[..]).is_err());
    }

    #[test]
    fn type_consistency_rejects_unknown_code() {
        let mut buf = Vec::new();
        write_consistency(Consistency::Quorum, &mut buf);
        assert_eq!(read_consistency(&mut &*buf).unwrap(), Consistency::Quorum);

        buf.clear();
        buf.put_i16(0x1234);
        let err = read_consistency(&mut &*buf).unwrap_err();
        assert!(err.to_string().contains(&format!("{}", 0x1234)));
    }

    #[test]
    fn type_inet_both_families() {
        let addrs = [
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 19042),
        ];
        for addr in addrs {
            let mut buf = Vec::new();
            write_inet(addr, &mut buf);
            assert_eq!(read_inet(&mut &*buf).unwrap(), addr);
        }

        let truncated = [4u8, 127, 0];
        assert!(read_inet(&mut &truncated[..]).is_err());
    }

    #[test]
    fn read_bytes_opt_maps_negative_length_to_none() {
        let mut buf = Vec::new();
        write_bytes_opt(None::<&[u8]>, &mut buf).unwrap();
        write_bytes_opt(Some(&b"abc"[..]), &mut buf).unwrap();
        let mut slice = &buf[..];
        assert_eq!(read_bytes_opt(&mut slice).unwrap(), None);
        assert_eq!(read_bytes_opt(&mut slice).unwrap(), Some(&b"abc"[..]));
        assert!(slice.is_empty());
    }

    #[test]
    fn consistency_locality() {
        assert!(Consistency::LocalOne.is_dc_local());
        assert!(Consistency::LocalQuorum.is_dc_local());
        assert!(!Consistency::Quorum.is_dc_local());
        assert_eq!(Consistency::default(), Consistency::LocalOne);
    }
}
