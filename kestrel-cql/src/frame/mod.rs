//! Frame-level codec: the 9-byte header, body extensions and compression.

pub mod frame_errors;
pub mod protocol_features;
pub mod protocol_version;
pub mod request;
pub mod response;
pub mod types;

use crate::frame::frame_errors::{CqlRequestSerializationError, FrameError};
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::collections::HashMap;
use std::fmt::Display;

use protocol_version::ProtocolVersion;
use request::{RequestOpcode, SerializableRequest};
use response::ResponseOpcode;

pub const HEADER_SIZE: usize = 9;

/// Largest body a frame may carry (256 MiB).
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

const RESPONSE_DIRECTION: u8 = 0x80;

pub mod flag {
    //! Frame flags

    pub const COMPRESSION: u8 = 0x01;
    pub const TRACING: u8 = 0x02;
    pub const CUSTOM_PAYLOAD: u8 = 0x04;
    pub const WARNING: u8 = 0x08;
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request encoded into a complete frame, waiting for its stream id.
///
/// The stream id is patched in by the connection right before writing,
/// after one has been allocated for it.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(compression) = compression {
            flags |= flag::COMPRESSION;
            let mut body = Vec::new();
            req.serialize(version, &mut body)?;
            compress_append(&body, compression, &mut data)
                .map_err(|_| CqlRequestSerializationError::Compression)?;
        } else {
            req.serialize(version, &mut data)?;
        }

        if tracing {
            flags |= flag::TRACING;
        }

        data[0] = version.raw();
        data[1] = flags;
        // Bytes 2..4 hold the stream id, set later.
        data[4] = R::OPCODE as u8;

        let req_size = (data.len() - HEADER_SIZE) as u32;
        data[5..9].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn opcode(&self) -> Result<RequestOpcode, TryFromPrimitiveError<u8>> {
        RequestOpcode::try_from(self.data[4])
    }
}

/// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: ProtocolVersion,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default(),
            flags: 0x00,
            stream: 0,
        }
    }
}

impl FrameParams {
    /// Encodes a header for a frame flowing in the given direction.
    pub fn write_header(
        &self,
        is_response: bool,
        opcode: u8,
        body_len: usize,
        buf: &mut impl BufMut,
    ) {
        let direction = if is_response { RESPONSE_DIRECTION } else { 0 };
        buf.put_u8(self.version.raw() | direction);
        buf.put_u8(self.flags);
        buf.put_i16(self.stream);
        buf.put_u8(opcode);
        buf.put_u32(body_len as u32);
    }
}

async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
    expect_response: bool,
) -> Result<(FrameParams, u8, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    match (version & RESPONSE_DIRECTION != 0, expect_response) {
        (false, true) => return Err(FrameError::FrameFromClient),
        (true, false) => return Err(FrameError::FrameFromServer),
        _ => {}
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version: ProtocolVersion::from_raw(version),
        flags,
        stream,
    };

    let opcode = buf.get_u8();

    let length = buf.get_u32() as usize;
    if length > MAX_BODY_SIZE {
        return Err(FrameError::TooLarge {
            length,
            max: MAX_BODY_SIZE,
        });
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// Reads one server-to-client frame.
///
/// The version in the returned header is not checked against anything;
/// the caller decides what a mismatch means.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let (params, opcode, body) = read_frame(reader, true).await?;
    Ok((params, ResponseOpcode::try_from(opcode)?, body))
}

/// Reads one client-to-server frame. Used by test servers.
pub async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, RequestOpcode, Bytes), FrameError> {
    let (params, opcode, body) = read_frame(reader, false).await?;
    Ok((params, RequestOpcode::try_from(opcode)?, body))
}

pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & flag::COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & flag::TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf).map_err(FrameError::BodyExtensionsParse)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & flag::WARNING != 0 {
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf).map_err(FrameError::BodyExtensionsParse)?;
        let remaining = buf.len();
        types::advance_consumed(&mut body, remaining);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & flag::CUSTOM_PAYLOAD != 0 {
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf).map_err(FrameError::BodyExtensionsParse)?;
        let remaining = buf.len();
        types::advance_consumed(&mut body, remaining);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

pub fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            lz4_flex::decompress(comp_body, uncomp_len).map_err(|_| FrameError::FrameDecompression)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::request::options::Options;

    #[tokio::test]
    async fn options_frame_header_layout() {
        let mut req = SerializedRequest::make(&Options, ProtocolVersion::V4, None, false).unwrap();
        req.set_stream(0x0102);
        assert_eq!(req.get_data(), &[0x04, 0x00, 0x01, 0x02, 0x05, 0, 0, 0, 0]);

        let mut reader = req.get_data();
        let (params, opcode, body) = read_request_frame(&mut reader).await.unwrap();
        assert_eq!(params.stream, 0x0102);
        assert_eq!(params.version, ProtocolVersion::V4);
        assert_eq!(opcode, RequestOpcode::Options);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn response_reader_rejects_request_frames() {
        let req = SerializedRequest::make(&Options, ProtocolVersion::V4, None, false).unwrap();
        let mut reader = req.get_data();
        let err = read_response_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::FrameFromClient));
    }

    #[tokio::test]
    async fn truncated_body_is_reported() {
        let mut raw = Vec::new();
        FrameParams::default().write_header(true, ResponseOpcode::Ready as u8, 10, &mut raw);
        raw.extend_from_slice(&[1, 2, 3]);
        let err = read_response_frame(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed(7, 10)));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_reading() {
        let mut raw = Vec::new();
        FrameParams::default().write_header(
            true,
            ResponseOpcode::Ready as u8,
            MAX_BODY_SIZE + 1,
            &mut raw,
        );
        let err = read_response_frame(&mut &raw[..]).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[test]
    fn compression_both_algorithms() {
        let uncomp_body = "SELECT * FROM ks.t WHERE pk = ?".repeat(20);
        for compression in [Compression::Lz4, Compression::Snappy] {
            let mut comp_body = Vec::new();
            compress_append(uncomp_body.as_bytes(), compression, &mut comp_body).unwrap();
            assert!(comp_body.len() < uncomp_body.len());
            let result = decompress(&comp_body[..], compression).unwrap();
            assert_eq!(uncomp_body.as_bytes(), result);
        }
    }

    #[test]
    fn warnings_extension_is_stripped() {
        let mut body = Vec::new();
        types::write_string_list(&["careful"], &mut body).unwrap();
        body.extend_from_slice(b"rest");
        let parsed = parse_response_body_extensions(flag::WARNING, None, body.into()).unwrap();
        assert_eq!(parsed.warnings, vec!["careful".to_string()]);
        assert_eq!(&parsed.body[..], b"rest");
        assert!(parsed.trace_id.is_none());
    }
}
