use std::collections::HashMap;

use bytes::Bytes;
use kestrel_cql::frame::frame_errors::{FrameError, RequestDeserializationError};
use kestrel_cql::frame::protocol_version::ProtocolVersion;
use kestrel_cql::frame::request::Request;
use kestrel_cql::frame::response::error::DbError;
use kestrel_cql::frame::response::event::Event;
use kestrel_cql::frame::response::result::{self, Prepared, Rows};
use kestrel_cql::frame::response::{Error, Response, Supported};
use kestrel_cql::frame::{self, flag, Compression, FrameParams};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub use kestrel_cql::frame::request::RequestOpcode;
pub use kestrel_cql::frame::response::ResponseOpcode;

/// Stream id the server uses for pushed EVENT frames.
pub(crate) const EVENT_STREAM_ID: i16 = -1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFrame {
    pub params: FrameParams,
    pub opcode: RequestOpcode,
    pub body: Bytes,
}

impl RequestFrame {
    pub fn deserialize(&self) -> Result<Option<Request>, RequestDeserializationError> {
        Request::deserialize(self.params.version, self.opcode, &mut &self.body[..])
    }

    /// The CQL text of a QUERY frame.
    pub fn query_contents(&self) -> Option<String> {
        match self.deserialize() {
            Ok(Some(Request::Query(query))) => Some(query.contents),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseFrame {
    pub params: FrameParams,
    pub opcode: ResponseOpcode,
    pub body: Bytes,
}

impl ResponseFrame {
    pub fn forged(
        request_params: FrameParams,
        response: &Response,
    ) -> Result<Self, std::num::TryFromIntError> {
        let mut body = Vec::new();
        response.serialize(request_params.version, &mut body)?;
        Ok(ResponseFrame {
            params: response_params(request_params),
            opcode: response.opcode(),
            body: body.into(),
        })
    }

    /// Creates a response frame that signifies the given DbError type.
    /// Useful for testing server-side error handling in drivers.
    pub fn forged_error(
        request_params: FrameParams,
        error: DbError,
        msg: Option<&str>,
    ) -> Result<Self, std::num::TryFromIntError> {
        let msg = msg.unwrap_or("Mock-triggered error.");
        Self::forged(request_params, &Response::Error(Error::new(error, msg)))
    }

    /// Creates a Supported response frame with given supported options.
    pub fn forged_supported(
        request_params: FrameParams,
        options: &HashMap<String, Vec<String>>,
    ) -> Result<Self, std::num::TryFromIntError> {
        Self::forged(
            request_params,
            &Response::Supported(Supported {
                options: options.clone(),
            }),
        )
    }

    pub fn forged_ready(request_params: FrameParams) -> Self {
        ResponseFrame {
            params: response_params(request_params),
            opcode: ResponseOpcode::Ready,
            body: Bytes::new(),
        }
    }

    pub fn forged_void(request_params: FrameParams) -> Self {
        let mut body = Vec::new();
        kestrel_cql::frame::types::write_int(0x0001, &mut body);
        ResponseFrame {
            params: response_params(request_params),
            opcode: ResponseOpcode::Result,
            body: body.into(),
        }
    }

    pub fn forged_rows(
        request_params: FrameParams,
        rows: Rows,
    ) -> Result<Self, std::num::TryFromIntError> {
        Self::forged(request_params, &Response::Result(result::Result::Rows(rows)))
    }

    pub fn forged_prepared(
        request_params: FrameParams,
        prepared: Prepared,
    ) -> Result<Self, std::num::TryFromIntError> {
        Self::forged(
            request_params,
            &Response::Result(result::Result::Prepared(prepared)),
        )
    }

    /// An unsolicited EVENT frame for a connection speaking `version`.
    pub fn forged_event(
        version: ProtocolVersion,
        event: &Event,
    ) -> Result<Self, std::num::TryFromIntError> {
        let params = FrameParams {
            version,
            flags: 0,
            stream: EVENT_STREAM_ID,
        };
        Self::forged(params, &Response::Event(event.clone()))
    }

    pub(crate) async fn write(
        &self,
        writer: &mut (impl AsyncWrite + Unpin),
    ) -> Result<(), tokio::io::Error> {
        let mut data = Vec::with_capacity(frame::HEADER_SIZE + self.body.len());
        self.params
            .write_header(true, self.opcode as u8, self.body.len(), &mut data);
        data.extend_from_slice(&self.body);
        writer.write_all(&data).await
    }
}

/// Header for a response to a request: same version and stream, no flags.
fn response_params(request_params: FrameParams) -> FrameParams {
    FrameParams {
        flags: 0,
        ..request_params
    }
}

/// Reads one request, undoing body compression if the connection negotiated it.
pub(crate) async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
    compression: Option<Compression>,
) -> Result<RequestFrame, FrameError> {
    let (mut params, opcode, mut body) = frame::read_request_frame(reader).await?;
    if params.flags & flag::COMPRESSION != 0 {
        let compression = compression.ok_or(FrameError::NoCompressionNegotiated)?;
        body = frame::decompress(&body, compression)?.into();
        params.flags &= !flag::COMPRESSION;
    }
    Ok(RequestFrame {
        params,
        opcode,
        body,
    })
}
