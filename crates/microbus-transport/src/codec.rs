//! Binary wire format of bus messages.
//!
//! ```text
//! request:  0x01 | u16 method_len | method | u32 uri_len | uri | headers | body
//! response: 0x02 | u16 status | headers | body
//! headers:  u16 count | (u16 name_len | name | u32 value_len | value)*
//! ```
//!
//! All integers are big-endian. The body runs to the end of the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use microbus_core::{Request, Response};

use crate::error::CodecError;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

/// A decoded bus message.
#[derive(Debug)]
pub enum Message {
    /// A request.
    Request(Request),
    /// A response, acknowledgement or error.
    Response(Response),
}

impl Message {
    /// Headers of the message.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        match self {
            Self::Request(r) => r.headers(),
            Self::Response(r) => r.headers(),
        }
    }
}

/// Encodes a request.
pub fn encode_request(req: &Request) -> Result<Bytes, CodecError> {
    let method = req.method().as_str();
    let uri = req.uri().to_string();
    let mut buf = BytesMut::with_capacity(1 + 6 + method.len() + uri.len() + req.body().len() + 256);
    buf.put_u8(KIND_REQUEST);
    put_u16_str(&mut buf, method.as_bytes())?;
    put_u32_bytes(&mut buf, uri.as_bytes())?;
    encode_headers(&mut buf, req.headers())?;
    buf.extend_from_slice(req.body());
    Ok(buf.freeze())
}

/// Encodes a response.
pub fn encode_response(res: &Response) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(3 + res.body().len() + 256);
    buf.put_u8(KIND_RESPONSE);
    buf.put_u16(res.status().as_u16());
    encode_headers(&mut buf, res.headers())?;
    buf.extend_from_slice(res.body());
    Ok(buf.freeze())
}

/// Decodes a payload. The body is a zero-copy slice of the input.
pub fn decode(mut input: Bytes) -> Result<Message, CodecError> {
    if !input.has_remaining() {
        return Err(CodecError::Incomplete);
    }
    match input.get_u8() {
        KIND_REQUEST => {
            let method = take_u16_prefixed(&mut input)?;
            let method =
                Method::from_bytes(&method).map_err(|_| CodecError::Invalid("method"))?;
            let uri = take_u32_prefixed(&mut input)?;
            let uri = Uri::try_from(uri.as_ref()).map_err(|_| CodecError::Invalid("uri"))?;
            let headers = decode_headers(&mut input)?;
            let mut req = Request::new(input);
            *req.method_mut() = method;
            *req.uri_mut() = uri;
            *req.headers_mut() = headers;
            Ok(Message::Request(req))
        }
        KIND_RESPONSE => {
            if input.remaining() < 2 {
                return Err(CodecError::Incomplete);
            }
            let status =
                StatusCode::from_u16(input.get_u16()).map_err(|_| CodecError::Invalid("status"))?;
            let headers = decode_headers(&mut input)?;
            let mut res = Response::new(input);
            *res.status_mut() = status;
            *res.headers_mut() = headers;
            Ok(Message::Response(res))
        }
        other => Err(CodecError::UnknownKind(other)),
    }
}

fn put_u16_str(buf: &mut BytesMut, value: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::FieldTooLarge)?;
    buf.put_u16(len);
    buf.extend_from_slice(value);
    Ok(())
}

fn put_u32_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(value.len()).map_err(|_| CodecError::FieldTooLarge)?;
    buf.put_u32(len);
    buf.extend_from_slice(value);
    Ok(())
}

fn encode_headers(buf: &mut BytesMut, headers: &HeaderMap) -> Result<(), CodecError> {
    let count = u16::try_from(headers.len()).map_err(|_| CodecError::FieldTooLarge)?;
    buf.put_u16(count);
    for (name, value) in headers {
        put_u16_str(buf, name.as_str().as_bytes())?;
        put_u32_bytes(buf, value.as_bytes())?;
    }
    Ok(())
}

fn take_u16_prefixed(input: &mut Bytes) -> Result<Bytes, CodecError> {
    if input.remaining() < 2 {
        return Err(CodecError::Incomplete);
    }
    let len = input.get_u16() as usize;
    take(input, len)
}

fn take_u32_prefixed(input: &mut Bytes) -> Result<Bytes, CodecError> {
    if input.remaining() < 4 {
        return Err(CodecError::Incomplete);
    }
    let len = input.get_u32() as usize;
    take(input, len)
}

fn take(input: &mut Bytes, len: usize) -> Result<Bytes, CodecError> {
    if input.remaining() < len {
        return Err(CodecError::Incomplete);
    }
    Ok(input.split_to(len))
}

fn decode_headers(input: &mut Bytes) -> Result<HeaderMap, CodecError> {
    if input.remaining() < 2 {
        return Err(CodecError::Incomplete);
    }
    let count = input.get_u16() as usize;
    let mut headers = HeaderMap::with_capacity(count);
    for _ in 0..count {
        let name = take_u16_prefixed(input)?;
        let value = take_u32_prefixed(input)?;
        let name = HeaderName::from_bytes(&name).map_err(|_| CodecError::Invalid("header name"))?;
        let value =
            HeaderValue::from_maybe_shared(value).map_err(|_| CodecError::Invalid("header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_preserves_multi_valued_headers() {
        let mut req = Request::new(Bytes::from_static(b"payload"));
        *req.method_mut() = Method::PATCH;
        *req.uri_mut() = Uri::from_static("https://hello.example:443/echo?x=1");
        req.headers_mut()
            .append("accept", HeaderValue::from_static("text/html"));
        req.headers_mut()
            .append("accept", HeaderValue::from_static("application/json"));

        let Message::Request(decoded) = decode(encode_request(&req).unwrap()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(decoded.method(), Method::PATCH);
        assert_eq!(decoded.uri(), "https://hello.example:443/echo?x=1");
        assert_eq!(decoded.headers().get_all("accept").iter().count(), 2);
        assert_eq!(decoded.body().as_ref(), b"payload");
    }

    #[test]
    fn test_response_with_empty_body() {
        let mut res = Response::new(Bytes::new());
        *res.status_mut() = StatusCode::NO_CONTENT;
        let Message::Response(decoded) = decode(encode_response(&res).unwrap()).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(decoded.status(), StatusCode::NO_CONTENT);
        assert!(decoded.body().is_empty());
    }

    #[test]
    fn test_truncated_input() {
        let res = Response::new(Bytes::new());
        let encoded = encode_response(&res).unwrap();
        assert_eq!(
            decode(encoded.slice(..2)).unwrap_err(),
            CodecError::Incomplete
        );
        assert_eq!(decode(Bytes::new()).unwrap_err(), CodecError::Incomplete);
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(
            decode(Bytes::from_static(&[9, 0, 0])).unwrap_err(),
            CodecError::UnknownKind(9)
        );
    }
}
