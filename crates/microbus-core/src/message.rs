//! Request and response types.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use microbus_router::Params;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MicrobusError, MicrobusResult};
use crate::frame::Frame;

/// A request with a fully buffered body.
pub type Request = http::Request<Bytes>;

/// A response with a fully buffered body.
pub type Response = http::Response<Bytes>;

/// Path arguments captured by the subscription's path template.
///
/// Stored in the request extensions before the handler is invoked.
#[derive(Debug, Clone, Default)]
pub struct PathArgs(pub Params);

/// Convenience accessors on [`Request`].
pub trait RequestExt {
    /// Control frame of the request.
    fn frame(&self) -> Frame<'_>;

    /// A path argument captured by `{name}` or `{name+}`.
    fn path_arg(&self, name: &str) -> Option<&str>;

    /// Deserializes the JSON body.
    fn json<T: DeserializeOwned>(&self) -> MicrobusResult<T>;
}

impl RequestExt for Request {
    fn frame(&self) -> Frame<'_> {
        Frame::of(self.headers())
    }

    fn path_arg(&self, name: &str) -> Option<&str> {
        self.extensions().get::<PathArgs>()?.0.get(name)
    }

    fn json<T: DeserializeOwned>(&self) -> MicrobusResult<T> {
        serde_json::from_slice(self.body()).map_err(MicrobusError::from)
    }
}

/// Constructors for common [`Response`] shapes.
pub trait ResponseExt: Sized {
    /// A response with the given status, content type and body.
    fn with_body(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Self;

    /// A `200 OK` plain text response.
    fn text(body: impl Into<String>) -> Self {
        Self::with_body(
            StatusCode::OK,
            "text/plain; charset=utf-8",
            Bytes::from(body.into()),
        )
    }

    /// A `200 OK` JSON response.
    fn json<T: Serialize>(value: &T) -> MicrobusResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| MicrobusError::internal(format!("failed to serialize response: {e}")))?;
        Ok(Self::with_body(StatusCode::OK, "application/json", body))
    }

    /// An empty response with the given status.
    fn empty(status: StatusCode) -> Self;
}

impl ResponseExt for Response {
    fn with_body(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let mut res = Self::new(body.into());
        *res.status_mut() = status;
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        res
    }

    fn empty(status: StatusCode) -> Self {
        let mut res = Self::new(Bytes::new());
        *res.status_mut() = status;
        res
    }
}
