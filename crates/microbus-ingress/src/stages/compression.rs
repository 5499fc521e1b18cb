//! Response compression.
//!
//! Textual responses of at least [`MIN_COMPRESS_SIZE`] bytes that are not
//! already encoded are compressed with the first of `br`, `deflate` and
//! `gzip` the client accepts.

use std::io::Write;

use bytes::Bytes;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use http::{header, HeaderValue};

use crate::middleware::{BoxFuture, IngressContext, IngressRequest, Middleware, Next, Response};

/// Responses smaller than this are sent as is.
pub const MIN_COMPRESS_SIZE: usize = 4 * 1024;

const BROTLI_QUALITY: i32 = 6;

/// Content encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Brotli (RFC 7932).
    Brotli,
    /// Deflate (RFC 1951).
    Deflate,
    /// Gzip (RFC 1952).
    Gzip,
}

impl Encoding {
    /// Encodings in order of preference.
    pub const PREFERENCE: [Self; 3] = [Self::Brotli, Self::Deflate, Self::Gzip];

    /// The `Content-Encoding` token.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Brotli => "br",
            Self::Deflate => "deflate",
            Self::Gzip => "gzip",
        }
    }

    /// Compresses `data`.
    pub fn encode(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Brotli => {
                let mut output = Vec::new();
                let params = brotli::enc::BrotliEncoderParams {
                    quality: BROTLI_QUALITY,
                    ..Default::default()
                };
                brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut output, &params)?;
                Ok(output)
            }
            Self::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }
}

/// Picks the preferred encoding among those the client accepts.
///
/// Quality values only matter in that `q=0` refuses an encoding; the server
/// order decides between acceptable ones.
#[must_use]
pub fn negotiate(accept_encoding: &str) -> Option<Encoding> {
    let mut accepted = Vec::new();
    let mut wildcard = false;
    for part in accept_encoding.split(',') {
        let mut pieces = part.split(';');
        let token = pieces.next().unwrap_or_default().trim().to_ascii_lowercase();
        let refused = pieces
            .filter_map(|p| p.trim().strip_prefix("q="))
            .any(|q| q.trim().parse::<f32>().is_ok_and(|q| q <= 0.0));
        if refused {
            continue;
        }
        if token == "*" {
            wildcard = true;
        } else {
            accepted.push(token);
        }
    }
    Encoding::PREFERENCE
        .into_iter()
        .find(|e| wildcard || accepted.iter().any(|a| a == e.as_str()))
}

/// Returns `true` for content types worth compressing.
#[must_use]
pub fn is_textual(content_type: &str) -> bool {
    let base = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    base.starts_with("text/")
        || base.ends_with("+json")
        || base.ends_with("+xml")
        || matches!(
            base.as_str(),
            "application/json"
                | "application/javascript"
                | "application/xml"
                | "application/x-www-form-urlencoded"
                | "application/graphql"
                | "image/svg+xml"
        )
}

/// The compression stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compress;

impl Compress {
    fn compress(encoding: Encoding, response: Response) -> Response {
        let (mut parts, body) = response.into_parts();
        let encoded = match encoding.encode(&body) {
            Ok(encoded) if encoded.len() < body.len() => encoded,
            Ok(_) => return Response::from_parts(parts, body),
            Err(e) => {
                tracing::warn!(encoding = encoding.as_str(), error = %e, "Compression failed");
                return Response::from_parts(parts, body);
            }
        };
        parts
            .headers
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
        // Recomputed from the encoded body when sent
        parts.headers.remove(header::CONTENT_LENGTH);
        Response::from_parts(parts, Bytes::from(encoded))
    }
}

impl Middleware for Compress {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut IngressContext,
        request: IngressRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let encoding = request
                .headers()
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .and_then(negotiate);

            let mut response = next.run(ctx, request).await;
            response
                .headers_mut()
                .append(header::VARY, HeaderValue::from_static("Accept-Encoding"));

            let Some(encoding) = encoding else {
                return response;
            };
            let eligible = response.body().len() >= MIN_COMPRESS_SIZE
                && !response.headers().contains_key(header::CONTENT_ENCODING)
                && response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(is_textual);
            if !eligible {
                return response;
            }
            Self::compress(encoding, response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::tests::{context, request};
    use crate::middleware::Pipeline;
    use flate2::read::GzDecoder;
    use http::StatusCode;
    use microbus_core::ResponseExt;
    use std::io::Read;

    fn text_of(len: usize) -> String {
        "Lorem ipsum dolor sit amet. ".chars().cycle().take(len).collect()
    }

    async fn run(accept: &str, content_type: &'static str, body: String) -> Response {
        let pipeline = Pipeline::builder().stage(Compress).build();
        let req = request("GET", "/x", &[("accept-encoding", accept)]);
        pipeline
            .process(context(), req, move |_ctx, _req| {
                Box::pin(async move { Response::with_body(StatusCode::OK, content_type, body) })
            })
            .await
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(negotiate("gzip"), Some(Encoding::Gzip));
        assert_eq!(negotiate("gzip, deflate"), Some(Encoding::Deflate));
        assert_eq!(negotiate("gzip, deflate, br"), Some(Encoding::Brotli));
        assert_eq!(negotiate("br;q=0, gzip;q=0.1"), Some(Encoding::Gzip));
        assert_eq!(negotiate("*"), Some(Encoding::Brotli));
        assert_eq!(negotiate("identity"), None);
        assert_eq!(negotiate(""), None);
    }

    #[test]
    fn test_is_textual() {
        assert!(is_textual("text/plain; charset=utf-8"));
        assert!(is_textual("application/json"));
        assert!(is_textual("application/ld+json"));
        assert!(!is_textual("image/png"));
        assert!(!is_textual("application/octet-stream"));
    }

    #[tokio::test]
    async fn test_gzip_large_text() {
        let body = text_of(8 * 1024);
        let res = run("gzip", "text/plain", body.clone()).await;
        assert_eq!(res.headers()[header::CONTENT_ENCODING], "gzip");
        assert!(res.body().len() < 8 * 1024);

        let mut decoded = String::new();
        GzDecoder::new(res.body().as_ref()).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn test_brotli_preferred() {
        let res = run("gzip, br", "application/json", text_of(8 * 1024)).await;
        assert_eq!(res.headers()[header::CONTENT_ENCODING], "br");
    }

    #[tokio::test]
    async fn test_small_or_binary_is_not_compressed() {
        let res = run("gzip", "text/plain", text_of(1024)).await;
        assert!(!res.headers().contains_key(header::CONTENT_ENCODING));
        assert_eq!(res.body().len(), 1024);

        let res = run("gzip", "image/png", text_of(8 * 1024)).await;
        assert!(!res.headers().contains_key(header::CONTENT_ENCODING));
    }

    #[tokio::test]
    async fn test_no_accept_encoding() {
        let pipeline = Pipeline::builder().stage(Compress).build();
        let body = text_of(8 * 1024);
        let res = pipeline
            .process(context(), request("GET", "/x", &[]), move |_ctx, _req| {
                Box::pin(async move { Response::with_body(StatusCode::OK, "text/plain", body) })
            })
            .await;
        assert!(!res.headers().contains_key(header::CONTENT_ENCODING));
        assert_eq!(res.headers()[header::VARY], "Accept-Encoding");
    }
}
