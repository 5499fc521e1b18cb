//! Splitting and reassembly of large messages.
//!
//! A message whose body exceeds the fragment size is split into `N` messages
//! marked `Fragment: i/N`. The first fragment keeps every header of the
//! original; the others carry only `Msg-Id`, `From-Id` and `Fragment`.
//! Fragments may arrive in any order. The [`Assembler`] places them by index
//! and yields the integrated message when the last one arrives.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use microbus_core::frame::headers;
use microbus_core::{Frame, FrameMut, Request, Response};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::FragmentError;

/// Default body size of a fragment.
pub const DEFAULT_FRAGMENT_SIZE: usize = 64 * 1024;

/// Default cap on the size of an integrated message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Default time to wait for the next fragment.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(8);

/// A message that can be split into fragments.
pub trait Fragmentable: Sized {
    /// Headers of the message.
    fn headers(&self) -> &HeaderMap;
    /// Mutable headers of the message.
    fn headers_mut(&mut self) -> &mut HeaderMap;
    /// Body of the message.
    fn body(&self) -> &Bytes;
    /// Replaces the body.
    fn set_body(&mut self, body: Bytes);
    /// A message of the same shape with no headers and the given body.
    fn continuation(&self, body: Bytes) -> Self;
}

impl Fragmentable for Request {
    fn headers(&self) -> &HeaderMap {
        self.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.headers_mut()
    }

    fn body(&self) -> &Bytes {
        self.body()
    }

    fn set_body(&mut self, body: Bytes) {
        *self.body_mut() = body;
    }

    fn continuation(&self, body: Bytes) -> Self {
        let mut req = Request::new(body);
        *req.method_mut() = self.method().clone();
        *req.uri_mut() = self.uri().clone();
        req
    }
}

impl Fragmentable for Response {
    fn headers(&self) -> &HeaderMap {
        self.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.headers_mut()
    }

    fn body(&self) -> &Bytes {
        self.body()
    }

    fn set_body(&mut self, body: Bytes) {
        *self.body_mut() = body;
    }

    fn continuation(&self, body: Bytes) -> Self {
        let mut res = Response::new(body);
        *res.status_mut() = self.status();
        res
    }
}

/// Splits a message into fragments of at most `size` body bytes.
///
/// Always returns at least one message. A message that fits is returned
/// unchanged.
pub fn fragment<M: Fragmentable>(mut msg: M, size: usize) -> Vec<M> {
    let size = size.max(1);
    let body = msg.body().clone();
    if body.len() <= size {
        return vec![msg];
    }

    let count = body.len().div_ceil(size);
    let count_u32 = u32::try_from(count).unwrap_or(u32::MAX);
    let (msg_id, from_id) = {
        let frame = Frame::of(msg.headers());
        (frame.msg_id().to_string(), frame.from_id().to_string())
    };

    let mut fragments = Vec::with_capacity(count);
    for i in 1..count {
        let chunk = body.slice(i * size..((i + 1) * size).min(body.len()));
        let index = u32::try_from(i + 1).unwrap_or(u32::MAX);
        let mut part = msg.continuation(chunk);
        FrameMut::of(part.headers_mut())
            .set_msg_id(&msg_id)
            .set_from_id(&from_id)
            .set_fragment(index, count_u32);
        fragments.push(part);
    }

    msg.set_body(body.slice(..size));
    FrameMut::of(msg.headers_mut()).set_fragment(1, count_u32);
    fragments.insert(0, msg);
    fragments
}

/// Reassembles the fragments of one message.
///
/// Fragments are buffered as they arrive, so memory is bounded by the bytes
/// received rather than by the count a peer claims.
#[derive(Debug)]
pub struct Assembler<M> {
    first: Option<M>,
    parts: BTreeMap<u32, Bytes>,
    count: u32,
    size: usize,
    max_size: usize,
    last_activity: Instant,
}

impl<M: Fragmentable> Assembler<M> {
    /// Creates an assembler for a message of `count` fragments.
    #[must_use]
    pub fn new(count: u32, max_size: usize) -> Self {
        Self {
            first: None,
            parts: BTreeMap::new(),
            count,
            size: 0,
            max_size,
            last_activity: Instant::now(),
        }
    }

    /// Adds a fragment. Returns the integrated message once all fragments
    /// are present. Duplicate fragments are ignored.
    pub fn add(&mut self, msg: M) -> Result<Option<M>, FragmentError> {
        let (index, count) = Frame::of(msg.headers()).fragment();
        if count != self.count {
            return Err(FragmentError::Mismatch {
                index,
                count,
                expected: self.count,
            });
        }
        self.last_activity = Instant::now();

        if self.parts.contains_key(&index) {
            return Ok(None);
        }
        self.size += msg.body().len();
        if self.size > self.max_size {
            return Err(FragmentError::TooLarge {
                size: self.size,
                max: self.max_size,
            });
        }
        self.parts.insert(index, msg.body().clone());
        if index == 1 {
            self.first = Some(msg);
        }

        if self.parts.len() < self.count as usize {
            return Ok(None);
        }
        let Some(mut first) = self.first.take() else {
            return Ok(None);
        };
        let mut body = BytesMut::with_capacity(self.size);
        for part in std::mem::take(&mut self.parts).into_values() {
            body.extend_from_slice(&part);
        }
        first.set_body(body.freeze());
        first.headers_mut().remove(headers::FRAGMENT);
        Ok(Some(first))
    }

    /// When the last fragment arrived.
    #[must_use]
    pub const fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

/// A synchronized map of assemblers keyed by message.
#[derive(Debug)]
pub struct DefragMap<M> {
    assemblers: Mutex<HashMap<String, Assembler<M>>>,
    max_size: usize,
}

impl<M: Fragmentable> DefragMap<M> {
    /// Creates an empty map.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            assemblers: Mutex::new(HashMap::new()),
            max_size,
        }
    }

    /// Integrates a fragment of the message identified by `key`.
    ///
    /// Messages of a single fragment pass through without buffering. A
    /// failed message is discarded. Every fragment carries at least one byte,
    /// so a count above the size cap is rejected before anything is buffered.
    pub fn integrate(&self, key: &str, msg: M) -> Result<Option<M>, FragmentError> {
        let (_, count) = Frame::of(msg.headers()).fragment();
        if count == 1 {
            return Ok(Some(msg));
        }
        if count as usize > self.max_size {
            self.assemblers.lock().remove(key);
            return Err(FragmentError::TooLarge {
                size: count as usize,
                max: self.max_size,
            });
        }
        let mut assemblers = self.assemblers.lock();
        let assembler = assemblers
            .entry(key.to_string())
            .or_insert_with(|| Assembler::new(count, self.max_size));
        match assembler.add(msg) {
            Ok(None) => Ok(None),
            result => {
                assemblers.remove(key);
                result
            }
        }
    }

    /// Removes messages idle for longer than `timeout`, returning their keys.
    pub fn sweep(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.assemblers.lock().retain(|key, assembler| {
            let keep = now.duration_since(assembler.last_activity()) < timeout;
            if !keep {
                expired.push(key.clone());
            }
            keep
        });
        expired
    }

    /// When the idlest message will have been idle for `timeout`.
    #[must_use]
    pub fn next_expiry(&self, timeout: Duration) -> Option<Instant> {
        self.assemblers
            .lock()
            .values()
            .map(|assembler| assembler.last_activity() + timeout)
            .min()
    }

    /// Number of partially received messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assemblers.lock().len()
    }

    /// Returns `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use microbus_core::ResponseExt;
    use proptest::prelude::*;

    fn response(body: &[u8]) -> Response {
        let mut res = Response::with_body(
            StatusCode::CREATED,
            "application/octet-stream",
            Bytes::copy_from_slice(body),
        );
        FrameMut::of(res.headers_mut())
            .set_msg_id("m1")
            .set_from_id("i1")
            .set_from_host("alpha");
        res
    }

    #[test]
    fn test_small_message_is_single_fragment() {
        let parts = fragment(response(b"small"), 1024);
        assert_eq!(parts.len(), 1);
        assert_eq!(Frame::of(parts[0].headers()).fragment(), (1, 1));
    }

    #[test]
    fn test_headers_of_continuations() {
        let parts = fragment(response(&[7; 25]), 10);
        assert_eq!(parts.len(), 3);
        assert_eq!(Frame::of(parts[0].headers()).from_host(), "alpha");
        let second = Frame::of(parts[1].headers());
        assert_eq!(second.fragment(), (2, 3));
        assert_eq!(second.msg_id(), "m1");
        assert_eq!(second.from_id(), "i1");
        assert_eq!(second.from_host(), "");
        assert_eq!(parts[2].body().len(), 5);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut parts = fragment(response(b"abcdefghij"), 3);
        parts.reverse();
        let map = DefragMap::new(DEFAULT_MAX_MESSAGE_SIZE);
        let mut result = None;
        for part in parts {
            result = map.integrate("m1", part).unwrap();
        }
        let integrated = result.unwrap();
        assert_eq!(integrated.body().as_ref(), b"abcdefghij");
        assert_eq!(integrated.status(), StatusCode::CREATED);
        assert_eq!(Frame::of(integrated.headers()).fragment(), (1, 1));
        assert!(map.is_empty());
    }

    #[test]
    fn test_too_large() {
        let parts = fragment(response(&[0; 100]), 10);
        let map = DefragMap::new(25);
        let mut outcome = Ok(None);
        for part in parts {
            outcome = map.integrate("m1", part);
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome, Err(FragmentError::TooLarge { .. })));
        assert!(map.is_empty());
    }

    #[test]
    fn test_absurd_fragment_count_is_rejected() {
        let mut res = response(b"x");
        FrameMut::of(res.headers_mut()).set_fragment(1, u32::MAX);
        let map = DefragMap::new(DEFAULT_MAX_MESSAGE_SIZE);
        assert!(matches!(
            map.integrate("m1", res),
            Err(FragmentError::TooLarge { .. })
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn test_buffers_only_received_fragments() {
        let mut res = response(b"abc");
        FrameMut::of(res.headers_mut()).set_fragment(2, 1_000_000);
        let map = DefragMap::new(DEFAULT_MAX_MESSAGE_SIZE);
        assert!(map.integrate("m1", res).unwrap().is_none());
        assert_eq!(map.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_idle() {
        let mut parts = fragment(response(&[1; 30]), 10);
        let map = DefragMap::new(DEFAULT_MAX_MESSAGE_SIZE);
        assert!(map.integrate("m1", parts.remove(0)).unwrap().is_none());
        assert!(map.sweep(Duration::from_secs(8)).is_empty());
        assert_eq!(
            map.next_expiry(Duration::from_secs(8)),
            Some(Instant::now() + Duration::from_secs(8))
        );
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(map.sweep(Duration::from_secs(8)), vec!["m1".to_string()]);
        assert!(map.next_expiry(Duration::from_secs(8)).is_none());
    }

    proptest! {
        #[test]
        fn test_reassembly_is_lossless(
            body in proptest::collection::vec(any::<u8>(), 0..4096),
            size in 1usize..512,
            seed in any::<u64>(),
        ) {
            let mut req = Request::new(Bytes::from(body.clone()));
            FrameMut::of(req.headers_mut()).set_msg_id("m").set_from_host("h");
            let mut parts = fragment(req, size);
            let len = parts.len();
            parts.rotate_left((seed as usize) % len);

            let map = DefragMap::new(DEFAULT_MAX_MESSAGE_SIZE);
            let mut integrated = None;
            for part in parts {
                if let Some(done) = map.integrate("m", part).unwrap() {
                    integrated = Some(done);
                }
            }
            let integrated = integrated.unwrap();
            prop_assert_eq!(integrated.body().as_ref(), body.as_slice());
            prop_assert_eq!(Frame::of(integrated.headers()).from_host(), "h");
        }
    }
}
