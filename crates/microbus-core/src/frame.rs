//! Control headers of bus messages.
//!
//! Every request and response on the bus carries a set of `Microbus-*`
//! headers. [`Frame`] reads them and [`FrameMut`] writes them. Both wrap an
//! existing [`HeaderMap`] without copying it, and both tolerate a missing map:
//! readers then yield empty values and writers do nothing.
//!
//! # Example
//!
//! ```
//! use http::HeaderMap;
//! use microbus_core::{Frame, FrameMut, OpCode};
//!
//! let mut headers = HeaderMap::new();
//! FrameMut::of(&mut headers).set_op_code(OpCode::Request).set_fragment(2, 5);
//!
//! let frame = Frame::of(&headers);
//! assert_eq!(frame.op_code(), OpCode::Request);
//! assert_eq!(frame.fragment(), (2, 5));
//! assert_eq!(Frame::empty().fragment(), (1, 1));
//! ```

use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Prefix shared by all control headers.
pub const PREFIX: &str = "microbus-";

/// Header names of the control frame.
pub mod headers {
    /// Unique message id.
    pub const MSG_ID: &str = "microbus-msg-id";
    /// Host name of the sender.
    pub const FROM_HOST: &str = "microbus-from-host";
    /// Instance id of the sender.
    pub const FROM_ID: &str = "microbus-from-id";
    /// Version of the sender.
    pub const FROM_VERSION: &str = "microbus-from-version";
    /// `Req`, `Ack`, `Err` or empty for a response.
    pub const OP_CODE: &str = "microbus-op-code";
    /// Queue name of the subscription that handled the message.
    pub const QUEUE: &str = "microbus-queue";
    /// Number of hops since the originating request.
    pub const CALL_DEPTH: &str = "microbus-call-depth";
    /// Remaining time budget in milliseconds.
    pub const TIME_BUDGET: &str = "microbus-time-budget";
    /// Fragment index and count, `i/n`.
    pub const FRAGMENT: &str = "microbus-fragment";
    /// Clock offset in milliseconds, used by tests to shift time.
    pub const CLOCK_SHIFT: &str = "microbus-clock-shift";
    /// Prefix of baggage headers.
    pub const BAGGAGE_PREFIX: &str = "microbus-baggage-";
}

/// Operation code of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OpCode {
    /// A request.
    Request,
    /// An acknowledgement sent before the handler runs.
    Ack,
    /// An error response.
    Error,
    /// A regular response.
    #[default]
    Response,
}

impl OpCode {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "Req",
            Self::Ack => "Ack",
            Self::Error => "Err",
            Self::Response => "",
        }
    }

    /// Parses the wire representation. Unknown values are responses.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "Req" => Self::Request,
            "Ack" => Self::Ack,
            "Err" => Self::Error,
            _ => Self::Response,
        }
    }
}

/// Read access to the control headers of a message.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    headers: Option<&'a HeaderMap>,
}

impl<'a> Frame<'a> {
    /// Wraps a header map.
    #[must_use]
    pub const fn of(headers: &'a HeaderMap) -> Self {
        Self {
            headers: Some(headers),
        }
    }

    /// Wraps an optional header map.
    #[must_use]
    pub const fn of_opt(headers: Option<&'a HeaderMap>) -> Self {
        Self { headers }
    }

    /// A frame over no headers.
    #[must_use]
    pub const fn empty() -> Self {
        Self { headers: None }
    }

    /// Returns the raw value of a header, or an empty string.
    #[must_use]
    pub fn get(&self, name: &str) -> &'a str {
        self.headers
            .and_then(|h| h.get(name))
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// Message id.
    #[must_use]
    pub fn msg_id(&self) -> &'a str {
        self.get(headers::MSG_ID)
    }

    /// Host name of the sender.
    #[must_use]
    pub fn from_host(&self) -> &'a str {
        self.get(headers::FROM_HOST)
    }

    /// Instance id of the sender.
    #[must_use]
    pub fn from_id(&self) -> &'a str {
        self.get(headers::FROM_ID)
    }

    /// Version of the sender.
    #[must_use]
    pub fn from_version(&self) -> u32 {
        self.get(headers::FROM_VERSION).parse().unwrap_or(0)
    }

    /// Operation code.
    #[must_use]
    pub fn op_code(&self) -> OpCode {
        OpCode::parse(self.get(headers::OP_CODE))
    }

    /// Queue name.
    #[must_use]
    pub fn queue(&self) -> &'a str {
        self.get(headers::QUEUE)
    }

    /// Call depth, zero when absent.
    #[must_use]
    pub fn call_depth(&self) -> u32 {
        self.get(headers::CALL_DEPTH).parse().unwrap_or(0)
    }

    /// Remaining time budget, `None` when the message carries no budget.
    #[must_use]
    pub fn time_budget(&self) -> Option<Duration> {
        self.get(headers::TIME_BUDGET)
            .parse::<u64>()
            .ok()
            .map(Duration::from_millis)
    }

    /// Fragment index and count. Defaults to `(1, 1)`.
    #[must_use]
    pub fn fragment(&self) -> (u32, u32) {
        let raw = self.get(headers::FRAGMENT);
        let Some((index, count)) = raw.split_once('/') else {
            return (1, 1);
        };
        match (index.parse::<u32>(), count.parse::<u32>()) {
            (Ok(i), Ok(n)) if i >= 1 && n >= 1 && i <= n => (i, n),
            _ => (1, 1),
        }
    }

    /// Clock shift in milliseconds.
    #[must_use]
    pub fn clock_shift(&self) -> i64 {
        self.get(headers::CLOCK_SHIFT).parse().unwrap_or(0)
    }

    /// Value of a baggage item.
    #[must_use]
    pub fn baggage(&self, name: &str) -> &'a str {
        self.get(&format!("{}{}", headers::BAGGAGE_PREFIX, name.to_ascii_lowercase()))
    }

    /// Iterates over all baggage items as `(name, value)`.
    pub fn baggage_items(&self) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.headers
            .into_iter()
            .flat_map(HeaderMap::iter)
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix(headers::BAGGAGE_PREFIX)?;
                Some((key, value.to_str().ok()?))
            })
    }
}

/// Write access to the control headers of a message.
///
/// Setters accept `&mut self` and return it so they can be chained. Setting
/// an empty value removes the header. Values that are not valid header text
/// are dropped.
#[derive(Debug)]
pub struct FrameMut<'a> {
    headers: Option<&'a mut HeaderMap>,
}

impl<'a> FrameMut<'a> {
    /// Wraps a header map.
    #[must_use]
    pub fn of(headers: &'a mut HeaderMap) -> Self {
        Self {
            headers: Some(headers),
        }
    }

    /// A frame writer over no headers.
    #[must_use]
    pub const fn empty() -> Self {
        Self { headers: None }
    }

    /// Sets or removes a raw header.
    pub fn set(&mut self, name: &str, value: &str) -> &mut Self {
        let Some(headers) = self.headers.as_deref_mut() else {
            return self;
        };
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            return self;
        };
        if value.is_empty() {
            headers.remove(&name);
        } else if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
        self
    }

    /// Sets the message id.
    pub fn set_msg_id(&mut self, id: &str) -> &mut Self {
        self.set(headers::MSG_ID, id)
    }

    /// Sets the sender host.
    pub fn set_from_host(&mut self, host: &str) -> &mut Self {
        self.set(headers::FROM_HOST, host)
    }

    /// Sets the sender instance id.
    pub fn set_from_id(&mut self, id: &str) -> &mut Self {
        self.set(headers::FROM_ID, id)
    }

    /// Sets the sender version.
    pub fn set_from_version(&mut self, version: u32) -> &mut Self {
        self.set(headers::FROM_VERSION, &version.to_string())
    }

    /// Sets the operation code.
    pub fn set_op_code(&mut self, op: OpCode) -> &mut Self {
        self.set(headers::OP_CODE, op.as_str())
    }

    /// Sets the queue name.
    pub fn set_queue(&mut self, queue: &str) -> &mut Self {
        self.set(headers::QUEUE, queue)
    }

    /// Sets the call depth.
    pub fn set_call_depth(&mut self, depth: u32) -> &mut Self {
        self.set(headers::CALL_DEPTH, &depth.to_string())
    }

    /// Sets the time budget, rounded down to milliseconds.
    pub fn set_time_budget(&mut self, budget: Duration) -> &mut Self {
        self.set(headers::TIME_BUDGET, &budget.as_millis().to_string())
    }

    /// Sets the fragment index and count. `(1, 1)` removes the header.
    pub fn set_fragment(&mut self, index: u32, count: u32) -> &mut Self {
        if index == 1 && count == 1 {
            self.set(headers::FRAGMENT, "")
        } else {
            self.set(headers::FRAGMENT, &format!("{index}/{count}"))
        }
    }

    /// Sets the clock shift in milliseconds. Zero removes the header.
    pub fn set_clock_shift(&mut self, millis: i64) -> &mut Self {
        if millis == 0 {
            self.set(headers::CLOCK_SHIFT, "")
        } else {
            self.set(headers::CLOCK_SHIFT, &millis.to_string())
        }
    }

    /// Sets a baggage item.
    pub fn set_baggage(&mut self, name: &str, value: &str) -> &mut Self {
        let key = format!("{}{}", headers::BAGGAGE_PREFIX, name.to_ascii_lowercase());
        self.set(&key, value)
    }

    /// Removes every control header.
    pub fn clear(&mut self) -> &mut Self {
        if let Some(headers) = self.headers.as_deref_mut() {
            strip_control_headers(headers);
        }
        self
    }
}

/// Returns `true` if the header name is a control header.
#[must_use]
pub fn is_control_header(name: &str) -> bool {
    name.len() >= PREFIX.len() && name[..PREFIX.len()].eq_ignore_ascii_case(PREFIX)
}

/// Removes all `Microbus-*` headers from a map.
pub fn strip_control_headers(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_control_header(name.as_str()))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_frame_defaults() {
        let frame = Frame::empty();
        assert_eq!(frame.msg_id(), "");
        assert_eq!(frame.fragment(), (1, 1));
        assert_eq!(frame.time_budget(), None);
        assert_eq!(frame.call_depth(), 0);
        assert_eq!(frame.op_code(), OpCode::Response);
    }

    #[test]
    fn test_empty_writer_is_noop() {
        let mut writer = FrameMut::empty();
        writer.set_msg_id("abc").set_call_depth(3);
    }

    #[test]
    fn test_set_and_get() {
        let mut headers = HeaderMap::new();
        FrameMut::of(&mut headers)
            .set_msg_id("m1")
            .set_from_host("alpha.example")
            .set_from_id("x1")
            .set_from_version(7)
            .set_queue("q")
            .set_call_depth(4)
            .set_time_budget(Duration::from_millis(1500))
            .set_clock_shift(-250);

        let frame = Frame::of(&headers);
        assert_eq!(frame.msg_id(), "m1");
        assert_eq!(frame.from_host(), "alpha.example");
        assert_eq!(frame.from_id(), "x1");
        assert_eq!(frame.from_version(), 7);
        assert_eq!(frame.queue(), "q");
        assert_eq!(frame.call_depth(), 4);
        assert_eq!(frame.time_budget(), Some(Duration::from_millis(1500)));
        assert_eq!(frame.clock_shift(), -250);
    }

    #[test]
    fn test_empty_value_removes_header() {
        let mut headers = HeaderMap::new();
        FrameMut::of(&mut headers).set_queue("q");
        assert!(headers.contains_key(headers::QUEUE));
        FrameMut::of(&mut headers).set_queue("");
        assert!(!headers.contains_key(headers::QUEUE));
    }

    #[test]
    fn test_malformed_fragment_defaults() {
        let mut headers = HeaderMap::new();
        headers.insert(headers::FRAGMENT, HeaderValue::from_static("3/2"));
        assert_eq!(Frame::of(&headers).fragment(), (1, 1));
        headers.insert(headers::FRAGMENT, HeaderValue::from_static("junk"));
        assert_eq!(Frame::of(&headers).fragment(), (1, 1));
    }

    #[test]
    fn test_baggage() {
        let mut headers = HeaderMap::new();
        FrameMut::of(&mut headers).set_baggage("Tenant", "acme");
        let frame = Frame::of(&headers);
        assert_eq!(frame.baggage("tenant"), "acme");
        let items: Vec<_> = frame.baggage_items().collect();
        assert_eq!(items, vec![("tenant", "acme")]);
    }

    #[test]
    fn test_strip_control_headers() {
        let mut headers = HeaderMap::new();
        FrameMut::of(&mut headers).set_msg_id("m").set_op_code(OpCode::Ack);
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        strip_control_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(is_control_header("Microbus-Msg-Id"));
        assert!(!is_control_header("content-type"));
    }
}
