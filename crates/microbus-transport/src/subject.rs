//! Bus subject scheme.
//!
//! Requests to `hello.example:443` with method `GET` travel on
//! `{plane}.example.hello.443.GET`. Subscriptions to any method use the `*`
//! token in place of the method. Replies travel on `{plane}.r.{msg-id}`.

/// Token used in place of the method by subscriptions to any method.
pub const ANY_METHOD: &str = "ANY";

/// Escapes a subject token. Characters outside `[a-z0-9_-]` become `_`.
#[must_use]
pub fn escape(token: &str) -> String {
    token
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reverses and escapes the segments of a host name.
#[must_use]
pub fn reverse_hostname(hostname: &str) -> String {
    hostname
        .split('.')
        .rev()
        .map(escape)
        .collect::<Vec<_>>()
        .join(".")
}

/// Subject of requests to `host:port` with `method`.
///
/// `ANY` maps to the `*` wildcard and is only meaningful for subscriptions.
#[must_use]
pub fn request_subject(plane: &str, hostname: &str, port: u16, method: &str) -> String {
    let method = if method.eq_ignore_ascii_case(ANY_METHOD) {
        "*".to_string()
    } else {
        method.to_ascii_uppercase()
    };
    format!("{plane}.{}.{port}.{method}", reverse_hostname(hostname))
}

/// Subject of replies to the message `msg_id`.
#[must_use]
pub fn reply_subject(plane: &str, msg_id: &str) -> String {
    format!("{plane}.r.{}", escape(msg_id))
}

/// Returns `true` if `subject` matches `pattern`.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(p), Some(s)) if p == "*" || p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
