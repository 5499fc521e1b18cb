//! Negotiates `Accept-Language` against the languages the server supports.
//!
//! The best match replaces the header, so downstream services see exactly
//! one language they support.

use std::time::Duration;

use http::header::ACCEPT_LANGUAGE;
use http::HeaderValue;
use microbus_connector::lru::Lru;
use parking_lot::Mutex;

use crate::middleware::{BoxFuture, IngressContext, IngressRequest, Middleware, Next, Response};

const CACHE_ENTRIES: usize = 1024;
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// A language tag split into its base language and the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Tag {
    full: String,
    base: String,
}

impl Tag {
    fn parse(s: &str) -> Option<Self> {
        let full = s.trim().replace('_', "-").to_ascii_lowercase();
        if full.is_empty() || full == "*" {
            return None;
        }
        let base = full.split('-').next().unwrap_or_default().to_string();
        Some(Self { full, base })
    }

    /// Canonical form, e.g. `es-AR`.
    fn canonical(&self) -> String {
        let mut parts = self.full.split('-');
        let mut out = parts.next().unwrap_or_default().to_string();
        for part in parts {
            out.push('-');
            match part.len() {
                2 => out.push_str(&part.to_ascii_uppercase()),
                4 => {
                    let mut chars = part.chars();
                    if let Some(first) = chars.next() {
                        out.push(first.to_ascii_uppercase());
                        out.push_str(chars.as_str());
                    }
                }
                _ => out.push_str(part),
            }
        }
        out
    }
}

/// The language matching stage.
#[derive(Debug)]
pub struct LanguageMatcher {
    supported: Vec<Tag>,
    cache: Mutex<Lru<String, String>>,
}

impl LanguageMatcher {
    /// Creates a matcher for a comma separated list of supported languages.
    /// The first language is the fallback.
    #[must_use]
    pub fn new(languages: &str) -> Self {
        Self {
            supported: languages.split(',').filter_map(Tag::parse).collect(),
            cache: Mutex::new(Lru::new(CACHE_ENTRIES, CACHE_TTL)),
        }
    }

    /// Returns `true` if no languages are configured, which disables
    /// matching.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.supported.is_empty()
    }

    /// The supported language that best matches an `Accept-Language`
    /// header value.
    #[must_use]
    pub fn best_match(&self, accept: &str) -> Option<String> {
        if let Some(hit) = self.cache.lock().get(accept) {
            return Some(hit.clone());
        }
        let matched = self.compute(accept)?;
        self.cache.lock().insert(accept.to_string(), matched.clone(), 1);
        Some(matched)
    }

    fn compute(&self, accept: &str) -> Option<String> {
        let fallback = self.supported.first()?;
        for requested in parse_accept_language(accept) {
            let found = self
                .supported
                .iter()
                .find(|s| s.full == requested.full)
                .or_else(|| self.supported.iter().find(|s| s.full == requested.base))
                .or_else(|| self.supported.iter().find(|s| s.base == requested.base));
            if let Some(tag) = found {
                return Some(tag.canonical());
            }
        }
        Some(fallback.canonical())
    }
}

/// Requested tags ordered by descending quality. Tags with `q=0` are
/// dropped; ties keep their order.
fn parse_accept_language(value: &str) -> Vec<Tag> {
    let mut tags: Vec<(Tag, f32)> = value
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let tag = Tag::parse(pieces.next()?)?;
            let q = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            (q > 0.0).then_some((tag, q))
        })
        .collect();
    tags.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    tags.into_iter().map(|(tag, _)| tag).collect()
}

impl Middleware for LanguageMatcher {
    fn name(&self) -> &'static str {
        "language"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut IngressContext,
        mut request: IngressRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            if !self.is_empty() {
                let accept = request
                    .headers()
                    .get(ACCEPT_LANGUAGE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if let Some(value) = self
                    .best_match(&accept)
                    .and_then(|lang| HeaderValue::from_str(&lang).ok())
                {
                    request.headers_mut().insert(ACCEPT_LANGUAGE, value);
                }
            }
            next.run(ctx, request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::tests::{context, request};
    use crate::middleware::Pipeline;
    use microbus_core::ResponseExt;

    #[test]
    fn test_best_match() {
        let m = LanguageMatcher::new("en,fr,es-ar");
        assert_eq!(m.best_match("en-us,es;q=0.5").as_deref(), Some("en"));
        assert_eq!(m.best_match("es;q=0.5").as_deref(), Some("es-AR"));
        assert_eq!(m.best_match("fr-ca;q=0.8,en;q=0.4").as_deref(), Some("fr"));
        assert_eq!(m.best_match("en;q=0.2, fr;q=0.9").as_deref(), Some("fr"));
        assert_eq!(m.best_match("es-AR").as_deref(), Some("es-AR"));
        // Unsupported and missing fall back to the first language
        assert_eq!(m.best_match("de").as_deref(), Some("en"));
        assert_eq!(m.best_match("").as_deref(), Some("en"));
        assert_eq!(m.best_match("fr;q=0, de").as_deref(), Some("en"));
    }

    #[test]
    fn test_repeated_lookups_hit_the_cache() {
        let m = LanguageMatcher::new("en,fr");
        assert_eq!(m.best_match("fr-ca").as_deref(), Some("fr"));
        assert_eq!(m.cache.lock().len(), 1);
        assert_eq!(m.best_match("fr-ca").as_deref(), Some("fr"));
        assert_eq!(m.cache.lock().len(), 1);
    }

    #[test]
    fn test_no_languages_disables_matching() {
        let m = LanguageMatcher::new(" , ");
        assert!(m.is_empty());
        assert_eq!(m.best_match("en"), None);
    }

    #[test]
    fn test_canonical_form() {
        assert_eq!(Tag::parse("ZH_hant_tw").unwrap().canonical(), "zh-Hant-TW");
        assert_eq!(Tag::parse("es-419").unwrap().canonical(), "es-419");
    }

    #[tokio::test]
    async fn test_header_is_rewritten() {
        let pipeline = Pipeline::builder()
            .stage(LanguageMatcher::new("en,fr,es-ar"))
            .build();
        let res = pipeline
            .process(
                context(),
                request("GET", "/x", &[("accept-language", "es;q=0.5")]),
                |_ctx, req| {
                    let lang = req.headers()[ACCEPT_LANGUAGE].to_str().unwrap_or_default().to_string();
                    Box::pin(async move { Response::text(lang) })
                },
            )
            .await;
        assert_eq!(res.body().as_ref(), b"es-AR");
    }
}
