//! Rejects requests for paths that are commonly probed by scanners.

use std::collections::HashSet;

use http::StatusCode;
use microbus_core::ResponseExt;

use crate::middleware::{BoxFuture, IngressContext, IngressRequest, Middleware, Next, Response};

/// Paths blocked by default. Entries starting with `*.` block a file
/// extension.
pub const DEFAULT_BLOCKED_PATHS: &str = "/admin.php, /config.env, /.env, /.git, /.aws/credentials, \
     /wp-admin, /wp-login.php, /xmlrpc.php, /cgi-bin, /phpmyadmin, /vendor/phpunit, \
     *.asp, *.aspx, *.cgi, *.jsp, *.php, *.pl, *.sql";

/// Responds with 404 to blocked paths.
#[derive(Debug, Clone, Default)]
pub struct BlockedPaths {
    exact: HashSet<String>,
    extensions: HashSet<String>,
}

impl BlockedPaths {
    /// Parses a comma or newline separated list of paths and `*.ext`
    /// patterns. Matching ignores case.
    #[must_use]
    pub fn parse(list: &str) -> Self {
        let mut blocked = Self::default();
        for entry in list
            .split([',', '\n'])
            .map(str::trim)
            .filter(|e| !e.is_empty())
        {
            let entry = entry.to_ascii_lowercase();
            if let Some(ext) = entry.strip_prefix("*.") {
                blocked.extensions.insert(ext.to_string());
            } else if entry.starts_with('/') {
                blocked.exact.insert(entry.trim_end_matches('/').to_string());
            } else {
                blocked.exact.insert(format!("/{}", entry.trim_end_matches('/')));
            }
        }
        blocked
    }

    /// Returns `true` if the external path is blocked.
    ///
    /// The path is tested both whole and without its first segment, which
    /// names the internal host.
    #[must_use]
    pub fn is_blocked(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        let path = path.trim_end_matches('/');
        if self.exact.contains(path) {
            return true;
        }
        if let Some(idx) = path.get(1..).and_then(|rest| rest.find('/')) {
            if self.exact.contains(&path[idx + 1..]) {
                return true;
            }
        }
        let file = path.rsplit('/').next().unwrap_or_default();
        file.rsplit_once('.')
            .is_some_and(|(_, ext)| self.extensions.contains(ext))
    }
}

impl Middleware for BlockedPaths {
    fn name(&self) -> &'static str {
        "blocked-paths"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut IngressContext,
        request: IngressRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            if self.is_blocked(request.uri().path()) {
                tracing::debug!(path = %request.uri().path(), "Blocked path");
                return Response::empty(StatusCode::NOT_FOUND);
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

    #[test]
    fn test_default_list() {
        let blocked = BlockedPaths::parse(DEFAULT_BLOCKED_PATHS);
        assert!(blocked.is_blocked("/.env"));
        assert!(blocked.is_blocked("/wp-login.php"));
        assert!(blocked.is_blocked("/Admin.PHP"));
        assert!(blocked.is_blocked("/anything/index.php"));
        assert!(blocked.is_blocked("/hello.example/.git"));
        assert!(!blocked.is_blocked("/hello.example/hello"));
        assert!(!blocked.is_blocked("/hello.example/style.css"));
        assert!(!blocked.is_blocked("/"));
    }

    #[test]
    fn test_custom_list() {
        let blocked = BlockedPaths::parse("secret\n*.BAK");
        assert!(blocked.is_blocked("/secret/"));
        assert!(blocked.is_blocked("/files/db.bak"));
        assert!(!blocked.is_blocked("/.env"));
        assert!(!BlockedPaths::parse("").is_blocked("/x.php"));
    }

    #[tokio::test]
    async fn test_blocked_request_is_not_forwarded() {
        let pipeline = Pipeline::builder()
            .stage(BlockedPaths::parse(DEFAULT_BLOCKED_PATHS))
            .build();
        let res = pipeline
            .process(context(), request("GET", "/xmlrpc.php", &[]), |_ctx, _req| {
                Box::pin(async { Response::text("forwarded") })
            })
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = pipeline
            .process(context(), request("GET", "/hello.example/hi", &[]), |_ctx, _req| {
                Box::pin(async { Response::text("forwarded") })
            })
            .await;
        assert_eq!(res.status(), StatusCode::OK);
    }
}
