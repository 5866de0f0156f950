use axum::{
    body::Body,
    http::{Request, Uri},
    middleware::Next,
    response::Response,
};
use tracing::Span;

/// Record request coordinates on the current span so handler logs carry
/// them.
pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();
    let span = Span::current();

    span.record("http.method", req.method().as_str());
    span.record("http.uri", uri.path());
    if let Some(query) = uri.query() {
        span.record("http.query", query);
    }

    next.run(req).await
}

/// Treat `/api/figma/auth-bridge/` and `/api/figma/auth-bridge` as the same
/// route by rewriting the URI before routing.
pub async fn strip_trailing_slash(mut req: Request<Body>, next: Next) -> Response {
    let uri = req.uri();

    if uri.path().len() > 1 {
        if let Some(path) = uri.path().strip_suffix('/') {
            let rewritten = match uri.query() {
                Some(query) => format!("{path}?{query}"),
                None => path.to_string(),
            };
            if let Ok(new_uri) = rewritten.parse::<Uri>() {
                *req.uri_mut() = new_uri;
            }
        }
    }

    next.run(req).await
}
