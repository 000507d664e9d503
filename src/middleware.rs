//! Axum embedding for the mitigation pipeline.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → collect query, form or multipart text fields, and cookies (decoded)
//!     → MitigationPipeline::evaluate
//!     → BLOCK: 403 Forbidden, request dropped
//!     → ALLOW: original request forwarded unchanged
//! ```
//!
//! Only urlencoded and multipart form bodies are buffered; any other body
//! streams through untouched.

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{ConnectInfo, FromRequest, Multipart, Request, State},
    http::{self, header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    Router,
};
use percent_encoding::percent_decode_str;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::service::{BlockCategory, MitigationPipeline, Request as ShieldRequest, Verdict};
use crate::utils::create_request_span;

/// State shared by every request passing through the shield.
#[derive(Clone)]
pub struct ShieldState {
    pub pipeline: Arc<MitigationPipeline>,
    /// Form bodies above this size are rejected before inspection
    pub max_body_bytes: usize,
}

impl ShieldState {
    pub fn new(pipeline: Arc<MitigationPipeline>, max_body_bytes: usize) -> Self {
        Self {
            pipeline,
            max_body_bytes,
        }
    }
}

/// Wrap every route of `router` with the shield.
pub fn protect<S>(router: Router<S>, state: ShieldState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(state, shield_middleware))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    UrlEncoded,
    Multipart,
    /// Not inspected
    Opaque,
}

/// Middleware function evaluating each request before the handler runs.
pub async fn shield_middleware(
    State(state): State<ShieldState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let mut inspected = ShieldRequest::new(addr.ip().to_string());
    if let Some(query) = parts.uri.query() {
        inspected.query = decode_pairs(query.as_bytes());
    }
    inspected.cookies = cookie_pairs(&parts.headers);

    let kind = body_kind(&parts.headers);
    let body = if kind == BodyKind::Opaque {
        body
    } else {
        let bytes = match to_bytes(body, state.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(source = %addr.ip(), error = %e, "Request body rejected");
                return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
            }
        };
        inspected.body = match parts.headers.get(header::CONTENT_TYPE) {
            Some(content_type) if kind == BodyKind::Multipart => {
                multipart_fields(content_type, bytes.clone()).await
            }
            _ => decode_pairs(&bytes),
        };
        Body::from(bytes)
    };

    let request_id = Uuid::new_v4().to_string();
    let span = create_request_span(&request_id, &inspected.source_address);
    let verdict = state.pipeline.evaluate(&inspected).instrument(span).await;

    match verdict {
        Verdict::Allow => next.run(Request::from_parts(parts, body)).await,
        Verdict::Block(block) => forbidden(block.category),
    }
}

fn forbidden(category: BlockCategory) -> Response {
    let message = match category {
        BlockCategory::RateLimited => "Too many requests. Try again later.",
        BlockCategory::CountryBlocked => "Access blocked. Your country is restricted.",
        BlockCategory::MaliciousInput => "Entry detected as malicious.",
    };
    (
        StatusCode::FORBIDDEN,
        Html(format!("<h1>403 Forbidden</h1><p>{message}</p>")),
    )
        .into_response()
}

fn body_kind(headers: &HeaderMap) -> BodyKind {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return BodyKind::Opaque;
    };

    let mime = content_type.split(';').next().unwrap_or_default().trim();
    if mime.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
        BodyKind::UrlEncoded
    } else if mime.eq_ignore_ascii_case("multipart/form-data") {
        BodyKind::Multipart
    } else {
        BodyKind::Opaque
    }
}

/// Percent-decode `a=1&b=2`. Undecodable input is kept whole under an empty
/// name so it is still scanned.
fn decode_pairs(raw: &[u8]) -> Vec<(String, String)> {
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(raw).unwrap_or_else(|_| raw_field(raw))
}

fn raw_field(raw: &[u8]) -> Vec<(String, String)> {
    vec![(String::new(), String::from_utf8_lossy(raw).into_owned())]
}

/// Text fields of a multipart body. File parts are not inspected.
async fn multipart_fields(content_type: &HeaderValue, bytes: Bytes) -> Vec<(String, String)> {
    match read_multipart(content_type, bytes.clone()).await {
        Some(fields) => fields,
        None => {
            tracing::debug!("Malformed multipart body scanned as raw text");
            raw_field(&bytes)
        }
    }
}

async fn read_multipart(content_type: &HeaderValue, bytes: Bytes) -> Option<Vec<(String, String)>> {
    let mut request = http::Request::new(Body::from(bytes));
    request
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type.clone());
    let mut multipart = Multipart::from_request(request, &()).await.ok()?;

    let mut fields = Vec::new();
    while let Some(field) = multipart.next_field().await.ok()? {
        if field.file_name().is_some() {
            continue;
        }
        let name = field.name().unwrap_or_default().to_string();
        fields.push((name, field.text().await.ok()?));
    }
    Some(fields)
}

/// `name=value` pairs from every Cookie header, form-decoded. Bytes outside
/// visible ASCII are kept lossily rather than dropping the header.
fn cookie_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for value in headers.get_all(header::COOKIE) {
        let raw = String::from_utf8_lossy(value.as_bytes());
        for pair in raw.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            pairs.push((form_decode(name.trim()), form_decode(value.trim())));
        }
    }
    pairs
}

fn form_decode(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pairs_percent_decodes() {
        assert_eq!(
            decode_pairs(b"q=%3Cb%3E&name=a+b"),
            vec![
                ("q".to_string(), "<b>".to_string()),
                ("name".to_string(), "a b".to_string())
            ]
        );
    }

    #[test]
    fn test_cookie_pairs() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("session=abc; theme=dark"));
        headers.append(header::COOKIE, HeaderValue::from_static("flag"));

        assert_eq!(
            cookie_pairs(&headers),
            vec![
                ("session".to_string(), "abc".to_string()),
                ("theme".to_string(), "dark".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_cookie_values_are_decoded() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::COOKIE,
            HeaderValue::from_static("x=%3Cimg%20src%3Dx%3E; name=a+b"),
        );
        headers.append(header::COOKIE, HeaderValue::from_bytes(b"a=\xE9<b>").unwrap());

        assert_eq!(
            cookie_pairs(&headers),
            vec![
                ("x".to_string(), "<img src=x>".to_string()),
                ("name".to_string(), "a b".to_string()),
                ("a".to_string(), "\u{FFFD}<b>".to_string()),
            ]
        );
    }

    #[test]
    fn test_body_kind_ignores_parameters_and_case() {
        let mut headers = HeaderMap::new();
        assert_eq!(body_kind(&headers), BodyKind::Opaque);

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"),
        );
        assert_eq!(body_kind(&headers), BodyKind::UrlEncoded);

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Multipart/Form-Data; boundary=xyz"),
        );
        assert_eq!(body_kind(&headers), BodyKind::Multipart);

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert_eq!(body_kind(&headers), BodyKind::Opaque);
    }

    #[tokio::test]
    async fn test_multipart_text_fields_skip_files() {
        let body = "--XyZ\r\n\
            Content-Disposition: form-data; name=\"comment\"\r\n\r\n\
            hello\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            <binary>\r\n\
            --XyZ--\r\n";
        let content_type = HeaderValue::from_static("multipart/form-data; boundary=XyZ");

        assert_eq!(
            multipart_fields(&content_type, Bytes::from(body)).await,
            vec![("comment".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_malformed_multipart_is_scanned_raw() {
        let content_type = HeaderValue::from_static("multipart/form-data");
        let fields = multipart_fields(&content_type, Bytes::from_static(b"<script>")).await;
        assert_eq!(fields, vec![(String::new(), "<script>".to_string())]);
    }
}
