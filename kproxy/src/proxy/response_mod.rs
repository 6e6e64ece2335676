//! Rewrites an allowed HTML response to overlay the remaining usage-limit minutes.
//!
//! The contract is narrow: never touch a non-HTML or chunked body, and keep `Content-Length`
//! correct when the body is rewritten.

use std::collections::HashSet;

use bytes::Bytes;
use http::{HeaderValue, Response};
use http_body_util::Full;

#[derive(Debug, Clone, Default)]
pub struct ResponseModConfig {
    pub enabled: bool,
    pub disabled_hosts: HashSet<String>,
    pub allowed_content_types: Vec<String>,
}

impl ResponseModConfig {
    fn applies_to(&self, host: &str, content_type: Option<&str>) -> bool {
        if !self.enabled || self.disabled_hosts.contains(host) {
            return false;
        }

        let Some(content_type) = content_type else { return false };

        if self.allowed_content_types.is_empty() {
            content_type.starts_with("text/html")
        } else {
            self.allowed_content_types.iter().any(|allowed| content_type.starts_with(allowed.as_str()))
        }
    }
}

fn overlay_html(minutes_remaining: u32) -> String {
    format!(
        "<div style=\"position:fixed;bottom:0;right:0;z-index:2147483647;background:#222;color:#fff;\
         font:12px sans-serif;padding:4px 8px;border-radius:4px 0 0 0;\">{minutes_remaining} min left today</div>"
    )
}

/// If the response is HTML, the host is eligible, and the body is not chunked, injects the
/// overlay just before `</body>` (or appends it if no closing tag is found).
pub fn inject_timer_overlay(
    response: Response<Full<Bytes>>,
    host: &str,
    minutes_remaining: u32,
    config: &ResponseModConfig,
) -> Response<Full<Bytes>> {
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    if response.headers().get(http::header::TRANSFER_ENCODING).is_some() {
        return response;
    }

    if !config.applies_to(host, content_type.as_deref()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = body.into_inner();

    let mut text = match std::str::from_utf8(&bytes) {
        Ok(text) => text.to_owned(),
        Err(_) => {
            // Non-UTF8 body despite a text/html content-type; leave it untouched.
            return Response::from_parts(parts, Full::new(bytes));
        }
    };

    let overlay = overlay_html(minutes_remaining);
    match text.to_ascii_lowercase().rfind("</body>") {
        Some(index) => text.insert_str(index, &overlay),
        None => text.push_str(&overlay),
    }

    let new_body = Bytes::from(text.into_bytes());
    if let Ok(len) = HeaderValue::from_str(&new_body.len().to_string()) {
        parts.headers.insert(http::header::CONTENT_LENGTH, len);
    }

    Response::from_parts(parts, Full::new(new_body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn html_response(body: &str) -> Response<Full<Bytes>> {
        Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Full::new(Bytes::from(body.to_owned())))
            .unwrap()
    }

    #[test]
    fn injects_before_closing_body_tag() {
        let config = ResponseModConfig {
            enabled: true,
            disabled_hosts: HashSet::new(),
            allowed_content_types: vec![],
        };
        let response = html_response("<html><body>hi</body></html>");
        let rewritten = inject_timer_overlay(response, "example.com", 12, &config);
        let body = rewritten.body().clone().into_inner();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("12 min left today"));
        assert!(text.find("12 min left today").unwrap() < text.find("</body>").unwrap());
    }

    #[test]
    fn leaves_disabled_host_untouched() {
        let mut disabled = HashSet::new();
        disabled.insert("example.com".to_owned());
        let config = ResponseModConfig {
            enabled: true,
            disabled_hosts: disabled,
            allowed_content_types: vec![],
        };
        let response = html_response("<html><body>hi</body></html>");
        let rewritten = inject_timer_overlay(response, "example.com", 12, &config);
        let body = rewritten.body().clone().into_inner();
        assert_eq!(body.as_ref(), b"<html><body>hi</body></html>");
    }

    #[test]
    fn leaves_non_html_untouched() {
        let config = ResponseModConfig {
            enabled: true,
            disabled_hosts: HashSet::new(),
            allowed_content_types: vec![],
        };
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();
        let rewritten = inject_timer_overlay(response, "example.com", 12, &config);
        let body = rewritten.body().clone().into_inner();
        assert_eq!(body.as_ref(), b"{}");
    }
}
