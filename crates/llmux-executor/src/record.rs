//! Request/response audit records.
//!
//! Every outbound upstream call is recorded with a truncated body so
//! operators can replay failures without the log drowning in payloads.

use llmux_core::Auth;

const BODY_LOG_LIMIT: usize = 2048;

pub struct UpstreamRequestLog<'a> {
    pub url: &'a str,
    pub method: &'a str,
    pub provider: &'a str,
    pub body: &'a [u8],
    pub auth: Option<&'a Auth>,
}

pub fn record_api_request(entry: UpstreamRequestLog<'_>) {
    let (auth_id, auth_label) = entry
        .auth
        .map(|auth| (auth.id.as_str(), auth.label.as_str()))
        .unwrap_or(("", ""));
    tracing::debug!(
        provider = entry.provider,
        method = entry.method,
        url = entry.url,
        auth = auth_id,
        label = auth_label,
        body = %truncate_lossy(entry.body, BODY_LOG_LIMIT),
        "upstream request"
    );
}

pub fn record_api_response_metadata(provider: &str, status: u16) {
    tracing::debug!(provider, status, "upstream response");
}

pub fn record_api_response_chunk(provider: &str, chunk: &[u8]) {
    tracing::trace!(provider, chunk = %truncate_lossy(chunk, BODY_LOG_LIMIT), "upstream chunk");
}

pub fn record_api_response_error(provider: &str, error: &dyn std::fmt::Display) {
    tracing::debug!(provider, error = %error, "upstream error");
}

/// Collapses error bodies for messages: HTML becomes a marker, long bodies
/// are truncated.
pub fn summarize_error_body(content_type: &str, body: &[u8]) -> String {
    if content_type.to_ascii_lowercase().contains("text/html") {
        return format!("<html body, {} bytes>", body.len());
    }
    truncate_lossy(body, BODY_LOG_LIMIT)
}

fn truncate_lossy(body: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= limit {
        return text.into_owned();
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... ({} bytes)", &text[..cut], body.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_bodies_are_collapsed() {
        let summary = summarize_error_body("text/html; charset=utf-8", b"<html>big page</html>");
        assert!(summary.starts_with("<html body"));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = vec![b'a'; 5000];
        let summary = summarize_error_body("application/json", &body);
        assert!(summary.len() < 3000);
        assert!(summary.contains("5000 bytes"));
    }
}
