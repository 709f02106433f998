use reqwest::{Client, StatusCode};

use crate::error::{DownloadError, ProbeKind};
use crate::item::UNKNOWN_SIZE;

/// Outcome of the pre-download probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub resumable: bool,
    /// Total byte size, or [`UNKNOWN_SIZE`] when the origin did not say.
    pub total_size: i64,
    /// URL after redirects; range requests go here.
    pub final_url: String,
    /// File name advertised via `Content-Disposition`, if any.
    pub attachment_name: Option<String>,
}

/// Request-shaping data shared by the probe and every part worker.
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    pub headers: Vec<(String, String)>,
    pub cookies: Option<String>,
    /// Pre-computed `Authorization: Basic …` value.
    pub auth_header: Option<String>,
}

impl RequestData {
    /// Applies caller headers, cookies, and auth. The caller's own `Range`
    /// header is dropped; a stale captured Range would conflict with the
    /// per-part range we set ourselves.
    pub fn apply(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case("range") {
                continue;
            }
            builder = builder.header(key, value);
        }
        if let Some(cookies) = &self.cookies {
            builder = builder.header("Cookie", cookies);
        }
        if let Some(auth) = &self.auth_header {
            builder = builder.header("Authorization", auth);
        }
        builder
    }
}

/// Sends a 1-byte ranged probe to learn total size, resumability, and the
/// advertised file name. Falls back to `HEAD` when the origin rejects the
/// ranged GET with 405/501.
pub async fn probe_url(
    client: &Client,
    url: &str,
    request: &RequestData,
) -> Result<ProbeResult, DownloadError> {
    let builder = request
        .apply(client.get(url))
        .header("Range", "bytes=0-0");

    let response = builder.send().await.map_err(probe_error)?;
    let status = response.status();

    if matches!(
        status,
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    ) {
        return probe_head(client, url, request).await;
    }

    if !(status.is_success() || status == StatusCode::PARTIAL_CONTENT) {
        return Err(DownloadError::Probe {
            kind: ProbeKind::HttpStatus(status.as_u16()),
            message: format!("{} answered {}", url, status),
        });
    }

    let resumable = status == StatusCode::PARTIAL_CONTENT
        || accepts_byte_ranges(response.headers());

    // Content-Range carries the full size even though we asked for one byte;
    // Content-Length is only trustworthy on a non-partial response.
    let total_size = response
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.rsplit('/').next())
        .filter(|s| *s != "*")
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| {
            if status == StatusCode::PARTIAL_CONTENT {
                None
            } else {
                response.content_length().map(|n| n as i64)
            }
        })
        .unwrap_or(UNKNOWN_SIZE);

    Ok(ProbeResult {
        resumable,
        total_size,
        final_url: response.url().to_string(),
        attachment_name: attachment_name(response.headers()),
    })
}

async fn probe_head(
    client: &Client,
    url: &str,
    request: &RequestData,
) -> Result<ProbeResult, DownloadError> {
    let response = request
        .apply(client.head(url))
        .send()
        .await
        .map_err(probe_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Probe {
            kind: ProbeKind::HttpStatus(status.as_u16()),
            message: format!("HEAD {} answered {}", url, status),
        });
    }

    Ok(ProbeResult {
        resumable: accepts_byte_ranges(response.headers()),
        total_size: response
            .content_length()
            .map(|n| n as i64)
            .unwrap_or(UNKNOWN_SIZE),
        final_url: response.url().to_string(),
        attachment_name: attachment_name(response.headers()),
    })
}

fn accepts_byte_ranges(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("bytes"))
        .unwrap_or(false)
}

fn attachment_name(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_filename)
}

/// Maps a transport failure during the probe onto the probe error taxonomy.
pub(crate) fn probe_error(err: reqwest::Error) -> DownloadError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    let kind = if err.is_redirect() {
        ProbeKind::Redirect
    } else if lower.contains("dns") || lower.contains("resolve") {
        ProbeKind::Dns
    } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        ProbeKind::Tls
    } else {
        ProbeKind::Network
    };
    DownloadError::Probe { kind, message }
}

// ---------------------------------------------------------------------------
// File name derivation
// ---------------------------------------------------------------------------

/// Derives the output file name: explicit override, else `Content-
/// Disposition`, else the URL path basename, else a generated name.
/// The override is validated; derived names are sanitized.
pub fn derive_file_name(
    explicit: Option<&str>,
    attachment_name: Option<&str>,
    final_url: &str,
    item_seed: &str,
) -> Result<String, DownloadError> {
    if let Some(name) = explicit {
        validate_file_name(name)?;
        return Ok(name.to_string());
    }

    if let Some(name) = attachment_name {
        let cleaned = sanitize_file_name(name);
        if !cleaned.is_empty() {
            return Ok(cleaned);
        }
    }

    if let Some(name) = url_basename(final_url) {
        let cleaned = sanitize_file_name(&name);
        if !cleaned.is_empty() {
            return Ok(cleaned);
        }
    }

    Ok(format!("download-{}", &item_seed[..item_seed.len().min(8)]))
}

/// Rejects caller-supplied names that would escape the target directory.
fn validate_file_name(name: &str) -> Result<(), DownloadError> {
    if name.is_empty() {
        return Err(DownloadError::Config("file name is empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(DownloadError::Config(format!(
            "file name {:?} contains a path separator",
            name
        )));
    }
    if name == ".." || name == "." {
        return Err(DownloadError::Config(format!(
            "file name {:?} is a path traversal",
            name
        )));
    }
    Ok(())
}

/// Strips characters that are unsafe in a file name: separators, NUL,
/// control characters; trims surrounding dots and whitespace; caps the
/// length at 255 bytes.
pub fn sanitize_file_name(name: &str) -> String {
    const NAME_MAX: usize = 255;

    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '\0' || c == '/' || c == '\\' || c.is_control() {
            out.push('_');
        } else {
            out.push(c);
        }
    }

    let trimmed = out.trim().trim_matches('.').trim();
    if trimmed == ".." {
        return String::new();
    }

    if trimmed.len() > NAME_MAX {
        let mut take = NAME_MAX;
        while take > 0 && !trimmed.is_char_boundary(take) {
            take -= 1;
        }
        trimmed[..take].to_string()
    } else {
        trimmed.to_string()
    }
}

fn url_basename(url: &str) -> Option<String> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let path = without_query.splitn(2, "://").nth(1).unwrap_or(without_query);
    let base = path.rsplit('/').next()?.trim();
    if base.is_empty() || !path.contains('/') {
        None
    } else {
        Some(base.to_string())
    }
}

/// Extract the file name from a `Content-Disposition` header value.
///
/// Handles the plain `filename=` form and the RFC 5987 `filename*=`
/// extended form (e.g. `filename*=UTF-8''My%20File.mp4`); the extended form
/// wins when both are present.
pub fn extract_filename(disposition: &str) -> Option<String> {
    if let Some(name) = extract_filename_star(disposition) {
        return Some(name);
    }
    extract_filename_plain(disposition)
}

fn extract_filename_star(disposition: &str) -> Option<String> {
    let lower = disposition.to_lowercase();
    let key = "filename*=";
    let idx = lower.find(key)?;
    let rest = &disposition[idx + key.len()..];
    let rest = rest.split(';').next().unwrap_or(rest).trim();

    // Only the UTF-8 charset is handled; anything else falls back to the
    // plain form.
    let encoded = rest
        .strip_prefix("UTF-8''")
        .or_else(|| rest.strip_prefix("utf-8''"))?;
    Some(percent_decode(encoded))
}

fn extract_filename_plain(disposition: &str) -> Option<String> {
    let lower = disposition.to_lowercase();
    let key = "filename=";
    let idx = lower.find(key)?;
    let slice = &disposition[idx + key.len()..];
    let end = slice.find(';').unwrap_or(slice.len());
    let raw = slice[..end].trim().trim_matches('"');
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_filename() {
        assert_eq!(
            extract_filename("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            extract_filename("attachment; filename=data.bin"),
            Some("data.bin".to_string())
        );
    }

    #[test]
    fn rfc5987_filename_wins() {
        assert_eq!(
            extract_filename("attachment; filename=\"fallback.bin\"; filename*=UTF-8''My%20File.mp4"),
            Some("My File.mp4".to_string())
        );
    }

    #[test]
    fn sanitization_strips_separators_and_traversal() {
        assert_eq!(sanitize_file_name("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_file_name("  ..  "), "");
        assert_eq!(sanitize_file_name("file\x00name"), "file_name");
    }

    #[test]
    fn explicit_name_with_traversal_is_rejected() {
        assert!(matches!(
            derive_file_name(Some("../evil"), None, "http://x/y", "deadbeef"),
            Err(DownloadError::Config(_))
        ));
        assert!(matches!(
            derive_file_name(Some("a/b"), None, "http://x/y", "deadbeef"),
            Err(DownloadError::Config(_))
        ));
    }

    #[test]
    fn file_name_precedence() {
        let from_disposition =
            derive_file_name(None, Some("origin.bin"), "http://x/path/last.iso", "deadbeef")
                .unwrap();
        assert_eq!(from_disposition, "origin.bin");

        let from_url = derive_file_name(None, None, "http://x/path/last.iso?t=1", "deadbeef")
            .unwrap();
        assert_eq!(from_url, "last.iso");

        let generated = derive_file_name(None, None, "http://host", "deadbeefcafe").unwrap();
        assert_eq!(generated, "download-deadbeef");
    }
}
