//! Minimal HTTP/1.1 request reading and response writing.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::{Read, Write};

const MAX_HEADER_BYTES: usize = 16 * 1024;
pub(crate) const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Lower-cased media type without parameters.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
            .map(|value| value.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
    }

    /// Decoded path segments after the leading '/'.
    pub fn segments(&self) -> Vec<String> {
        self.path
            .trim_start_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(percent_decode)
            .collect()
    }
}

/// Read one request, headers and body.
///
/// Answers `Expect: 100-continue` before reading the body.
pub(crate) fn read_request<S: Read + Write>(stream: &mut S) -> Result<HttpRequest> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_subslice(&data, b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf).context("read request")?;
        if n == 0 {
            return Err(anyhow!("connection closed before request completed"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large ({} bytes)", content_length));
    }

    let mut body = data.split_off(header_end + 4);
    if body.len() < content_length
        && headers
            .get("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    }
    while body.len() < content_length {
        let n = stream.read(&mut buf).context("read request body")?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path,
        headers,
        body,
    })
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        422 => "HTTP/1.1 422 Unprocessable Entity",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Methods: GET, POST, PATCH, DELETE, OPTIONS\r\n\
Access-Control-Allow-Headers: Content-Type\r\n";

pub(crate) fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n{cors}Connection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len(),
        cors = CORS_HEADERS,
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn write_json<W: Write, T: serde::Serialize + ?Sized>(
    stream: &mut W,
    status: u16,
    value: &T,
) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &body)
}

pub(crate) fn write_error<W: Write>(stream: &mut W, status: u16, message: &str) -> Result<()> {
    write_json(stream, status, &serde_json::json!({ "error": message }))
}

pub(crate) fn write_event_stream_head<W: Write>(stream: &mut W) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-store\r\n{}Connection: keep-alive\r\n\r\n",
        CORS_HEADERS
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn percent_decode(segment: &str) -> String {
    // form_urlencoded turns '+' into a space; keep it literal in paths.
    let escaped = segment.replace('+', "%2B");
    url::form_urlencoded::parse(format!("v={}", escaped).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

/// File content of a `multipart/form-data` body.
///
/// Prefers a non-empty part named `image`; otherwise the first non-empty
/// part carrying a filename. `None` when no such part exists.
pub(crate) fn multipart_file(content_type: &str, body: &[u8]) -> Option<Vec<u8>> {
    let boundary = content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })?;
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();

    let mut named = None;
    let mut first_file = None;
    let mut rest = body;
    while let Some(start) = find_subslice(rest, delimiter) {
        rest = &rest[start + delimiter.len()..];
        if rest.starts_with(b"--") {
            break;
        }
        let rest_trimmed = rest.strip_prefix(b"\r\n").unwrap_or(rest);
        let Some(head_end) = find_subslice(rest_trimmed, b"\r\n\r\n") else {
            break;
        };
        let head = String::from_utf8_lossy(&rest_trimmed[..head_end]).to_ascii_lowercase();
        let content = &rest_trimmed[head_end + 4..];
        let end = find_subslice(content, delimiter).unwrap_or(content.len());
        let data = content[..end]
            .strip_suffix(b"\r\n")
            .unwrap_or(&content[..end]);

        let disposition = head
            .lines()
            .find(|line| line.starts_with("content-disposition"))
            .unwrap_or("");
        // Empty parts (an unset file input) never count as the upload.
        if !data.is_empty() {
            if disposition.contains("; name=\"image\"") && named.is_none() {
                named = Some(data.to_vec());
            } else if disposition.contains("filename=") && first_file.is_none() {
                first_file = Some(data.to_vec());
            }
        }
        rest = &content[end..];
    }
    named.or(first_file)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
