use bytes::Bytes;
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    header::{self, HeaderName, HeaderValue},
};

const CRLF: &[u8] = b"\r\n";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug)]
pub enum WireError {
    MissingStartLine,
    MalformedStartLine(String),
    MalformedHeader(String),
    UnterminatedHeaderBlock,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingStartLine => write!(f, "message is missing a start line"),
            Self::MalformedStartLine(line) => write!(f, "malformed start line `{line}`"),
            Self::MalformedHeader(line) => write!(f, "malformed header line `{line}`"),
            Self::UnterminatedHeaderBlock => write!(f, "header block is not CRLF-terminated"),
        }
    }
}

impl std::error::Error for WireError {}

/// Serializes a fully buffered request as canonical HTTP/1.1 octets. The
/// request target is written in origin form; the authority travels in the
/// `Host` header so the bytes round-trip without an absolute URL.
pub fn serialize_request(req: &Request<Bytes>) -> Vec<u8> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("/");

    let mut out = Vec::with_capacity(128 + req.body().len());
    out.extend_from_slice(req.method().as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(path_and_query.as_bytes());
    out.extend_from_slice(b" HTTP/1.1");
    out.extend_from_slice(CRLF);

    if !req.headers().contains_key(header::HOST)
        && let Some(authority) = req.uri().authority()
    {
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(authority.as_str().as_bytes());
        out.extend_from_slice(CRLF);
    }
    write_headers(&mut out, req.headers());
    out.extend_from_slice(CRLF);
    out.extend_from_slice(req.body());
    out
}

/// Serializes a fully buffered response as canonical HTTP/1.1 octets.
pub fn serialize_response(resp: &Response<Bytes>) -> Vec<u8> {
    let status = resp.status();
    let mut out = Vec::with_capacity(128 + resp.body().len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    if let Some(reason) = status.canonical_reason() {
        out.push(b' ');
        out.extend_from_slice(reason.as_bytes());
    }
    out.extend_from_slice(CRLF);
    write_headers(&mut out, resp.headers());
    out.extend_from_slice(CRLF);
    out.extend_from_slice(resp.body());
    out
}

pub fn parse_request(bytes: &[u8]) -> Result<Request<Bytes>, WireError> {
    let (start_line, headers, body) = split_message(bytes)?;
    let mut parts = start_line.splitn(3, ' ');
    let method = parts
        .next()
        .and_then(|raw| Method::from_bytes(raw.as_bytes()).ok())
        .ok_or_else(|| WireError::MalformedStartLine(start_line.to_owned()))?;
    let target = parts
        .next()
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| WireError::MalformedStartLine(start_line.to_owned()))?;
    let uri: Uri = target
        .parse()
        .map_err(|_| WireError::MalformedStartLine(start_line.to_owned()))?;

    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Bytes::copy_from_slice(body))
        .map_err(|_| WireError::MalformedStartLine(start_line.to_owned()))?;
    *req.headers_mut() = headers;
    Ok(req)
}

pub fn parse_response(bytes: &[u8]) -> Result<Response<Bytes>, WireError> {
    let (start_line, headers, body) = split_message(bytes)?;
    let mut parts = start_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(WireError::MalformedStartLine(start_line.to_owned()));
    }
    let status = parts
        .next()
        .and_then(|raw| raw.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| WireError::MalformedStartLine(start_line.to_owned()))?;

    let mut resp = Response::builder()
        .status(status)
        .body(Bytes::copy_from_slice(body))
        .map_err(|_| WireError::MalformedStartLine(start_line.to_owned()))?;
    *resp.headers_mut() = headers;
    Ok(resp)
}

/// Host of a parsed wire request, taken from the `Host` header.
pub fn request_host(req: &Request<Bytes>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
}

fn write_headers(out: &mut Vec<u8>, headers: &hyper::HeaderMap) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(CRLF);
    }
}

fn split_message(bytes: &[u8]) -> Result<(&str, hyper::HeaderMap, &[u8]), WireError> {
    let terminator = find_subslice(bytes, HEADER_TERMINATOR)
        .ok_or(WireError::UnterminatedHeaderBlock)?;
    let head = &bytes[..terminator];
    let body = &bytes[terminator + HEADER_TERMINATOR.len()..];

    let mut lines = head.split(|byte| *byte == b'\n');
    let start_line = lines
        .next()
        .map(trim_cr)
        .filter(|line| !line.is_empty())
        .ok_or(WireError::MissingStartLine)?;
    let start_line = std::str::from_utf8(start_line)
        .map_err(|_| WireError::MissingStartLine)?;

    let mut headers = hyper::HeaderMap::new();
    for line in lines {
        let line = trim_cr(line);
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|byte| *byte == b':')
            .ok_or_else(|| WireError::MalformedHeader(String::from_utf8_lossy(line).into_owned()))?;
        let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| {
            WireError::MalformedHeader(String::from_utf8_lossy(line).into_owned())
        })?;
        let raw_value = trim_leading_spaces(&line[colon + 1..]);
        let value = HeaderValue::from_bytes(raw_value).map_err(|_| {
            WireError::MalformedHeader(String::from_utf8_lossy(line).into_owned())
        })?;
        headers.append(name, value);
    }

    Ok((start_line, headers, body))
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_leading_spaces(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| *byte != b' ' && *byte != b'\t')
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
