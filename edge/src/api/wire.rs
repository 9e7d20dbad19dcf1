//! Raw HTTP/1.x framing for the tunnel data plane.
//!
//! Requests are dumped as bytes for the tunnel client, and the bytes it sends
//! back are parsed into a response that can be replayed to the caller.

use actix_web::{
    http::{
        header::{HeaderName, HeaderValue},
        StatusCode,
    },
    HttpRequest, HttpResponse,
};
use anyhow::{anyhow, bail, Result};
use httparse::Status;
use log::debug;

const MAX_HEADERS: usize = 100;

/// Headers that describe one hop and are rewritten rather than forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Serialises a request as the tunnel client will receive it. The body has
/// already been de-chunked by the server, so it is re-framed with a
/// `Content-Length`, and `Connection: close` makes the local service end its
/// response with EOF.
pub fn dump_request(req: &HttpRequest, body: &[u8]) -> Vec<u8> {
    let target = req
        .uri()
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());

    let mut buf = Vec::with_capacity(256 + body.len());
    buf.extend_from_slice(req.method().as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in req.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }

        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !body.is_empty() {
        buf.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    buf.extend_from_slice(b"connection: close\r\n\r\n");
    buf.extend_from_slice(body);

    buf
}

#[derive(Debug)]
pub struct ParsedResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

impl ParsedResponse {
    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Builds the response replayed to the original caller.
    pub fn into_http_response(self) -> HttpResponse {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = HttpResponse::build(status);

        for (name, value) in &self.headers {
            if is_hop_by_hop(name) {
                continue;
            }

            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                (Ok(name), Ok(value)) => {
                    builder.append_header((name, value));
                }
                _ => debug!("dropping malformed response header {name:?}"),
            }
        }

        builder.body(self.body)
    }
}

/// Parses the raw bytes read back from a tunnel socket. The body may be cut
/// short by the read deadline; whatever arrived is kept.
pub fn parse_response(raw: &[u8]) -> Result<ParsedResponse> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let header_len = match response.parse(raw)? {
        Status::Complete(len) => len,
        Status::Partial => bail!("incomplete response head ({} bytes)", raw.len()),
    };

    let status = response
        .code
        .ok_or_else(|| anyhow!("response without status code"))?;

    let headers = response
        .headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect();

    let mut parsed = ParsedResponse {
        status,
        headers,
        body: vec![],
    };

    let body = &raw[header_len..];
    let chunked = parsed
        .header("transfer-encoding")
        .map_or(false, |v| String::from_utf8_lossy(v).to_ascii_lowercase().contains("chunked"));

    parsed.body = if chunked {
        decode_chunked(body)
    } else {
        let content_length = parsed
            .header("content-length")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.trim().parse::<usize>().ok());

        match content_length {
            Some(len) if len < body.len() => body[..len].to_vec(),
            _ => body.to_vec(),
        }
    };

    Ok(parsed)
}

fn decode_chunked(mut body: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(body.len());

    loop {
        let (start, size) = match httparse::parse_chunk_size(body) {
            Ok(Status::Complete((start, size))) => (start, size as usize),
            _ => break,
        };

        body = &body[start..];
        if size == 0 {
            break;
        }

        let available = size.min(body.len());
        decoded.extend_from_slice(&body[..available]);

        // chunk data is followed by CRLF
        match size.checked_add(2) {
            Some(end) if end <= body.len() => body = &body[end..],
            _ => break,
        }
    }

    decoded
}
