//! Minimal HTTP/1.x framing over the instrumented TLS stream.
//!
//! One request, one response, connection closed. The act of reading the
//! request is what lets the record-splitting probe observe the client's
//! first application-data record, so the snapshot is taken afterwards.

use std::net::SocketAddr;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use tlsgauge_core::classify;
use tlsgauge_tls::{TlsError, TlsStream};

const MAX_HEAD_BYTES: usize = 8192;
const HSTS_HEADER_VALUE: &str = "max-age=31536000; includeSubdomains; preload";

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Request {
    pub method: String,
    pub path: String,
    pub proto_minor: u8,
    pub user_agent: String,
}

/// Serve one request/response cycle on an accepted connection.
pub(crate) async fn serve<IO>(conn: &mut TlsStream<IO>, peer: SocketAddr) -> Result<(), TlsError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    // The first read drives the handshake; handshake errors propagate here
    // and the caller drops the connection without any HTTP framing.
    let request = match read_request_head(conn).await? {
        Some(request) => request,
        None => {
            conn.write(error_500_response(0).as_bytes()).await?;
            return Ok(());
        }
    };

    info!(
        "request: {} {} {} {}",
        peer, request.method, request.path, request.user_agent
    );

    if request.path == "/healthcheck" {
        let response = text_response(request.proto_minor, "ok");
        conn.write(response.as_bytes()).await?;
        return Ok(());
    }

    let Some(snapshot) = conn.snapshot() else {
        conn.write(error_500_response(request.proto_minor).as_bytes())
            .await?;
        return Ok(());
    };
    let report = classify(&snapshot);
    let body = report.to_json();
    let response = json_response(request.proto_minor, &body);
    conn.write(response.as_bytes()).await
}

async fn read_request_head<IO>(conn: &mut TlsStream<IO>) -> Result<Option<Request>, TlsError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_head_end(&head) {
            head.truncate(end);
            break;
        }
        if head.len() > MAX_HEAD_BYTES {
            return Ok(None);
        }
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        head.extend_from_slice(&chunk[..n]);
    }
    let head = match std::str::from_utf8(&head) {
        Ok(s) => s,
        Err(_) => return Ok(None),
    };
    Ok(parse_head(head))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub(crate) fn parse_head(head: &str) -> Option<Request> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_owned();
    let path = parts.next()?.to_owned();
    let version = parts.next()?;
    let proto_minor = match version {
        "HTTP/1.0" => 0,
        "HTTP/1.1" => 1,
        _ => return None,
    };

    let mut user_agent = String::from("nouseragent");
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("user-agent") {
                user_agent = value.trim().to_owned();
            }
        }
    }

    Some(Request {
        method,
        path,
        proto_minor,
        user_agent,
    })
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn response_head(proto_minor: u8, status: &str, content_type: &str, content_length: usize) -> String {
    let mut head = format!("HTTP/1.{proto_minor} {status}\r\n");
    head.push_str(&format!("Date: {}\r\n", http_date()));
    head.push_str(&format!("Content-Type: {content_type}\r\n"));
    head.push_str(&format!("Content-Length: {content_length}\r\n"));
    if proto_minor == 1 {
        head.push_str("Connection: close\r\n");
    }
    head.push_str(&format!("Strict-Transport-Security: {HSTS_HEADER_VALUE}\r\n"));
    // The report API is meant to be called cross-origin from anywhere.
    head.push_str("Access-Control-Allow-Origin: *\r\n");
    head.push_str("Access-Control-Allow-Headers: Content-Type\r\n");
    head.push_str("Access-Control-Expose-Headers: Content-Type\r\n");
    head.push_str("Access-Control-Allow-Methods: GET, POST, OPTIONS, HEAD\r\n");
    head.push_str("\r\n");
    head
}

fn json_response(proto_minor: u8, body: &str) -> String {
    let mut response = response_head(proto_minor, "200 OK", "application/json", body.len());
    response.push_str(body);
    response
}

fn text_response(proto_minor: u8, body: &str) -> String {
    let mut response = response_head(
        proto_minor,
        "200 OK",
        "text/plain; charset=\"utf-8\"",
        body.len(),
    );
    response.push_str(body);
    response
}

pub(crate) fn error_500_response(proto_minor: u8) -> String {
    let body = "500 Internal Server Error\n";
    let mut response = format!("HTTP/1.{proto_minor} 500 Internal Server Error\r\n");
    response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    response.push_str("Connection: close\r\n");
    response.push_str("Content-Type: text/plain; charset=\"utf-8\"\r\n");
    response.push_str(&format!("Strict-Transport-Security: {HSTS_HEADER_VALUE}\r\n"));
    response.push_str(&format!("Date: {}\r\n", http_date()));
    response.push_str("\r\n");
    response.push_str(body);
    response
}
