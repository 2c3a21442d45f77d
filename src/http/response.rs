//! Proxy-generated responses and response-head inspection

/// Reply confirming an established CONNECT tunnel. No body, no
/// Content-Length.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        403 => "Forbidden",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        502 => "Bad Gateway",
        505 => "HTTP Version Not Supported",
        _ => "Error",
    }
}

/// Build an error response with a small HTML body.
///
/// `detail` replaces the generic body paragraph; for 403 it names the
/// rule class only, never the rule text.
pub fn error_response(status: u16, detail: Option<&str>) -> Vec<u8> {
    build_response(status, &[], detail)
}

/// 407 challenge advertising Basic authentication.
pub fn auth_challenge() -> Vec<u8> {
    build_response(
        407,
        &[("Proxy-Authenticate", "Basic realm=\"proxy\"")],
        Some("Proxy authentication is required to use this server."),
    )
}

fn build_response(status: u16, extra_headers: &[(&str, &str)], detail: Option<&str>) -> Vec<u8> {
    let reason = reason_phrase(status);
    let note =
        detail.unwrap_or("The proxy server encountered an error processing your request.");

    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n\
         <body>\n<h1>{status} {reason}</h1>\n<p>{note}</p>\n</body>\n</html>\n"
    );

    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in extra_headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!(
        "Content-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));

    let mut out = head.into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

/// Decide whether a fully buffered GET response may enter the cache:
/// status 200, no `Cache-Control: no-store`/`private`, and a known
/// `Content-Length` within the per-entry limit.
pub fn response_cacheable(response: &[u8], max_entry_bytes: usize) -> bool {
    let head_end = match response.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(idx) => idx,
        None => return false,
    };

    let head = String::from_utf8_lossy(&response[..head_end]);
    let mut lines = head.split("\r\n");

    let status_line = match lines.next() {
        Some(line) => line,
        None => return false,
    };
    let mut tokens = status_line.split(' ');
    let version_ok = tokens.next().map_or(false, |v| v.starts_with("HTTP/"));
    if !version_ok || tokens.next() != Some("200") {
        return false;
    }

    let mut content_length: Option<u64> = None;
    for line in lines {
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("cache-control") {
            let directives = value.to_ascii_lowercase();
            if directives.contains("no-store") || directives.contains("private") {
                return false;
            }
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().ok();
        }
    }

    match content_length {
        Some(len) => len <= max_entry_bytes as u64,
        None => false,
    }
}
