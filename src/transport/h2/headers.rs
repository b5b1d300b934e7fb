//! Request header ordering pipeline.
//!
//! Produces the exact field sequence for a HEADERS block. The order is the
//! fingerprint: pseudo-headers in configured order, an optional `trailer`
//! announcement, regular headers sorted by rank, then computed
//! `content-length` and the default `user-agent`.

use crate::error::{Error, Result};
use crate::fingerprint::{FingerprintConfig, PseudoHeader};
use crate::transport::h2::hpack::field_size;

/// Default User-Agent when the request sets none.
pub const DEFAULT_USER_AGENT: &str = concat!("mimic-h2/", env!("CARGO_PKG_VERSION"));

/// Header names that may not appear as trailers.
const FORBIDDEN_TRAILERS: &[&str] = &[
    "authorization",
    "cache-control",
    "connection",
    "content-encoding",
    "content-length",
    "content-range",
    "content-type",
    "expect",
    "host",
    "keep-alive",
    "max-forwards",
    "pragma",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "range",
    "realm",
    "te",
    "trailer",
    "transfer-encoding",
    "www-authenticate",
];

/// Request-line data and headers the pipeline reads.
#[derive(Debug, Clone)]
pub struct RequestHead<'a> {
    pub method: &'a str,
    pub scheme: &'a str,
    pub authority: &'a str,
    pub path: &'a str,
    pub headers: &'a [(String, String)],
    pub trailers: &'a [(String, String)],
    /// `None` when the body length is unknown.
    pub content_length: Option<u64>,
}

/// RFC 9110 token character.
pub fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

pub fn valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(is_tchar)
}

/// Field values may not carry control characters other than horizontal tab.
pub fn valid_header_value(value: &str) -> bool {
    value.bytes().all(|b| (b >= b' ' || b == b'\t') && b != 0x7f)
}

fn valid_pseudo_path(path: &str) -> bool {
    path.starts_with('/') || path == "*"
}

/// `accept-encoding` -> `Accept-Encoding`.
pub fn canonical_key(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn is_connection_specific(key: &str) -> bool {
    ["connection", "proxy-connection", "transfer-encoding", "upgrade", "keep-alive"]
        .iter()
        .any(|h| key.eq_ignore_ascii_case(h))
}

/// Reject request headers that cannot be carried over HTTP/2.
fn check_connection_headers(groups: &[(String, Vec<&str>)]) -> Result<()> {
    for (key, values) in groups {
        let lower = key.to_ascii_lowercase();
        let first = values.first().copied().unwrap_or_default();
        let invalid = match lower.as_str() {
            "upgrade" => values.iter().any(|v| !v.is_empty()),
            "transfer-encoding" => values.len() > 1 || (!first.is_empty() && first != "chunked"),
            "connection" => {
                values.len() > 1
                    || (!first.is_empty()
                        && !first.eq_ignore_ascii_case("close")
                        && !first.eq_ignore_ascii_case("keep-alive"))
            }
            _ => false,
        };
        if invalid {
            return Err(Error::encoding(format!(
                "invalid {} request header: {:?}",
                key, values
            )));
        }
    }
    Ok(())
}

/// Group header values by case-insensitive name, keeping value order.
fn group_headers(headers: &[(String, String)]) -> Vec<(String, Vec<&str>)> {
    let mut groups: Vec<(String, Vec<&str>)> = Vec::new();
    for (name, value) in headers {
        let key = canonical_key(name);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => groups.push((key, vec![value.as_str()])),
        }
    }
    groups
}

/// Sorted, comma-joined trailer names for the `trailer` announcement.
pub fn trailer_announcement(trailers: &[(String, String)]) -> Result<Option<String>> {
    if trailers.is_empty() {
        return Ok(None);
    }
    let mut keys: Vec<String> = Vec::new();
    for (name, _) in trailers {
        if FORBIDDEN_TRAILERS
            .iter()
            .any(|f| name.eq_ignore_ascii_case(f))
        {
            return Err(Error::encoding(format!("invalid trailer {:?}", name)));
        }
        let key = canonical_key(name);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(Some(keys.join(",")))
}

fn should_send_content_length(method: &str, content_length: Option<u64>) -> bool {
    match content_length {
        Some(len) if len > 0 => true,
        Some(_) => matches!(method, "POST" | "PUT" | "PATCH"),
        None => false,
    }
}

/// Emit request fields in wire order, names as written by the caller.
///
/// Every name and value is validated before anything is emitted, so a bad
/// request never reaches the HPACK encoder.
pub fn request_fields(
    head: &RequestHead<'_>,
    config: &FingerprintConfig,
    default_user_agent: &str,
) -> Result<Vec<(String, String)>> {
    let is_connect = head.method == "CONNECT";
    if !is_connect && !valid_pseudo_path(head.path) {
        return Err(Error::encoding(format!(
            "invalid request :path {:?}",
            head.path
        )));
    }
    if !valid_header_value(head.authority) {
        return Err(Error::encoding("invalid request :authority"));
    }
    for (name, value) in head.headers {
        if !valid_header_name(name) {
            return Err(Error::encoding(format!(
                "invalid HTTP header name {:?}",
                name
            )));
        }
        if !valid_header_value(value) {
            return Err(Error::encoding(format!(
                "invalid HTTP header value for header {:?}",
                name
            )));
        }
    }
    for (name, value) in head.trailers {
        if !valid_header_name(name) || !valid_header_value(value) {
            return Err(Error::encoding(format!("invalid trailer {:?}", name)));
        }
    }

    let mut groups = group_headers(head.headers);
    check_connection_headers(&groups)?;
    let trailer = trailer_announcement(head.trailers)?;

    let mut fields: Vec<(String, String)> = Vec::new();
    let mut emit = |name: &str, value: &str| fields.push((name.to_string(), value.to_string()));

    let method = if head.method.is_empty() {
        "GET"
    } else {
        head.method
    };
    for pseudo in config.pseudo_header_order() {
        match pseudo {
            PseudoHeader::Authority => emit(":authority", head.authority),
            PseudoHeader::Method => emit(":method", method),
            PseudoHeader::Path if !is_connect => emit(":path", head.path),
            PseudoHeader::Scheme if !is_connect => emit(":scheme", head.scheme),
            _ => {}
        }
    }

    if let Some(trailer) = &trailer {
        emit("trailer", trailer.as_str());
    }

    if config.header_order().is_empty() {
        groups.sort_by(|a, b| a.0.cmp(&b.0));
    } else {
        groups.sort_by(|a, b| {
            match (config.header_rank(&a.0), config.header_rank(&b.0)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.0.cmp(&b.0),
            }
        });
    }

    let mut did_ua = false;
    for (key, values) in &groups {
        if key.eq_ignore_ascii_case("host") || key.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if is_connection_specific(key) {
            continue;
        }
        if key.eq_ignore_ascii_case("user-agent") {
            did_ua = true;
            match values.first() {
                Some(ua) if !ua.is_empty() => emit(key.as_str(), *ua),
                _ => {}
            }
            continue;
        }
        if key.eq_ignore_ascii_case("cookie") {
            for value in values {
                let mut rest: &str = *value;
                while let Some(p) = rest.find(';') {
                    emit("cookie", &rest[..p]);
                    rest = rest[p + 1..].trim_start_matches(' ');
                }
                if !rest.is_empty() {
                    emit("cookie", rest);
                }
            }
            continue;
        }
        for value in values {
            emit(key.as_str(), *value);
        }
    }

    if should_send_content_length(method, head.content_length) {
        let len = head.content_length.unwrap_or_default().to_string();
        emit("content-length", len.as_str());
    }
    if !did_ua {
        emit("user-agent", default_user_agent);
    }
    Ok(fields)
}

/// Sum the header list size the peer will count.
pub fn header_list_size(fields: &[(String, String)]) -> u64 {
    fields.iter().map(|(n, v)| field_size(n, v)).sum()
}

/// Fail if `fields` exceed the peer's SETTINGS_MAX_HEADER_LIST_SIZE.
pub fn check_header_list_size(fields: &[(String, String)], limit: u64) -> Result<()> {
    let size = header_list_size(fields);
    if size > limit {
        return Err(Error::HeaderListTooLarge { size, limit });
    }
    Ok(())
}

/// Lowercase names for the wire, dropping any name that is not pure ASCII.
pub fn wire_fields(fields: Vec<(String, String)>) -> Vec<(String, String)> {
    fields
        .into_iter()
        .filter(|(name, _)| name.is_ascii())
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect()
}
