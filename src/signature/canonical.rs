//! Canonical request construction: URI/query/header canonicalisation and
//! payload hashing. Every rule here must be reproduced exactly for
//! bit-compatibility with existing signing clients.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Percent-encode a single path/query component. Unreserved characters
/// (`A-Za-z0-9-_.~`) pass through literally; `+` maps to `%20` instead of
/// the usual `%2B`; everything else (including `*`, which RFC 3986 leaves
/// unreserved in some implementations) is encoded as `%XX`.
pub fn uri_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            b'+' => encoded.push_str("%20"),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Percent-decode a URI component (e.g. `%2F` → `/`).
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                result.push(byte);
                i += 3;
                continue;
            }
        }
        result.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&result).into_owned()
}

/// Canonicalise a request path: empty path becomes `/`; each segment is
/// decoded then re-encoded independently so a pre-encoded path is not
/// double-encoded, and `/` separators are preserved.
pub fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| uri_encode(&percent_decode(segment)))
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonicalise a raw query string: keys sorted ascending, then values
/// for repeated keys sorted ascending, `k=v` pairs joined with `&`.
pub fn canonical_query_string(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }

    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (uri_encode(&percent_decode(k)), uri_encode(&percent_decode(v))),
            None => (uri_encode(&percent_decode(pair)), String::new()),
        })
        .collect();

    pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the canonical headers block and the `;`-joined signed-headers
/// list for the given ordered, already-lower-cased header names.
///
/// `host` is special-cased to read from the request's true authority —
/// the caller passes this in, sourced from the request URI/target, not
/// from whatever a client chose to put in a literal `Host:` header — and
/// only falls back to the `Host:` header when no authority is available.
pub fn canonical_headers(
    signed_header_names: &[String],
    headers: &HeaderMap,
    authority: Option<&str>,
) -> (String, String) {
    let mut names: Vec<String> = signed_header_names.to_vec();
    names.sort();

    let canonical: String = names
        .iter()
        .map(|name| {
            let value = if name == "host" {
                authority
                    .map(str::to_string)
                    .or_else(|| headers.get("host").and_then(|v| v.to_str().ok()).map(str::to_string))
                    .unwrap_or_default()
            } else {
                headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string()
            };
            let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("{name}:{collapsed}\n")
        })
        .collect();

    let signed_headers = names.join(";");
    (canonical, signed_headers)
}

/// Lowercase hex SHA-256 of the raw body; empty body hashes as the
/// SHA-256 of zero bytes.
pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Assemble the full canonical request string.
pub fn canonical_request(
    method: &str,
    uri_path: &str,
    query: &str,
    canonical_headers_block: &str,
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_uri(uri_path),
        canonical_query_string(query),
        canonical_headers_block,
        signed_headers,
        payload_hash
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_canonicalises_to_root() {
        assert_eq!(canonical_uri(""), "/");
    }

    #[test]
    fn pre_encoded_path_is_not_double_encoded() {
        assert_eq!(canonical_uri("/a/my%20file.zip"), "/a/my%20file.zip");
    }

    #[test]
    fn plus_maps_to_percent_20() {
        assert_eq!(uri_encode("a+b"), "a%20b");
    }

    #[test]
    fn tilde_is_literal() {
        assert_eq!(uri_encode("a~b"), "a~b");
    }

    #[test]
    fn star_is_percent_encoded() {
        assert_eq!(uri_encode("a*b"), "a%2Ab");
    }

    #[test]
    fn query_sorts_keys_then_values() {
        assert_eq!(canonical_query_string("b=2&a=1"), "a=1&b=2");
        assert_eq!(canonical_query_string("k=2&k=1"), "k=1&k=2");
    }

    #[test]
    fn query_empty_is_empty() {
        assert_eq!(canonical_query_string(""), "");
    }

    #[test]
    fn payload_hash_of_empty_body() {
        assert_eq!(
            payload_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn host_falls_back_to_header_when_no_authority() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "vision.example.com".parse().unwrap());
        let names = vec!["host".to_string()];
        let (block, signed) = canonical_headers(&names, &headers, None);
        assert_eq!(block, "host:vision.example.com\n");
        assert_eq!(signed, "host");
    }

    #[test]
    fn authority_takes_priority_over_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "spoofed.example.com".parse().unwrap());
        let names = vec!["host".to_string()];
        let (block, _) = canonical_headers(&names, &headers, Some("vision.example.com"));
        assert_eq!(block, "host:vision.example.com\n");
    }

    #[test]
    fn header_values_are_trimmed_and_collapsed() {
        let mut headers = HeaderMap::new();
        headers.insert("x-date", "  2026  07   28T000000Z ".parse().unwrap());
        let names = vec!["x-date".to_string()];
        let (block, _) = canonical_headers(&names, &headers, None);
        assert_eq!(block, "x-date:2026 07 28T000000Z\n");
    }
}
