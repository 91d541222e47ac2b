use std::net::SocketAddr;

use axum::http::HeaderMap;
use gateway_auth::Credential;

/// Header names accepted as an API key carrier (§6 "Authentication header
/// conventions"), checked in this order after `Authorization: Bearer`.
const API_KEY_HEADERS: [&str; 3] = ["x-api-key", "x-api-token", "apikey"];

/// Resolves a [`Credential`] from a request's headers, falling back to
/// [`Credential::Loopback`] when the peer address is loopback and no
/// explicit credential was supplied. Returns `None` when neither is
/// present — callers should reject with `Unauthorized` rather than invent
/// a credential, since [`gateway_auth::Authenticator`] has no "absent"
/// variant of its own.
pub fn extract_credential(headers: &HeaderMap, peer: SocketAddr) -> Option<Credential> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(text) = value.to_str() {
            if let Some(token) = text.strip_prefix("Bearer ") {
                return Some(Credential::Bearer(token.trim().to_string()));
            }
        }
    }

    for name in API_KEY_HEADERS {
        if let Some(value) = headers.get(name) {
            if let Ok(text) = value.to_str() {
                return Some(Credential::ApiKey(text.trim().to_string()));
            }
        }
    }

    if peer.ip().is_loopback() {
        return Some(Credential::Loopback);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer(loopback: bool) -> SocketAddr {
        if loopback {
            "127.0.0.1:54321".parse().unwrap()
        } else {
            "203.0.113.7:54321".parse().unwrap()
        }
    }

    #[test]
    fn bearer_header_takes_precedence_over_loopback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret-token"),
        );
        let credential = extract_credential(&headers, peer(true)).unwrap();
        assert!(matches!(credential, Credential::Bearer(t) if t == "secret-token"));
    }

    #[test]
    fn x_api_key_header_resolves_to_api_key_credential() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k-123"));
        let credential = extract_credential(&headers, peer(false)).unwrap();
        assert!(matches!(credential, Credential::ApiKey(k) if k == "k-123"));
    }

    #[test]
    fn loopback_with_no_headers_resolves_to_loopback_credential() {
        let headers = HeaderMap::new();
        let credential = extract_credential(&headers, peer(true)).unwrap();
        assert!(matches!(credential, Credential::Loopback));
    }

    #[test]
    fn non_loopback_with_no_headers_resolves_to_no_credential() {
        let headers = HeaderMap::new();
        assert!(extract_credential(&headers, peer(false)).is_none());
    }
}
