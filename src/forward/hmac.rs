//! HMAC-SHA256 request signing for cluster calls.
//!
//! The signed payload is `timestamp + method + path + body`, where the
//! timestamp is Unix seconds in decimal. The hex-encoded MAC travels in
//! `X-Signature` next to `X-Timestamp` and `X-Auth-Type: hmac-sha256`.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::Secret;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const AUTH_TYPE_HEADER: &str = "x-auth-type";
pub const AUTH_TYPE_HMAC_SHA256: &str = "hmac-sha256";

/// Maximum allowed skew between the signer's clock and ours, in seconds.
pub const REPLAY_WINDOW_SECS: i64 = 300;

/// Largest body the verification middleware will buffer.
const MAX_SIGNED_BODY_BYTES: usize = 16 * 1024 * 1024;

fn mac_for(
    secret: &[u8],
    timestamp: &str,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::Internal(format!("Invalid HMAC key: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body);
    Ok(mac)
}

/// Compare two secrets in constant time.
///
/// Both sides are reduced to a MAC under a fixed key first, so neither the
/// content nor the length of `expected` leaks through timing.
pub fn secrets_match(provided: &[u8], expected: &[u8]) -> bool {
    let digest = |value: &[u8]| {
        HmacSha256::new_from_slice(b"llm-router secret comparison").map(|mut mac| {
            mac.update(value);
            mac
        })
    };
    let (Ok(provided), Ok(expected)) = (digest(provided), digest(expected)) else {
        return false;
    };
    provided
        .verify_slice(&expected.finalize().into_bytes())
        .is_ok()
}

/// Hex-encoded signature over `timestamp + method + path + body`.
pub fn sign(
    secret: &[u8],
    timestamp: &str,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<String> {
    let mac = mac_for(secret, timestamp, method, path, body)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Insert the three signing headers for a request sent at `timestamp`.
pub fn apply_signature(
    headers: &mut HeaderMap,
    secret: &[u8],
    timestamp: i64,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<()> {
    let ts = timestamp.to_string();
    let signature = sign(secret, &ts, method, path, body)?;

    headers.insert(
        HeaderName::from_static(TIMESTAMP_HEADER),
        HeaderValue::from(timestamp),
    );
    // Hex is always a valid header value.
    if let Ok(value) = HeaderValue::from_str(&signature) {
        headers.insert(HeaderName::from_static(SIGNATURE_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(AUTH_TYPE_HEADER),
        HeaderValue::from_static(AUTH_TYPE_HMAC_SHA256),
    );
    Ok(())
}

/// Verify the signing headers of an inbound request.
///
/// Every failure (missing header, wrong auth type, stale timestamp, bad
/// signature) is reported as the same opaque [`Error::Auth`].
pub fn verify_signature(
    secret: &[u8],
    headers: &HeaderMap,
    method: &str,
    path: &str,
    body: &[u8],
    now: i64,
) -> Result<()> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let (Some(timestamp), Some(signature), Some(AUTH_TYPE_HMAC_SHA256)) = (
        header(TIMESTAMP_HEADER),
        header(SIGNATURE_HEADER),
        header(AUTH_TYPE_HEADER),
    ) else {
        return Err(Error::Auth);
    };

    let ts: i64 = timestamp.parse().map_err(|_| Error::Auth)?;
    if now.abs_diff(ts) > REPLAY_WINDOW_SECS.unsigned_abs() {
        return Err(Error::Auth);
    }

    let provided = hex::decode(signature).map_err(|_| Error::Auth)?;
    mac_for(secret, timestamp, method, path, body)?
        .verify_slice(&provided)
        .map_err(|_| Error::Auth)
}

/// Axum middleware rejecting requests without a valid HMAC signature.
///
/// Mount with `axum::middleware::from_fn_with_state(secret, require_hmac)`.
pub async fn require_hmac(State(secret): State<Secret>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_SIGNED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return Error::Auth.into_response(),
    };

    let verified = verify_signature(
        secret.expose_secret().as_bytes(),
        &parts.headers,
        parts.method.as_str(),
        parts.uri.path(),
        &bytes,
        chrono::Utc::now().timestamp(),
    );

    if let Err(e) = verified {
        tracing::warn!(path = %parts.uri.path(), "Rejected request with invalid HMAC signature");
        return e.into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"cluster-shared-secret";
    const NOW: i64 = 1_700_000_000;

    fn signed(body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        apply_signature(&mut headers, SECRET, NOW, "POST", "/v1/chat/completions", body).unwrap();
        headers
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let sig = sign(SECRET, "1", "POST", "/", b"").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_headers_present() {
        let headers = signed(b"{}");
        assert_eq!(headers.get(TIMESTAMP_HEADER).unwrap(), "1700000000");
        assert_eq!(headers.get(AUTH_TYPE_HEADER).unwrap(), "hmac-sha256");
        assert_eq!(
            headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap(),
            sign(SECRET, "1700000000", "POST", "/v1/chat/completions", b"{}").unwrap()
        );
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match(b"open-sesame", b"open-sesame"));
        assert!(!secrets_match(b"open-sesamE", b"open-sesame"));
        assert!(!secrets_match(b"open-sesame-", b"open-sesame"));
        assert!(!secrets_match(b"", b"open-sesame"));
        assert!(secrets_match(b"", b""));
    }

    #[test]
    fn test_valid_signature_verifies() {
        let body = br#"{"messages":[]}"#;
        let headers = signed(body);
        assert!(
            verify_signature(SECRET, &headers, "POST", "/v1/chat/completions", body, NOW).is_ok()
        );
    }

    #[test]
    fn test_single_byte_mutations_rejected() {
        let body = br#"{"messages":[]}"#;
        let headers = signed(body);

        let mut tampered = body.to_vec();
        tampered[2] ^= 0x01;
        assert!(matches!(
            verify_signature(SECRET, &headers, "POST", "/v1/chat/completions", &tampered, NOW),
            Err(Error::Auth)
        ));
        assert!(
            verify_signature(SECRET, &headers, "POST", "/v1/chat/completionz", body, NOW).is_err()
        );
        assert!(verify_signature(
            b"cluster-shared-secreT",
            &headers,
            "POST",
            "/v1/chat/completions",
            body,
            NOW,
        )
        .is_err());
        assert!(
            verify_signature(SECRET, &headers, "PUT", "/v1/chat/completions", body, NOW).is_err()
        );
    }

    #[test]
    fn test_replay_window() {
        let body = b"x";
        let headers = signed(body);
        let path = "/v1/chat/completions";
        assert!(
            verify_signature(SECRET, &headers, "POST", path, body, NOW + REPLAY_WINDOW_SECS).is_ok()
        );
        assert!(verify_signature(
            SECRET,
            &headers,
            "POST",
            path,
            body,
            NOW + REPLAY_WINDOW_SECS + 1,
        )
        .is_err());
        assert!(verify_signature(
            SECRET,
            &headers,
            "POST",
            path,
            body,
            NOW - REPLAY_WINDOW_SECS - 1,
        )
        .is_err());
    }

    #[test]
    fn test_missing_or_wrong_auth_type_rejected() {
        let mut headers = signed(b"");
        headers.insert(AUTH_TYPE_HEADER, HeaderValue::from_static("hmac-sha1"));
        assert!(
            verify_signature(SECRET, &headers, "POST", "/v1/chat/completions", b"", NOW).is_err()
        );

        let mut headers = signed(b"");
        headers.remove(SIGNATURE_HEADER);
        assert!(
            verify_signature(SECRET, &headers, "POST", "/v1/chat/completions", b"", NOW).is_err()
        );
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let mut headers = signed(b"");
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("not-hex"));
        assert!(
            verify_signature(SECRET, &headers, "POST", "/v1/chat/completions", b"", NOW).is_err()
        );
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let path = "/v1/chat/completions";
        for ts in [i64::MIN, i64::MAX] {
            let mut headers = signed(b"");
            headers.insert(TIMESTAMP_HEADER, HeaderValue::from(ts));
            assert!(matches!(
                verify_signature(SECRET, &headers, "POST", path, b"", NOW),
                Err(Error::Auth)
            ));
        }

        let headers = signed(b"");
        assert!(verify_signature(SECRET, &headers, "POST", path, b"", i64::MIN).is_err());
        assert!(verify_signature(SECRET, &headers, "POST", path, b"", i64::MAX).is_err());
    }
}

