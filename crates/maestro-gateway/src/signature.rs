use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Computes the hex-encoded HMAC-SHA256 signature of a request body.
///
/// This is what senders put in the `X-Maestro-Signature` header.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a hex-encoded HMAC-SHA256 signature against the raw body.
///
/// The underlying comparison is constant-time, so signature checking does
/// not leak timing information.
pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let body = br#"{"source":"github","externalEventId":"evt-1"}"#;
        let signature = sign("topsecret", body);
        assert!(verify("topsecret", body, &signature));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"payload";
        let signature = sign("topsecret", body);
        assert!(!verify("othersecret", body, &signature));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signature = sign("topsecret", b"payload");
        assert!(!verify("topsecret", b"payload2", &signature));
    }

    #[test]
    fn test_malformed_signature_rejected() {
        assert!(!verify("topsecret", b"payload", "not-hex!"));
        assert!(!verify("topsecret", b"payload", ""));
    }
}
