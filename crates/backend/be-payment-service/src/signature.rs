//! HMAC-SHA256 checks for gateway callbacks.
//!
//! Every state change after order creation is gated on one of these
//! returning `true`. None of them error or panic on malformed input; a
//! signature that cannot be decoded simply does not verify.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}

fn payment_message(order_id: &str, payment_id: &str) -> String {
    format!("{order_id}|{payment_id}")
}

/// Hex signature the gateway attaches to a completed checkout.
pub fn sign(order_id: &str, payment_id: &str, secret: &str) -> String {
    let mut mac = mac(secret);
    mac.update(payment_message(order_id, payment_id).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Checks the checkout signature over `order_id|payment_id` in constant time.
pub fn verify(order_id: &str, payment_id: &str, signature: &str, secret: &str) -> bool {
    if order_id.is_empty() || payment_id.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };

    let mut mac = mac(secret);
    mac.update(payment_message(order_id, payment_id).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Hex signature over a raw webhook body.
pub fn sign_webhook(body: &[u8], secret: &str) -> String {
    let mut mac = mac(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a webhook body signature in constant time.
pub fn verify_webhook(body: &[u8], signature: &str, secret: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };

    let mut mac = mac(secret);
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "key_secret_test";

    #[test]
    fn test_roundtrip_verifies() {
        let sig = sign("order_abc", "pay_123", SECRET);
        assert_eq!(sig.len(), 64);
        assert!(verify("order_abc", "pay_123", &sig, SECRET));
    }

    #[test]
    fn test_known_vector() {
        assert_eq!(
            sign_webhook(b"The quick brown fox jumps over the lazy dog", "key"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
        assert_eq!(
            sign("order_1", "pay_1", "secret"),
            sign_webhook(b"order_1|pay_1", "secret")
        );
    }

    #[test]
    fn test_tampered_inputs_fail() {
        let sig = sign("order_abc", "pay_123", SECRET);
        assert!(!verify("order_abc", "pay_124", &sig, SECRET));
        assert!(!verify("order_abd", "pay_123", &sig, SECRET));
        assert!(!verify("order_abc", "pay_123", &sig, "other_secret"));

        let mut flipped = sig.clone().into_bytes();
        flipped[0] = if flipped[0] == b'a' { b'b' } else { b'a' };
        assert!(!verify(
            "order_abc",
            "pay_123",
            std::str::from_utf8(&flipped).unwrap(),
            SECRET
        ));
    }

    #[test]
    fn test_malformed_signatures_return_false() {
        assert!(!verify("order_abc", "pay_123", "", SECRET));
        assert!(!verify("order_abc", "pay_123", "not-hex!", SECRET));
        assert!(!verify("order_abc", "pay_123", "abcd", SECRET));
        assert!(!verify("", "", &sign("", "", SECRET), SECRET));
    }

    #[test]
    fn test_separator_prevents_ambiguity() {
        let sig = sign("order_a", "bpay", SECRET);
        assert!(!verify("order_ab", "pay", &sig, SECRET));
    }

    #[test]
    fn test_webhook_signature() {
        let body = br#"{"event":"payment.captured"}"#;
        let sig = sign_webhook(body, "whsec");
        assert!(verify_webhook(body, &sig, "whsec"));
        assert!(!verify_webhook(br#"{"event":"payment.failed"}"#, &sig, "whsec"));
        assert!(!verify_webhook(body, "zz", "whsec"));
    }
}
