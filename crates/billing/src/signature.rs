//! Webhook signature verification
//!
//! The gateway signs notifications with an `x-signature` header of the form
//! `ts=<timestamp>,v1=<hex hmac>`, where the HMAC-SHA256 covers the manifest
//! `id:<paymentId>;request-id:<x-request-id>;ts:<timestamp>;`.
//!
//! Verification is advisory. A missing or bad signature is logged but does not
//! stop processing, because every entitlement decision is made from the
//! payment fetched back from the gateway, never from the notification body.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified,
    /// No secret configured
    NotConfigured,
    /// Secret configured but the request carried no signature header
    MissingHeader,
    Invalid(&'static str),
}

#[derive(Clone)]
pub struct WebhookSignatureVerifier {
    secret: Option<String>,
}

impl std::fmt::Debug for WebhookSignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSignatureVerifier")
            .field("configured", &self.secret.is_some())
            .finish()
    }
}

struct SignatureHeader<'a> {
    ts: &'a str,
    v1: &'a str,
}

fn parse_header(header: &str) -> Option<SignatureHeader<'_>> {
    let mut ts = None;
    let mut v1 = None;

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim() {
            "ts" => ts = Some(value.trim()),
            "v1" => v1 = Some(value.trim()),
            _ => {}
        }
    }

    match (ts, v1) {
        (Some(ts), Some(v1)) if !ts.is_empty() && !v1.is_empty() => {
            Some(SignatureHeader { ts, v1 })
        }
        _ => None,
    }
}

impl WebhookSignatureVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(
        &self,
        signature_header: Option<&str>,
        request_id: Option<&str>,
        payment_id: &str,
    ) -> SignatureCheck {
        let Some(secret) = &self.secret else {
            return SignatureCheck::NotConfigured;
        };
        let Some(header) = signature_header.filter(|h| !h.trim().is_empty()) else {
            return SignatureCheck::MissingHeader;
        };
        let Some(parsed) = parse_header(header) else {
            return SignatureCheck::Invalid("malformed signature header");
        };
        let Some(request_id) = request_id else {
            return SignatureCheck::Invalid("missing request id");
        };

        let manifest = format!(
            "id:{};request-id:{};ts:{};",
            payment_id, request_id, parsed.ts
        );
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return SignatureCheck::Invalid("unusable secret");
        };
        mac.update(manifest.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        let received = parsed.v1.to_ascii_lowercase();
        if computed.as_bytes().ct_eq(received.as_bytes()).into() {
            SignatureCheck::Verified
        } else {
            SignatureCheck::Invalid("digest mismatch")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, manifest: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(manifest.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_valid_signature() {
        let verifier = WebhookSignatureVerifier::new(Some("s3cret".into()));
        let digest = sign("s3cret", "id:123;request-id:req-1;ts:1700000000;");
        let header = format!("ts=1700000000,v1={}", digest);

        assert_eq!(
            verifier.verify(Some(&header), Some("req-1"), "123"),
            SignatureCheck::Verified
        );
    }

    #[test]
    fn test_header_parts_may_be_reordered_and_spaced() {
        let verifier = WebhookSignatureVerifier::new(Some("s3cret".into()));
        let digest = sign("s3cret", "id:123;request-id:req-1;ts:99;");
        let header = format!(" v1={} , ts=99", digest.to_uppercase());

        assert_eq!(
            verifier.verify(Some(&header), Some("req-1"), "123"),
            SignatureCheck::Verified
        );
    }

    #[test]
    fn test_wrong_payment_id_fails() {
        let verifier = WebhookSignatureVerifier::new(Some("s3cret".into()));
        let digest = sign("s3cret", "id:123;request-id:req-1;ts:1;");
        let header = format!("ts=1,v1={}", digest);

        assert_eq!(
            verifier.verify(Some(&header), Some("req-1"), "124"),
            SignatureCheck::Invalid("digest mismatch")
        );
    }

    #[test]
    fn test_unconfigured_and_missing() {
        let off = WebhookSignatureVerifier::new(None);
        assert_eq!(off.verify(Some("ts=1,v1=ab"), Some("r"), "1"), SignatureCheck::NotConfigured);

        let empty = WebhookSignatureVerifier::new(Some(String::new()));
        assert!(!empty.is_configured());

        let on = WebhookSignatureVerifier::new(Some("k".into()));
        assert_eq!(on.verify(None, Some("r"), "1"), SignatureCheck::MissingHeader);
        assert_eq!(on.verify(Some("  "), Some("r"), "1"), SignatureCheck::MissingHeader);
    }

    #[test]
    fn test_malformed_header() {
        let verifier = WebhookSignatureVerifier::new(Some("k".into()));
        for header in ["garbage", "ts=1", "v1=abc", "ts=,v1=abc"] {
            assert!(matches!(
                verifier.verify(Some(header), Some("r"), "1"),
                SignatureCheck::Invalid(_)
            ));
        }
    }

    #[test]
    fn test_debug_hides_secret() {
        let verifier = WebhookSignatureVerifier::new(Some("topsecret".into()));
        assert!(!format!("{:?}", verifier).contains("topsecret"));
    }
}
