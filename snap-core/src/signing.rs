use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the exact payload bytes, lowercase hex output.
///
/// Deterministic: the same payload and secret always produce the same
/// signature, which is what lets webhook retries resend an identical
/// signature and lets consumers deduplicate on delivery id.
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check. Returns false for malformed hex rather
/// than erroring, since a bad signature and a forged one deserve the same
/// treatment.
pub fn verify_payload(payload: &[u8], secret: &str, signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
