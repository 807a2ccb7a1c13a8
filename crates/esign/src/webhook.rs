use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-esign-signature";

/// Completion-callback body. `event_id` is the provider's delivery id and
/// keys the processed-event ledger; `envelope_id` resolves the assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEventPayload {
    pub event_id: String,
    pub envelope_id: String,
    pub status: String,
    #[serde(default)]
    pub occurred_at: Option<String>,
}

/// Constant-time verification of the shared-secret HMAC over the raw body.
/// Callers reject the event without detail on `false`.
pub fn verify_signature(secret: &str, raw_body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);

    let Some(signature) = decode_hex(signature_hex.trim()) else {
        return false;
    };

    mac.verify_slice(&signature).is_ok()
}

/// Hex signature a provider would attach; shared with tests.
pub fn sign_body(secret: &str, raw_body: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(raw_body);
    mac.finalize().into_bytes().iter().map(|byte| format!("{byte:02x}")).collect()
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&raw[index..index + 2], 16).ok())
        .collect()
}
