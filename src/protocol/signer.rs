//! HMAC-SHA256 signing and verification of envelopes.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::ops::Deref;

use super::envelope::Envelope;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// An envelope carrying a signature. Read-only: take it apart with
/// `into_inner` to change anything, which invalidates the signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignedEnvelope(Envelope);

impl SignedEnvelope {
    pub fn envelope(&self) -> &Envelope {
        &self.0
    }

    pub fn into_inner(self) -> Envelope {
        self.0
    }

    pub fn signature(&self) -> &str {
        self.0.signature.as_deref().unwrap_or_default()
    }
}

impl Deref for SignedEnvelope {
    type Target = Envelope;

    fn deref(&self) -> &Envelope {
        &self.0
    }
}

impl TryFrom<Envelope> for SignedEnvelope {
    type Error = Error;

    /// Wrap an envelope that already carries a signature, e.g. one parsed from JSON.
    /// The signature is not checked here.
    fn try_from(envelope: Envelope) -> Result<Self> {
        if envelope.signature.is_none() {
            return Err(Error::Validation(format!(
                "envelope {} is not signed",
                envelope.message_id
            )));
        }
        Ok(Self(envelope))
    }
}

/// Holds the shared secret used by every participant of a workflow.
#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("secret", &"<redacted>").finish()
    }
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Attach a hex-encoded digest over the envelope's canonical bytes.
    /// Any existing signature is replaced.
    pub fn sign(&self, mut envelope: Envelope) -> Result<SignedEnvelope> {
        let mut mac = self.mac();
        mac.update(&envelope.canonical_bytes()?);
        envelope.signature = Some(hex::encode(mac.finalize().into_bytes()));
        Ok(SignedEnvelope(envelope))
    }

    /// Recompute the digest and compare in constant time.
    ///
    /// Returns `false` for a missing, malformed or mismatched signature.
    pub fn verify(&self, envelope: &Envelope) -> bool {
        let Some(signature) = envelope.signature.as_deref() else {
            return false;
        };
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(bytes) = envelope.canonical_bytes() else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(&bytes);
        mac.verify_slice(&expected).is_ok()
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.secret).expect("HMAC key size is always valid")
    }
}

/// Sign `envelope` with `secret`.
pub fn sign(envelope: Envelope, secret: &str) -> Result<SignedEnvelope> {
    Signer::new(secret).sign(envelope)
}

/// Verify `envelope` against `secret`.
pub fn verify(envelope: &Envelope, secret: &str) -> bool {
    Signer::new(secret).verify(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::MessageType;
    use chrono::Duration;
    use serde_json::json;

    fn paris_proposal() -> Envelope {
        Envelope::proposal(json!({"destination": "Paris"}))
            .sender("planner")
            .receiver("optimizer")
            .build()
            .unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let signed = sign(paris_proposal(), "abc123").unwrap();

        let signature = signed.signature();
        assert_eq!(signature.len(), 64);
        assert!(signature
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));

        assert!(verify(&signed, "abc123"));
        assert!(!verify(&signed, "wrong-secret"));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let envelope = paris_proposal();
        let a = sign(envelope.clone(), "abc123").unwrap();
        let b = sign(envelope, "abc123").unwrap();
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_unsigned_and_malformed() {
        let envelope = paris_proposal();
        assert!(!verify(&envelope, "abc123"));

        let mut bad_hex = envelope.clone();
        bad_hex.signature = Some("not-hex".to_string());
        assert!(!verify(&bad_hex, "abc123"));

        let mut short = envelope;
        short.signature = Some("abcd".to_string());
        assert!(!verify(&short, "abc123"));
    }

    #[test]
    fn test_any_field_mutation_breaks_signature() {
        let signed = sign(paris_proposal(), "abc123").unwrap();

        let mutations: Vec<Box<dyn Fn(&mut Envelope)>> = vec![
            Box::new(|e| e.message_id.push('x')),
            Box::new(|e| e.trace_id.push('x')),
            Box::new(|e| e.correlation_id.push('x')),
            Box::new(|e| e.message_type = MessageType::Query),
            Box::new(|e| e.version = "1.1".to_string()),
            Box::new(|e| e.timestamp = e.timestamp + Duration::milliseconds(1)),
            Box::new(|e| e.payload = json!({"destination": "Parit"})),
            Box::new(|e| e.meta.sender = "mallory".to_string()),
            Box::new(|e| e.meta.receiver = "mallory".to_string()),
            Box::new(|e| e.meta.priority += 1),
            Box::new(|e| e.meta.ttl += 1),
        ];

        for mutate in mutations {
            let mut envelope = signed.clone().into_inner();
            mutate(&mut envelope);
            assert!(!verify(&envelope, "abc123"));
        }
    }

    #[test]
    fn test_survives_json_round_trip() {
        let signed = sign(paris_proposal(), "abc123").unwrap();
        let wire = serde_json::to_string(&signed).unwrap();
        let parsed: Envelope = serde_json::from_str(&wire).unwrap();

        assert!(verify(&parsed, "abc123"));
        assert!(SignedEnvelope::try_from(parsed).is_ok());
        assert!(SignedEnvelope::try_from(paris_proposal()).is_err());
    }

    #[test]
    fn test_signer_debug_hides_secret() {
        let signer = Signer::new("abc123");
        assert!(!format!("{:?}", signer).contains("abc123"));
    }
}
