//! Authorization header computation.
//!
//! Control endpoints expect an `Authorization` value derived from the
//! challenge published by `GET /app/status`:
//!
//! ```text
//! payload   = base64dec(challenge[1..]) || "|" telescopeId "|" bootCount
//! digest    = SHA-512(payload)
//! signed    = Ed25519 signature(digest) || digest          (128 bytes)
//! header    = "Basic android|" challenge[0] "|" base64(signed)
//! ```
//!
//! The signed blob uses the combined form (signature followed by the signed
//! bytes) that the instrument firmware expects.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::hazmat::{ExpandedSecretKey, raw_sign};
use ed25519_dalek::{SECRET_KEY_LENGTH, Signer, SigningKey, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha512};

use crate::error::{Result, VaonisError};
use crate::keys::KeyMaterial;

/// Length of a 32-byte seed followed by its 32-byte public key.
pub const KEYPAIR_LENGTH: usize = 64;

/// Header scheme and client tag prepended to every value.
pub const HEADER_PREFIX: &str = "Basic android|";

/// Inputs for one authorization attempt. Rebuild it for every challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub challenge: String,
    pub telescope_id: String,
    pub boot_count: i64,
}

impl AuthContext {
    pub fn new(challenge: impl Into<String>, telescope_id: impl Into<String>, boot_count: i64) -> Self {
        Self {
            challenge: challenge.into(),
            telescope_id: telescope_id.into(),
            boot_count,
        }
    }

    /// Pulls `challenge`, `telescopeId` and `bootCount` out of a status
    /// snapshot, with or without the `{"result": {...}}` envelope.
    pub fn from_status(status: &Value) -> Result<Self> {
        let body = status.get("result").filter(|r| r.is_object()).unwrap_or(status);

        let challenge = body
            .get("challenge")
            .and_then(Value::as_str)
            .ok_or(VaonisError::MissingStatusField("challenge"))?;
        let telescope_id = match body.get("telescopeId") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(VaonisError::MissingStatusField("telescopeId")),
        };
        let boot_count = match body.get("bootCount") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .ok_or(VaonisError::MissingStatusField("bootCount"))?;

        Ok(Self::new(challenge, telescope_id, boot_count))
    }

    /// Bytes that get hashed: decoded challenge body plus the session tail.
    fn payload(&self) -> Result<(char, Vec<u8>)> {
        let mut chars = self.challenge.chars();
        let prefix = chars.next().ok_or(VaonisError::InvalidChallenge)?;
        let rest = chars.as_str();
        if rest.is_empty() {
            return Err(VaonisError::InvalidChallenge);
        }

        let mut payload = BASE64
            .decode(rest)
            .map_err(|_| VaonisError::InvalidChallenge)?;
        payload.extend_from_slice(format!("|{}|{}", self.telescope_id, self.boot_count).as_bytes());
        Ok((prefix, payload))
    }
}

/// Builds the full `Authorization` header value for `ctx`.
///
/// Deterministic: the same context and key always produce the same string.
pub fn build_authorization_header(ctx: &AuthContext, key: &KeyMaterial) -> Result<String> {
    let (prefix, payload) = ctx.payload()?;
    let digest = Sha512::digest(&payload);
    let signed = sign_combined(digest.as_slice(), key.as_bytes())?;
    Ok(format!("{}{}|{}", HEADER_PREFIX, prefix, BASE64.encode(signed)))
}

/// Returns `signature || message`.
///
/// A 64-byte key is a seed followed by its public key and is used as-is, so
/// the embedded public half enters the signature hash exactly as stored.
fn sign_combined(message: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let signature = match key.len() {
        SECRET_KEY_LENGTH => {
            let seed: [u8; SECRET_KEY_LENGTH] = key
                .try_into()
                .map_err(|_| VaonisError::UnsupportedKeyLength { len: key.len() })?;
            SigningKey::from_bytes(&seed).sign(message).to_bytes()
        }
        KEYPAIR_LENGTH => {
            let (seed, public) = key.split_at(SECRET_KEY_LENGTH);
            let seed: [u8; SECRET_KEY_LENGTH] = seed
                .try_into()
                .map_err(|_| VaonisError::UnsupportedKeyLength { len: key.len() })?;
            let public: [u8; 32] = public
                .try_into()
                .map_err(|_| VaonisError::UnsupportedKeyLength { len: key.len() })?;
            let verifying = VerifyingKey::from_bytes(&public).map_err(|_| {
                VaonisError::InvalidKeyMaterial("public half is not a valid curve point".into())
            })?;
            let expanded = ExpandedSecretKey::from(&seed);
            raw_sign::<Sha512>(&expanded, message, &verifying).to_bytes()
        }
        len => return Err(VaonisError::UnsupportedKeyLength { len }),
    };

    let mut combined = Vec::with_capacity(signature.len() + message.len());
    combined.extend_from_slice(&signature);
    combined.extend_from_slice(message);
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};
    use serde_json::json;

    fn context() -> AuthContext {
        AuthContext::new(format!("A{}", BASE64.encode(b"abc")), "telescope", 2)
    }

    fn decode_blob(header: &str) -> Vec<u8> {
        let encoded = header.splitn(3, '|').nth(2).unwrap();
        BASE64.decode(encoded).unwrap()
    }

    #[test]
    fn test_header_shape_with_expanded_key() {
        let header = build_authorization_header(&context(), &KeyMaterial::from_bytes(vec![0; 64])).unwrap();
        assert!(header.starts_with("Basic android|A|"));
        assert_eq!(decode_blob(&header).len(), 128);
    }

    #[test]
    fn test_header_shape_with_seed() {
        let ctx = AuthContext::new(format!("Z{}", BASE64.encode([0xFFu8; 40])), "T-42", 917);
        let header = build_authorization_header(&ctx, &KeyMaterial::from_bytes(vec![2; 32])).unwrap();
        assert!(header.starts_with("Basic android|Z|"));
        assert_eq!(decode_blob(&header).len(), 128);
    }

    #[test]
    fn test_deterministic() {
        let key = KeyMaterial::from_bytes(vec![7; 32]);
        let first = build_authorization_header(&context(), &key).unwrap();
        let second = build_authorization_header(&context(), &key).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_blob_tail_is_sha512_of_payload() {
        let key = KeyMaterial::from_bytes(vec![3; 32]);
        let blob = decode_blob(&build_authorization_header(&context(), &key).unwrap());

        let expected = Sha512::digest(b"abc|telescope|2");
        assert_eq!(&blob[64..], expected.as_slice());
    }

    #[test]
    fn test_signature_verifies_against_derived_public_key() {
        let signing = SigningKey::from_bytes(&[11; 32]);
        let key = KeyMaterial::from_bytes(vec![11; 32]);
        let blob = decode_blob(&build_authorization_header(&context(), &key).unwrap());

        let signature = Signature::from_slice(&blob[..64]).unwrap();
        assert!(signing.verifying_key().verify(&blob[64..], &signature).is_ok());
    }

    #[test]
    fn test_seed_and_keypair_forms_agree() {
        let signing = SigningKey::from_bytes(&[21; 32]);
        let seed = KeyMaterial::from_bytes(signing.to_bytes().to_vec());
        let keypair = KeyMaterial::from_bytes(signing.to_keypair_bytes().to_vec());

        let a = build_authorization_header(&context(), &seed).unwrap();
        let b = build_authorization_header(&context(), &keypair).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_char_challenge_rejected() {
        let ctx = AuthContext::new("A", "telescope", 1);
        let err = build_authorization_header(&ctx, &KeyMaterial::from_bytes(vec![0; 32])).unwrap_err();
        assert!(matches!(err, VaonisError::InvalidChallenge));
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let err = build_authorization_header(&context(), &KeyMaterial::from_bytes(vec![0; 5])).unwrap_err();
        assert!(matches!(err, VaonisError::UnsupportedKeyLength { len: 5 }));
    }

    #[test]
    fn test_keypair_with_off_curve_public_half_rejected() {
        // y = 2 has no matching x on edwards25519.
        let mut bytes = vec![9u8; 32];
        let mut public = [0u8; 32];
        public[0] = 2;
        bytes.extend_from_slice(&public);

        let err = build_authorization_header(&context(), &KeyMaterial::from_bytes(bytes)).unwrap_err();
        assert!(matches!(err, VaonisError::InvalidKeyMaterial(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Input);
    }

    #[test]
    fn test_from_status_envelope() {
        let status = json!({
            "result": {"challenge": "Babcd", "telescopeId": "st-1", "bootCount": 12}
        });
        let ctx = AuthContext::from_status(&status).unwrap();
        assert_eq!(ctx, AuthContext::new("Babcd", "st-1", 12));
    }

    #[test]
    fn test_from_status_flat_and_missing() {
        let flat = json!({"challenge": "Babcd", "telescopeId": 77, "bootCount": "3"});
        assert_eq!(
            AuthContext::from_status(&flat).unwrap(),
            AuthContext::new("Babcd", "77", 3)
        );

        let missing = json!({"result": {"challenge": "Babcd", "telescopeId": "x"}});
        assert!(matches!(
            AuthContext::from_status(&missing),
            Err(VaonisError::MissingStatusField("bootCount"))
        ));
    }
}
