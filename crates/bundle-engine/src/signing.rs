//! Ed25519 verification of manifest bytes.

use crate::error::{EngineError, Result};
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Wire prefix for manifest signatures.
pub const SIGNATURE_PREFIX: &str = "ed25519:";

/// Parse an `ed25519:<base64>` signature value.
///
/// Any other prefix is a parse failure, not a verification failure.
pub fn parse_signature(value: &str) -> Result<Signature> {
    let encoded = value.strip_prefix(SIGNATURE_PREFIX).ok_or_else(|| {
        EngineError::ManifestInvalid(format!("unsupported signature scheme in {value:?}"))
    })?;
    let raw = general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|err| EngineError::ManifestInvalid(format!("malformed base64 signature: {err}")))?;
    let array: [u8; 64] = raw
        .try_into()
        .map_err(|_| EngineError::ManifestInvalid("signature must be 64 bytes".into()))?;
    Ok(Signature::from_bytes(&array))
}

/// Render a signature in wire form.
pub fn encode_signature(signature: &Signature) -> String {
    format!(
        "{SIGNATURE_PREFIX}{}",
        general_purpose::STANDARD.encode(signature.to_bytes())
    )
}

/// Parse a base64-encoded Ed25519 public key (the shell configuration form).
pub fn parse_public_key(encoded: &str) -> Result<VerifyingKey> {
    let raw = general_purpose::STANDARD
        .decode(encoded.trim().as_bytes())
        .map_err(|err| EngineError::validation(format!("malformed base64 public key: {err}")))?;
    let array: [u8; 32] = raw
        .try_into()
        .map_err(|_| EngineError::validation("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|err| EngineError::validation(format!("invalid public key: {err}")))
}

/// Render a public key in the shell configuration form.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    general_purpose::STANDARD.encode(key.to_bytes())
}

/// Verify a wire-form signature over a detached payload.
pub fn verify_detached(key: &VerifyingKey, payload: &[u8], signature: &str) -> Result<()> {
    let signature = parse_signature(signature)?;
    key.verify(payload, &signature)
        .map_err(|_| EngineError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn verifies_a_matching_signature() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let payload = b"manifest payload";
        let signature = encode_signature(&key.sign(payload));
        verify_detached(&key.verifying_key(), payload, &signature).unwrap();
    }

    #[test]
    fn rejects_a_rotated_key() {
        let signer = SigningKey::from_bytes(&[7u8; 32]);
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let payload = b"manifest payload";
        let signature = encode_signature(&signer.sign(payload));
        let err = verify_detached(&other.verifying_key(), payload, &signature).unwrap_err();
        assert!(matches!(err, EngineError::SignatureInvalid));
    }

    #[test]
    fn rejects_foreign_prefixes_as_parse_failures() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let err = verify_detached(&key.verifying_key(), b"x", "rsa:AAAA").unwrap_err();
        assert!(matches!(err, EngineError::ManifestInvalid(_)));
    }

    #[test]
    fn public_key_round_trips_through_base64() {
        let key = SigningKey::from_bytes(&[3u8; 32]).verifying_key();
        let parsed = parse_public_key(&encode_public_key(&key)).unwrap();
        assert_eq!(parsed, key);
    }
}
