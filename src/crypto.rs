//! Ed25519 signing primitives and the base64 address codec.
//!
//! An address is the base64 of a 32-byte verifying key; a signature is
//! the base64 of the 64-byte detached signature over the canonical
//! pre-hash bytes. Verification treats every decode failure as an
//! invalid signature rather than an error: the bytes came off the wire.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};

/// Encode a verifying key as a rollup address.
pub fn address_from_key(key: &VerifyingKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Decode a rollup address back into a verifying key, if well-formed.
pub fn key_from_address(address: &str) -> Option<VerifyingKey> {
    let bytes = BASE64.decode(address).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// Verify a base64 signature over `message` against a base64 address.
pub fn verify_signature(address: &str, message: &[u8], signature_b64: &str) -> bool {
    let Some(key) = key_from_address(address) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// An in-memory Ed25519 keypair.
///
/// The on-disk key-file format belongs to the external wallet tooling;
/// the sequencer only ever needs a keypair it can sign with.
pub struct Wallet {
    signing_key: SigningKey,
}

impl Wallet {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn address(&self) -> String {
        address_from_key(&self.signing_key.verifying_key())
    }

    /// Sign a message, returning the base64 detached signature.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(message).to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let wallet = Wallet::generate();
        let message = b"transfer 4 to b";
        let signature = wallet.sign(message);
        assert!(verify_signature(&wallet.address(), message, &signature));
    }

    #[test]
    fn rejects_tampered_message_and_wrong_key() {
        let wallet = Wallet::generate();
        let other = Wallet::generate();
        let signature = wallet.sign(b"original");
        assert!(!verify_signature(&wallet.address(), b"altered", &signature));
        assert!(!verify_signature(&other.address(), b"original", &signature));
    }

    #[test]
    fn rejects_garbage_encodings() {
        let wallet = Wallet::generate();
        let signature = wallet.sign(b"msg");
        assert!(!verify_signature("not-base64!!", b"msg", &signature));
        assert!(!verify_signature(&wallet.address(), b"msg", "###"));
        // Valid base64 but wrong length for a key.
        assert!(!verify_signature("AAAA", b"msg", &signature));
    }

    #[test]
    fn secret_bytes_restore_the_same_address() {
        let wallet = Wallet::generate();
        let restored = Wallet::from_secret_bytes(&wallet.secret_bytes());
        assert_eq!(wallet.address(), restored.address());
    }
}
