//! P-256 signing keys for agent identities.
//!
//! Keys are generated from the operating system CSPRNG and never written
//! anywhere by this module. Persisting them is the publisher's job.

use crate::error::{BridgeError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

/// Length in bytes of a P-256 scalar and of each affine coordinate.
const COORDINATE_LEN: usize = 32;

/// Tries before giving up on drawing a scalar inside the curve order.
const MAX_SCALAR_ATTEMPTS: usize = 8;

/// A P-256 key pair owned by exactly one agent.
pub struct KeyPair {
    secret: SecretKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y) = self.public_coordinates();
        f.debug_struct("KeyPair")
            .field("x", &x)
            .field("y", &y)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Restore a key pair from its PKCS#8 PEM encoding.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        let secret = SecretKey::from_pkcs8_pem(pem)?;
        Ok(Self { secret })
    }

    /// PKCS#8 PEM encoding of the private key, LF line endings.
    pub fn to_pkcs8_pem(&self) -> Result<String> {
        let pem = self.secret.to_pkcs8_pem(LineEnding::LF)?;
        Ok(pem.to_string())
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Affine `(x, y)` coordinates of the public key, base64url without padding.
    pub fn public_coordinates(&self) -> (String, String) {
        coordinates_of(&self.public_key())
    }

    pub fn sign(&self, payload: &[u8]) -> Signature {
        SigningKey::from(&self.secret).sign(payload)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(&self.public_key())
    }
}

/// Stateless factory for fresh key pairs.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyPairFactory;

impl KeyPairFactory {
    pub fn new() -> Self {
        Self
    }

    /// Generate a fresh key pair from the OS random source.
    pub fn generate(&self) -> Result<KeyPair> {
        let mut rng = OsRng;
        let mut bytes = [0u8; COORDINATE_LEN];

        // Zero and values at or above the curve order are redrawn.
        for _ in 0..MAX_SCALAR_ATTEMPTS {
            rng.try_fill_bytes(&mut bytes)
                .map_err(|e| BridgeError::Entropy(e.to_string()))?;

            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                bytes.fill(0);
                return Ok(KeyPair { secret });
            }
        }

        bytes.fill(0);
        Err(BridgeError::Entropy(
            "random source produced no valid P-256 scalar".to_string(),
        ))
    }
}

pub(crate) fn coordinates_of(public_key: &PublicKey) -> (String, String) {
    let point = public_key.to_encoded_point(false);
    // Uncompressed points of a valid public key always carry both coordinates.
    let x = point.x().map(|x| URL_SAFE_NO_PAD.encode(x)).unwrap_or_default();
    let y = point.y().map(|y| URL_SAFE_NO_PAD.encode(y)).unwrap_or_default();
    (x, y)
}

/// Recover a public key from base64url JWK coordinates.
pub fn public_key_from_coordinates(x: &str, y: &str) -> Result<PublicKey> {
    let x = decode_coordinate("x", x)?;
    let y = decode_coordinate("y", y)?;

    let point = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&x),
        FieldBytes::from_slice(&y),
        false,
    );

    Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
        .ok_or_else(|| BridgeError::InvalidKey("coordinates are not on P-256".to_string()))
}

/// Check an ECDSA P-256/SHA-256 signature against a public key.
pub fn verify(public_key: &PublicKey, payload: &[u8], signature: &Signature) -> bool {
    VerifyingKey::from(public_key).verify(payload, signature).is_ok()
}

fn decode_coordinate(name: &str, value: &str) -> Result<Vec<u8>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| BridgeError::InvalidKey(format!("{name} is not base64url: {e}")))?;

    if bytes.len() != COORDINATE_LEN {
        return Err(BridgeError::InvalidKey(format!(
            "{name} must be {COORDINATE_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}
