//! Rotating self-signed identity certificates.
//!
//! Every 14-day window has exactly one certificate. Its P-256 key is derived
//! from a label bound to the window start and signatures use RFC 6979, so any
//! node can recompute the exact DER bytes a listener presents for a window.
//! Dialers pin the SHA-256 of those bytes for the previous, current and next
//! window instead of validating against a certificate authority.

use crate::constants::cert::{
    ACCEPTED_OFFSETS, KEY_LABEL_PREFIX, ROTATION_PERIOD_MS, SCALAR_INPUT_LEN,
};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::bigint::{Encoding, NonZero, U384};
use p256::pkcs8::EncodePrivateKey;
use rcgen::{CertificateParams, DistinguishedName, KeyPair, RemoteKeyPair, SerialNumber};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// P-256 group order minus one, widened to 384 bits
const GROUP_ORDER_MINUS_ONE: U384 = U384::from_be_hex(concat!(
    "00000000000000000000000000000000",
    "ffffffff00000000ffffffffffffffffbce6faada7179e84f3b9cac2fc632550"
));

/// Byte length of the P-256 group order
const GROUP_ORDER_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Invalid scalar input: expected {min}-{max} bytes, got {actual}")]
    InvalidScalarLength {
        min: usize,
        max: usize,
        actual: usize,
    },
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    #[error("Certificate generation failed: {0}")]
    Generation(String),
    #[error("Validity window out of range: {0}")]
    TimeRange(String),
}

/// One window's identity
#[derive(Clone)]
pub struct CertificateBundle {
    pub cert_der: Vec<u8>,
    /// PKCS#8 DER private key
    pub key_der: Vec<u8>,
    /// Window start, milliseconds since the epoch
    pub not_before: i64,
    /// Window end, milliseconds since the epoch
    pub not_after: i64,
}

impl CertificateBundle {
    pub fn hash(&self) -> [u8; 32] {
        cert_hash(&self.cert_der)
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms > self.not_after
    }
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("hash", &hex::encode(self.hash()))
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

pub fn cert_hash(cert_der: &[u8]) -> [u8; 32] {
    Sha256::digest(cert_der).into()
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Start of the window `offset` periods away from the one containing `now_ms`
pub fn window_start(now_ms: i64, offset: i64) -> i64 {
    (now_ms.div_euclid(ROTATION_PERIOD_MS) + offset) * ROTATION_PERIOD_MS
}

/// Reduce hash output into a non-zero scalar: `x mod (n - 1) + 1`
fn hash_to_private_scalar(hash: &[u8]) -> Result<[u8; GROUP_ORDER_BYTES], CertError> {
    let min = GROUP_ORDER_BYTES + 8;
    // Reduction runs in fixed 384-bit arithmetic, so the cap is 48 bytes, not 1024
    let max = U384::BYTES;
    if min < 24 || hash.len() < min || hash.len() > max {
        return Err(CertError::InvalidScalarLength {
            min,
            max,
            actual: hash.len(),
        });
    }

    let mut wide = [0u8; U384::BYTES];
    wide[U384::BYTES - hash.len()..].copy_from_slice(hash);
    let modulus = Option::<NonZero<U384>>::from(NonZero::new(GROUP_ORDER_MINUS_ONE))
        .ok_or_else(|| CertError::InvalidKey("zero modulus".to_string()))?;
    let scalar = U384::from_be_bytes(wide)
        .rem(&modulus)
        .wrapping_add(&U384::ONE)
        .to_be_bytes();

    let mut out = [0u8; GROUP_ORDER_BYTES];
    out.copy_from_slice(&scalar[U384::BYTES - GROUP_ORDER_BYTES..]);
    Ok(out)
}

fn derive_signing_key(not_before: i64) -> Result<SigningKey, CertError> {
    let label = format!("{}{}", KEY_LABEL_PREFIX, not_before);
    let digest = Sha512::digest(label.as_bytes());
    let scalar = hash_to_private_scalar(&digest[..SCALAR_INPUT_LEN])?;
    SigningKey::from_slice(&scalar).map_err(|e| CertError::InvalidKey(e.to_string()))
}

/// Deterministic ECDSA signer handed to rcgen
struct WindowKey {
    signing_key: SigningKey,
    public_key: Vec<u8>,
}

impl WindowKey {
    fn new(signing_key: SigningKey) -> Self {
        let public_key = signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Self {
            signing_key,
            public_key,
        }
    }
}

impl RemoteKeyPair for WindowKey {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        let signature: Signature = self.signing_key.sign(msg);
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

fn to_datetime(ms: i64) -> Result<time::OffsetDateTime, CertError> {
    time::OffsetDateTime::from_unix_timestamp(ms.div_euclid(1000))
        .map_err(|e| CertError::TimeRange(e.to_string()))
}

/// Issue the certificate for the window `offset` periods from `now_ms`
pub fn issue_at(now_ms: i64, offset: i64) -> Result<CertificateBundle, CertError> {
    let not_before = window_start(now_ms, offset);
    let not_after = not_before + ROTATION_PERIOD_MS;

    let signing_key = derive_signing_key(not_before)?;
    let key_der = signing_key
        .to_pkcs8_der()
        .map_err(|e| CertError::InvalidKey(e.to_string()))?
        .as_bytes()
        .to_vec();

    let key_pair = KeyPair::from_remote(Box::new(WindowKey::new(signing_key)))
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let mut params = CertificateParams::default();
    params.not_before = to_datetime(not_before)?;
    params.not_after = to_datetime(not_after)?;
    params.serial_number = Some(SerialNumber::from_slice(&[1]));
    params.distinguished_name = DistinguishedName::new();

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(CertificateBundle {
        cert_der: cert.der().to_vec(),
        key_der,
        not_before,
        not_after,
    })
}

/// Issue the certificate for the window `offset` periods from now
pub fn issue(offset: i64) -> Result<CertificateBundle, CertError> {
    issue_at(now_ms(), offset)
}

/// Hashes a dialer accepts at `now_ms`: current, next and previous window
pub fn accepted_hashes_at(now_ms: i64) -> Result<Vec<[u8; 32]>, CertError> {
    ACCEPTED_OFFSETS
        .iter()
        .map(|offset| issue_at(now_ms, *offset).map(|bundle| bundle.hash()))
        .collect()
}

pub fn accepted_hashes() -> Result<Vec<[u8; 32]>, CertError> {
    accepted_hashes_at(now_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::VerifyingKey;

    const T: i64 = 1_760_000_000_000;

    #[test]
    fn test_window_bounds() {
        let bundle = issue_at(T, 0).unwrap();
        assert!(bundle.not_before <= T && T < bundle.not_after);
        assert_eq!(bundle.not_after - bundle.not_before, ROTATION_PERIOD_MS);

        let next = issue_at(T, 1).unwrap();
        assert_eq!(next.not_before, bundle.not_after);
        let prev = issue_at(T, -1).unwrap();
        assert_eq!(prev.not_after, bundle.not_before);
    }

    #[test]
    fn test_same_window_is_byte_identical() {
        let a = issue_at(T, 0).unwrap();
        let b = issue_at(T + 1000, 0).unwrap();
        assert_eq!(a.cert_der, b.cert_der);
        assert_eq!(a.key_der, b.key_der);

        let other = issue_at(T, 1).unwrap();
        assert_ne!(a.hash(), other.hash());
    }

    #[test]
    fn test_derived_key_signs_verifiably() {
        let key = derive_signing_key(window_start(T, 0)).unwrap();
        let again = derive_signing_key(window_start(T, 0)).unwrap();
        let signature: Signature = key.sign(b"window");
        VerifyingKey::from(&again)
            .verify(b"window", &signature)
            .unwrap();
    }

    #[test]
    fn test_scalar_length_bounds() {
        assert!(matches!(
            hash_to_private_scalar(&[7u8; 39]),
            Err(CertError::InvalidScalarLength {
                min: 40,
                actual: 39,
                ..
            })
        ));
        assert!(hash_to_private_scalar(&[7u8; 48]).is_ok());
        assert!(hash_to_private_scalar(&[0xffu8; 48]).unwrap() != [0u8; 32]);
    }

    #[test]
    fn test_expiry() {
        let bundle = issue_at(T, 0).unwrap();
        assert!(!bundle.is_expired_at(T));
        assert!(bundle.is_expired_at(bundle.not_after + 1));
    }
}
