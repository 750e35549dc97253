// key-custody-rs/src/wrap.rs
//
// KEK derivation and data-key wrap envelopes.
//
// The KEK is derived from the master key with scrypt over a versioned salt.
// The salt string is stable across restarts; bumping the version changes the
// derivation without invalidating envelopes written under older versions,
// because each envelope records the salt version it was wrapped with.
//
// Envelope formats:
//   v2 (written): AES-256-GCM, fields {v, alg, salt_v, iv, tag, ct}
//   v1 (read-only legacy): AES-256-CBC/PKCS7, fields {v, alg, salt_v, iv, ct}

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use scrypt::{scrypt, Params};
use serde::{Deserialize, Serialize};

use crate::KeyCustodyError;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Current salt version for new envelopes.
pub const CURRENT_SALT_VERSION: u8 = 2;

const GCM_TAG_LEN: usize = 16;

fn salt_for_version(version: u8) -> Result<&'static [u8], KeyCustodyError> {
    match version {
        1 => Ok(b"medrec-custody-kek-v1"),
        2 => Ok(b"medrec-custody-kek-v2"),
        other => Err(KeyCustodyError::WrapFormatInvalid(format!(
            "unknown KEK salt version {other}"
        ))),
    }
}

/// Derive the 32-byte KEK from the master key for the given salt version.
pub fn derive_kek(master_key: &[u8; 32], salt_version: u8) -> Result<[u8; 32], KeyCustodyError> {
    let salt = salt_for_version(salt_version)?;
    // log_n=15 keeps derivation under ~100ms while staying memory-hard.
    let params = Params::new(15, 8, 1, 32)
        .map_err(|e| KeyCustodyError::Crypto(format!("scrypt params: {e}")))?;
    let mut kek = [0u8; 32];
    scrypt(master_key, salt, &params, &mut kek)
        .map_err(|e| KeyCustodyError::Crypto(format!("scrypt derive: {e}")))?;
    Ok(kek)
}

/// A wrap envelope as persisted in the key store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapEnvelope {
    pub v: u8,
    pub alg: String,
    pub salt_v: u8,
    /// Hex IV: 12 bytes for GCM, 16 for legacy CBC.
    pub iv: String,
    /// Hex GCM tag; absent on legacy CBC envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Hex ciphertext.
    pub ct: String,
}

/// Wrap raw key material under the KEK. Always writes the v2 (GCM) format.
pub fn wrap(kek: &[u8; 32], plaintext_key: &[u8]) -> Result<WrapEnvelope, KeyCustodyError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek));
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext_key)
        .map_err(|e| KeyCustodyError::Crypto(format!("wrap failed: {e}")))?;
    // aes-gcm appends the tag to the ciphertext; split it out so the
    // envelope stores iv, tag and ct as separate fields.
    let split = sealed.len() - GCM_TAG_LEN;
    Ok(WrapEnvelope {
        v: 2,
        alg: "AES-256-GCM".to_string(),
        salt_v: CURRENT_SALT_VERSION,
        iv: hex::encode(iv),
        tag: Some(hex::encode(&sealed[split..])),
        ct: hex::encode(&sealed[..split]),
    })
}

/// Unwrap an envelope of either supported version, deriving the KEK for the
/// envelope's salt version.
pub fn unwrap(master_key: &[u8; 32], envelope: &WrapEnvelope) -> Result<Vec<u8>, KeyCustodyError> {
    let kek = derive_kek(master_key, envelope.salt_v)?;
    unwrap_with_kek(&kek, envelope)
}

/// Unwrap with an already-derived KEK. The caller is responsible for the KEK
/// matching the envelope's salt version.
pub fn unwrap_with_kek(
    kek: &[u8; 32],
    envelope: &WrapEnvelope,
) -> Result<Vec<u8>, KeyCustodyError> {
    match envelope.v {
        2 => unwrap_gcm(kek, envelope),
        1 => unwrap_legacy_cbc(kek, envelope),
        other => Err(KeyCustodyError::WrapFormatInvalid(format!(
            "unknown envelope version {other}"
        ))),
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, KeyCustodyError> {
    hex::decode(value)
        .map_err(|_| KeyCustodyError::WrapFormatInvalid(format!("{name} is not valid hex")))
}

fn unwrap_gcm(kek: &[u8; 32], envelope: &WrapEnvelope) -> Result<Vec<u8>, KeyCustodyError> {
    let iv = decode_field("iv", &envelope.iv)?;
    if iv.len() != 12 {
        return Err(KeyCustodyError::WrapFormatInvalid(format!(
            "GCM iv must be 12 bytes, got {}",
            iv.len()
        )));
    }
    let tag = envelope
        .tag
        .as_deref()
        .ok_or_else(|| KeyCustodyError::WrapFormatInvalid("GCM envelope missing tag".into()))
        .and_then(|t| decode_field("tag", t))?;
    let mut ct = decode_field("ct", &envelope.ct)?;
    ct.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek));
    cipher
        .decrypt(Nonce::from_slice(&iv), ct.as_ref())
        .map_err(|e| KeyCustodyError::Crypto(format!("unwrap failed: {e}")))
}

fn unwrap_legacy_cbc(kek: &[u8; 32], envelope: &WrapEnvelope) -> Result<Vec<u8>, KeyCustodyError> {
    let iv: [u8; 16] = decode_field("iv", &envelope.iv)?
        .as_slice()
        .try_into()
        .map_err(|_| KeyCustodyError::WrapFormatInvalid("CBC iv must be 16 bytes".to_string()))?;
    let ct = decode_field("ct", &envelope.ct)?;
    Aes256CbcDec::new(kek.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ct)
        .map_err(|e| KeyCustodyError::Crypto(format!("legacy unwrap failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

    fn master() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let kek = derive_kek(&master(), CURRENT_SALT_VERSION).unwrap();
        let dek = [9u8; 32];
        let envelope = wrap(&kek, &dek).unwrap();
        assert_eq!(envelope.v, 2);
        assert_eq!(envelope.alg, "AES-256-GCM");
        let out = unwrap(&master(), &envelope).unwrap();
        assert_eq!(out, dek);
    }

    #[test]
    fn kek_is_stable_per_salt_version() {
        let a = derive_kek(&master(), 2).unwrap();
        let b = derive_kek(&master(), 2).unwrap();
        let c = derive_kek(&master(), 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let kek = derive_kek(&master(), CURRENT_SALT_VERSION).unwrap();
        let mut envelope = wrap(&kek, &[1u8; 32]).unwrap();
        let mut raw = hex::decode(&envelope.ct).unwrap();
        raw[0] ^= 0xff;
        envelope.ct = hex::encode(raw);
        assert!(matches!(
            unwrap(&master(), &envelope),
            Err(KeyCustodyError::Crypto(_))
        ));
    }

    #[test]
    fn legacy_cbc_envelope_unwraps() {
        let kek = derive_kek(&master(), 1).unwrap();
        let dek = [3u8; 32];
        let iv = [5u8; 16];
        let ct = Aes256CbcEnc::new(&kek.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&dek);
        let envelope = WrapEnvelope {
            v: 1,
            alg: "AES-256-CBC".to_string(),
            salt_v: 1,
            iv: hex::encode(iv),
            tag: None,
            ct: hex::encode(ct),
        };
        assert_eq!(unwrap(&master(), &envelope).unwrap(), dek);
    }

    #[test]
    fn unknown_version_is_format_error() {
        let envelope = WrapEnvelope {
            v: 9,
            alg: "?".into(),
            salt_v: 2,
            iv: String::new(),
            tag: None,
            ct: String::new(),
        };
        assert!(matches!(
            unwrap(&master(), &envelope),
            Err(KeyCustodyError::WrapFormatInvalid(_))
        ));
    }
}
