//! Key derivation and authenticated encryption for stored credentials.
//!
//! Every blob gets a fresh random salt and IV. The per-blob key is derived
//! with PBKDF2-HMAC-SHA256 from the versioned master key, the salt and the
//! key version, then used once with AES-256-GCM. Blobs are bound to their
//! owner through the AEAD associated data.
//!
//! Wire format (all integers big-endian):
//! `[format u8][key_version u32][salt 32][iv 12][tag 16][ciphertext ..]`

use crate::config::VaultConfig;
use crate::{Error, Result};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use sha2::Sha256;
use std::collections::BTreeMap;
use zeroize::Zeroizing;

pub const MIN_KDF_ITERATIONS: u32 = 100_000;
pub const MASTER_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const FORMAT_V1: u8 = 1;
const HEADER_LEN: usize = 1 + 4 + SALT_LEN + IV_LEN + TAG_LEN;

/// Process master secret. Zeroed on drop, never printed.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; MASTER_KEY_LEN]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let raw = Zeroizing::new(hex::decode(hex_str.trim()).map_err(|_| {
            Error::Configuration("master key is not valid hex".to_string())
        })?);
        if raw.len() != MASTER_KEY_LEN {
            return Err(Error::Configuration(format!(
                "master key must be exactly {MASTER_KEY_LEN} bytes ({} hex chars), got {} bytes",
                MASTER_KEY_LEN * 2,
                raw.len()
            )));
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        key.copy_from_slice(&raw);
        Ok(Self::from_bytes(key))
    }

    pub fn generate() -> Self {
        let mut key = [0u8; MASTER_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self::from_bytes(key)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_slice())
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Decoded form of a stored credential blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub key_version: u32,
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        out.push(FORMAT_V1);
        out.extend_from_slice(&self.key_version.to_be_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Decryption(format!(
                "blob too short: {} bytes, header needs {HEADER_LEN}",
                data.len()
            )));
        }
        if data[0] != FORMAT_V1 {
            return Err(Error::Decryption(format!(
                "unsupported blob format {}",
                data[0]
            )));
        }
        let mut offset = 1;
        let mut version = [0u8; 4];
        version.copy_from_slice(&data[offset..offset + 4]);
        offset += 4;
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&data[offset..offset + SALT_LEN]);
        offset += SALT_LEN;
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&data[offset..offset + IV_LEN]);
        offset += IV_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[offset..offset + TAG_LEN]);
        offset += TAG_LEN;
        Ok(Self {
            key_version: u32::from_be_bytes(version),
            salt,
            iv,
            tag,
            ciphertext: data[offset..].to_vec(),
        })
    }
}

/// Versioned master keys plus KDF parameters.
///
/// Encryption always uses `current_version`; decryption uses whatever
/// version the blob records, as long as that key is still registered.
#[derive(Clone, Debug)]
pub struct Keyring {
    current_version: u32,
    keys: BTreeMap<u32, MasterKey>,
    iterations: u32,
}

impl Keyring {
    pub fn from_config(cfg: &VaultConfig) -> Result<Self> {
        if !cfg.keys.contains_key(&cfg.current_key_version) {
            return Err(Error::Configuration(format!(
                "no master key registered for key version {}",
                cfg.current_key_version
            )));
        }
        Ok(Self {
            current_version: cfg.current_key_version,
            keys: cfg.keys.clone(),
            iterations: cfg.kdf_iterations,
        })
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    fn derive_key(&self, version: u32, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let master = self
            .keys
            .get(&version)
            .ok_or_else(|| Error::Decryption(format!("unknown key version {version}")))?;
        let mut kdf_salt = Vec::with_capacity(salt.len() + 4);
        kdf_salt.extend_from_slice(salt);
        kdf_salt.extend_from_slice(&version.to_be_bytes());

        let mut out = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2_hmac::<Sha256>(master.as_bytes(), &kdf_salt, self.iterations, &mut *out);
        Ok(out)
    }

    /// Encrypt `plaintext` under the current key version.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedBlob> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);

        let key = self
            .derive_key(self.current_version, &salt)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| Error::Encryption(format!("cipher init: {e}")))?;
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
            .map_err(|e| Error::Encryption(format!("encrypt: {e}")))?;

        if sealed.len() < TAG_LEN {
            return Err(Error::Encryption("cipher output shorter than tag".to_string()));
        }
        let tag_bytes = sealed.split_off(sealed.len() - TAG_LEN);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&tag_bytes);

        Ok(EncryptedBlob {
            key_version: self.current_version,
            salt,
            iv,
            tag,
            ciphertext: sealed,
        })
    }

    /// Decrypt and verify a blob. Any mismatch is a `Decryption` error.
    pub fn decrypt(&self, blob: &EncryptedBlob, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.derive_key(blob.key_version, &blob.salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| Error::Decryption(format!("cipher init: {e}")))?;

        let mut sealed = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&blob.ciphertext);
        sealed.extend_from_slice(&blob.tag);

        cipher
            .decrypt(
                Nonce::from_slice(&blob.iv),
                Payload {
                    msg: &sealed,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| {
                Error::Decryption("authentication tag mismatch (tampered or wrong key)".to_string())
            })
    }

    pub fn encrypt_to_bytes(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        Ok(self.encrypt(plaintext, aad)?.to_bytes())
    }

    pub fn decrypt_bytes(&self, data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let blob = EncryptedBlob::from_bytes(data)?;
        self.decrypt(&blob, aad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyring(version: u32) -> Keyring {
        let cfg = VaultConfig::with_key(MasterKey::from_bytes([7u8; 32]), version)
            .with_kdf_iterations(16);
        Keyring::from_config(&cfg).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let ring = keyring(1);
        let data = ring.encrypt_to_bytes(b"hello world", b"user:svc").unwrap();
        let plain = ring.decrypt_bytes(&data, b"user:svc").unwrap();
        assert_eq!(plain.as_slice(), b"hello world");
    }

    #[test]
    fn identical_plaintext_yields_distinct_blobs() {
        let ring = keyring(1);
        let a = ring.encrypt_to_bytes(b"same", b"aad").unwrap();
        let b = ring.encrypt_to_bytes(b"same", b"aad").unwrap();
        assert_ne!(a, b);
        assert_eq!(ring.decrypt_bytes(&a, b"aad").unwrap().as_slice(), b"same");
        assert_eq!(ring.decrypt_bytes(&b, b"aad").unwrap().as_slice(), b"same");
    }

    #[test]
    fn any_flipped_bit_fails_decryption() {
        let ring = keyring(1);
        let data = ring.encrypt_to_bytes(br#"{"api_key":"k"}"#, b"aad").unwrap();
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut tampered = data.clone();
                tampered[byte] ^= 1 << bit;
                let err = ring.decrypt_bytes(&tampered, b"aad").unwrap_err();
                assert!(err.is_tamper_evidence(), "byte {byte} bit {bit}: {err}");
            }
        }
    }

    #[test]
    fn associated_data_binds_blob_to_owner() {
        let ring = keyring(1);
        let data = ring.encrypt_to_bytes(b"secret", b"alice:epfo").unwrap();
        assert!(ring.decrypt_bytes(&data, b"bob:epfo").is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let ring = keyring(1);
        let data = ring.encrypt_to_bytes(b"secret", b"aad").unwrap();
        assert!(ring.decrypt_bytes(&data[..HEADER_LEN - 1], b"aad").is_err());
        assert!(ring.decrypt_bytes(&data[..data.len() - 1], b"aad").is_err());
    }

    #[test]
    fn retired_versions_still_decrypt() {
        let old = keyring(1);
        let data = old.encrypt_to_bytes(b"legacy", b"aad").unwrap();

        let cfg = VaultConfig::with_key(MasterKey::from_bytes([9u8; 32]), 2)
            .with_retired_key(1, MasterKey::from_bytes([7u8; 32]))
            .with_kdf_iterations(16);
        let ring = Keyring::from_config(&cfg).unwrap();
        assert_eq!(ring.decrypt_bytes(&data, b"aad").unwrap().as_slice(), b"legacy");

        let fresh = EncryptedBlob::from_bytes(&ring.encrypt_to_bytes(b"x", b"aad").unwrap()).unwrap();
        assert_eq!(fresh.key_version, 2);
    }

    #[test]
    fn unknown_version_is_decryption_error() {
        let data = keyring(4).encrypt_to_bytes(b"x", b"aad").unwrap();
        let err = keyring(1).decrypt_bytes(&data, b"aad").unwrap_err();
        assert!(matches!(err, Error::Decryption(m) if m.contains("unknown key version")));
    }

    #[test]
    fn master_key_hex_validation() {
        assert!(MasterKey::from_hex("abcd").is_err());
        assert!(MasterKey::from_hex(&"zz".repeat(32)).is_err());
        let key = MasterKey::generate();
        assert_eq!(MasterKey::from_hex(&key.to_hex()).unwrap().to_hex(), key.to_hex());
        assert_eq!(format!("{key:?}"), "MasterKey([REDACTED])");
    }
}
