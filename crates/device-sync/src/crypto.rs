//! Crypto kernel: key hierarchy, AEAD, checksums and the password verifier.
//!
//! Key schedule (HKDF-SHA256 throughout):
//! master password + user salt → master key → one data key per data type.
//! The server only ever sees ciphertext, nonces and checksums.
//!
//! Every buffer holding key material is wiped on drop; decrypted plaintext is
//! handed back in a zeroizing container.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use mailhaven_core::sync::{sha256_hex, SyncDataType};

use crate::error::{DeviceSyncError, Result};

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;

const MASTER_KEY_INFO: &[u8] = b"sync-master-key-v1";

// Argon2id parameters for the authentication hash (m=64 MiB, t=3, p=1).
const AUTH_HASH_MEMORY_KIB: u32 = 64 * 1024;
const AUTH_HASH_ITERATIONS: u32 = 3;
const AUTH_HASH_PARALLELISM: u32 = 1;

/// Per-data-type HKDF info string: the literal lowercase type name + "-v1".
fn key_context(data_type: SyncDataType) -> &'static [u8] {
    match data_type {
        SyncDataType::Accounts => b"accounts-v1",
        SyncDataType::Contacts => b"contacts-v1",
        SyncDataType::Preferences => b"preferences-v1",
        SyncDataType::Signatures => b"signatures-v1",
    }
}

/// Wrapper for sensitive key bytes; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecureKey([u8; KEY_LEN]);

impl AsRef<[u8]> for SecureKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecureKey(..)")
    }
}

/// Encrypted payload ready for the replica store or the wire.
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    /// Lowercase 64-hex SHA-256 of the ciphertext including the tag.
    pub checksum: String,
}

impl EncryptedPayload {
    pub fn ciphertext_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.ciphertext)
    }

    pub fn nonce_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.nonce)
    }
}

/// Derive the sync master key from the master password.
pub fn derive_master_key(password: &str, salt: &[u8; SALT_LEN]) -> Result<SecureKey> {
    if password.is_empty() {
        return Err(DeviceSyncError::crypto("Password cannot be empty"));
    }

    let hkdf = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
    let mut key = [0u8; KEY_LEN];
    hkdf.expand(MASTER_KEY_INFO, &mut key)
        .map_err(|_| DeviceSyncError::crypto("HKDF expansion failed"))?;
    Ok(SecureKey(key))
}

/// Derive the data-type key from the master key. Different data types cannot
/// decrypt each other's records.
pub fn derive_data_key(master_key: &SecureKey, data_type: SyncDataType) -> Result<SecureKey> {
    let hkdf = Hkdf::<Sha256>::new(Some(master_key.as_ref()), master_key.as_ref());
    let mut key = [0u8; KEY_LEN];
    hkdf.expand(key_context(data_type), &mut key)
        .map_err(|_| DeviceSyncError::crypto("HKDF expansion failed"))?;
    Ok(SecureKey(key))
}

/// Generate a 32-byte cryptographically random salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the authentication hash sent to the server at register/login.
///
/// Argon2id with a user-specific salt; the raw password never leaves the
/// device, and the server hashes this value again before storing it.
pub fn derive_auth_hash(password: &str, salt: &[u8; SALT_LEN]) -> Result<String> {
    if password.is_empty() {
        return Err(DeviceSyncError::crypto("Password cannot be empty"));
    }

    let params = Params::new(
        AUTH_HASH_MEMORY_KIB,
        AUTH_HASH_ITERATIONS,
        AUTH_HASH_PARALLELISM,
        Some(KEY_LEN),
    )
    .map_err(|e| DeviceSyncError::crypto(format!("Invalid Argon2 params: {}", e)))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut hash = [0u8; KEY_LEN];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut hash)
        .map_err(|e| DeviceSyncError::crypto(format!("Argon2 derivation failed: {}", e)))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(hash);
    hash.zeroize();
    Ok(encoded)
}

/// SHA-256 checksum of ciphertext bytes, lowercase hex.
pub fn checksum(ciphertext: &[u8]) -> String {
    sha256_hex(ciphertext)
}

/// The device's key hierarchy: master key plus the four data keys.
///
/// Held behind a reference-counted handle by the engine and dropped (and
/// thereby zeroized) on logout.
pub struct KeyChain {
    master_key: SecureKey,
    accounts_key: SecureKey,
    contacts_key: SecureKey,
    preferences_key: SecureKey,
    signatures_key: SecureKey,
}

impl std::fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyChain(..)")
    }
}

impl KeyChain {
    /// Derive the full hierarchy from the master password and user salt.
    pub fn derive(password: &str, salt: &[u8; SALT_LEN]) -> Result<Self> {
        let master_key = derive_master_key(password, salt)?;
        let accounts_key = derive_data_key(&master_key, SyncDataType::Accounts)?;
        let contacts_key = derive_data_key(&master_key, SyncDataType::Contacts)?;
        let preferences_key = derive_data_key(&master_key, SyncDataType::Preferences)?;
        let signatures_key = derive_data_key(&master_key, SyncDataType::Signatures)?;
        Ok(Self {
            master_key,
            accounts_key,
            contacts_key,
            preferences_key,
            signatures_key,
        })
    }

    /// Derive from a hex-encoded salt as persisted in the sync config.
    pub fn derive_from_hex_salt(password: &str, salt_hex: &str) -> Result<Self> {
        let bytes = hex::decode(salt_hex)
            .map_err(|_| DeviceSyncError::crypto("Master key salt is not valid hex"))?;
        let salt: [u8; SALT_LEN] = bytes
            .try_into()
            .map_err(|_| DeviceSyncError::crypto("Master key salt must be 32 bytes"))?;
        Self::derive(password, &salt)
    }

    fn data_key(&self, data_type: SyncDataType) -> &SecureKey {
        match data_type {
            SyncDataType::Accounts => &self.accounts_key,
            SyncDataType::Contacts => &self.contacts_key,
            SyncDataType::Preferences => &self.preferences_key,
            SyncDataType::Signatures => &self.signatures_key,
        }
    }

    /// AES-256-GCM with a fresh random 96-bit nonce per call.
    pub fn encrypt(&self, data_type: SyncDataType, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let cipher = Aes256Gcm::new_from_slice(self.data_key(data_type).as_ref())
            .map_err(|_| DeviceSyncError::crypto("Invalid AES key length"))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| DeviceSyncError::crypto("Encryption failed"))?;
        let checksum = checksum(&ciphertext);

        Ok(EncryptedPayload {
            ciphertext,
            nonce,
            checksum,
        })
    }

    /// Verify the checksum, then open the AEAD. Either failure is an
    /// integrity error; the caller quarantines the record.
    pub fn decrypt(
        &self,
        data_type: SyncDataType,
        ciphertext: &[u8],
        nonce: &[u8],
        expected_checksum: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if checksum(ciphertext) != expected_checksum.to_ascii_lowercase() {
            return Err(DeviceSyncError::crypto(
                "Checksum mismatch - data may be corrupted or tampered",
            ));
        }
        if nonce.len() != NONCE_LEN {
            return Err(DeviceSyncError::crypto("Invalid nonce length"));
        }

        let cipher = Aes256Gcm::new_from_slice(self.data_key(data_type).as_ref())
            .map_err(|_| DeviceSyncError::crypto("Invalid AES key length"))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                DeviceSyncError::crypto("Decryption failed - invalid key or corrupted data")
            })?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Master key bytes, for tests asserting hierarchy determinism.
    #[cfg(test)]
    pub(crate) fn master_key_bytes(&self) -> [u8; KEY_LEN] {
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(self.master_key.as_ref());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(password: &str, salt_byte: u8) -> KeyChain {
        KeyChain::derive(password, &[salt_byte; SALT_LEN]).unwrap()
    }

    #[test]
    fn master_key_derivation_is_deterministic() {
        let a = chain("test_password_123", 42);
        let b = chain("test_password_123", 42);
        assert_eq!(a.master_key_bytes(), b.master_key_bytes());
    }

    #[test]
    fn different_password_or_salt_changes_master_key() {
        let base = chain("password1", 1);
        assert_ne!(
            base.master_key_bytes(),
            chain("password2", 1).master_key_bytes()
        );
        assert_ne!(
            base.master_key_bytes(),
            chain("password1", 2).master_key_bytes()
        );
    }

    #[test]
    fn empty_password_rejected() {
        assert!(KeyChain::derive("", &[0u8; SALT_LEN]).is_err());
        assert!(derive_auth_hash("", &[0u8; SALT_LEN]).is_err());
    }

    #[test]
    fn data_keys_are_isolated_per_type() {
        let master = derive_master_key("password", &[3u8; SALT_LEN]).unwrap();
        let mut keys = Vec::new();
        for data_type in SyncDataType::ALL {
            let key = derive_data_key(&master, data_type).unwrap();
            keys.push(key.as_ref().to_vec());
        }
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j], "keys {} and {} collide", i, j);
            }
        }
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let chain = chain("my_sync_password", 9);
        let plaintext = br#"{"email":"a@x.com","name":"A"}"#;

        let payload = chain.encrypt(SyncDataType::Contacts, plaintext).unwrap();
        assert_eq!(payload.nonce.len(), NONCE_LEN);
        assert_eq!(payload.checksum.len(), 64);
        assert!(payload.ciphertext.len() > plaintext.len()); // tag appended

        let decrypted = chain
            .decrypt(
                SyncDataType::Contacts,
                &payload.ciphertext,
                &payload.nonce,
                &payload.checksum,
            )
            .unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn same_plaintext_yields_distinct_ciphertexts_per_type_and_call() {
        let chain = chain("password", 5);
        let plaintext = b"identical plaintext";

        let contacts = chain.encrypt(SyncDataType::Contacts, plaintext).unwrap();
        let accounts = chain.encrypt(SyncDataType::Accounts, plaintext).unwrap();
        let contacts_again = chain.encrypt(SyncDataType::Contacts, plaintext).unwrap();

        assert_ne!(contacts.ciphertext, accounts.ciphertext);
        assert_ne!(contacts.nonce, contacts_again.nonce);
        assert_ne!(contacts.ciphertext, contacts_again.ciphertext);
    }

    #[test]
    fn wrong_data_type_key_fails_to_decrypt() {
        let chain = chain("password", 5);
        let payload = chain.encrypt(SyncDataType::Contacts, b"secret").unwrap();

        let result = chain.decrypt(
            SyncDataType::Accounts,
            &payload.ciphertext,
            &payload.nonce,
            &payload.checksum,
        );
        assert!(matches!(result, Err(DeviceSyncError::Crypto(_))));
    }

    #[test]
    fn tampered_ciphertext_fails_the_checksum() {
        let chain = chain("password", 5);
        let mut payload = chain.encrypt(SyncDataType::Contacts, b"secret").unwrap();
        payload.ciphertext[0] ^= 0xFF;

        let err = chain
            .decrypt(
                SyncDataType::Contacts,
                &payload.ciphertext,
                &payload.nonce,
                &payload.checksum,
            )
            .unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn checksum_matches_known_vector() {
        assert_eq!(
            checksum(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn random_salts_differ() {
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn auth_hash_is_deterministic_and_salt_sensitive() {
        let salt_a = [7u8; SALT_LEN];
        let salt_b = [8u8; SALT_LEN];
        let first = derive_auth_hash("hunter2", &salt_a).unwrap();
        let second = derive_auth_hash("hunter2", &salt_a).unwrap();
        let other = derive_auth_hash("hunter2", &salt_b).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn hex_salt_round_trip() {
        let salt = generate_salt();
        let chain_a = KeyChain::derive("pw", &salt).unwrap();
        let chain_b = KeyChain::derive_from_hex_salt("pw", &hex::encode(salt)).unwrap();
        assert_eq!(chain_a.master_key_bytes(), chain_b.master_key_bytes());

        assert!(KeyChain::derive_from_hex_salt("pw", "zz").is_err());
        assert!(KeyChain::derive_from_hex_salt("pw", "abcd").is_err());
    }
}
