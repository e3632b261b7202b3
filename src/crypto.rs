// src/crypto.rs
// Server key management, ECDSA signatures, and at-rest field encryption

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::Secret;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Wrong password or tampered ciphertext. Callers must not distinguish
    /// the two.
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("no private key on disk for this identity")]
    MissingKey,
    #[error("key encoding: {0}")]
    KeyEncoding(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns the keys directory and the operator password. All key material at
/// rest is AES-256-GCM under a PBKDF2-derived key; fresh salt and IV per
/// ciphertext, stored as `salt(16) ‖ iv(12) ‖ tag(16) ‖ ct`.
pub struct CryptoManager {
    keys_dir: PathBuf,
    password: Secret,
}

impl CryptoManager {
    pub fn new(keys_dir: impl Into<PathBuf>, password: Secret) -> Result<Self, CryptoError> {
        let keys_dir = keys_dir.into();
        fs::create_dir_all(&keys_dir)?;
        Ok(CryptoManager { keys_dir, password })
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(
            self.password.expose().as_bytes(),
            salt,
            PBKDF2_ITERATIONS,
            key.as_mut(),
        );
        key
    }

    /// Encrypt an at-rest field. Fresh salt and IV per call, so equal
    /// plaintexts never share ciphertext and the password can be rotated
    /// row by row.
    pub fn encrypt_field(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut salt = [0u8; SALT_SIZE];
        let mut iv = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
        let mut ct = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        // aes-gcm appends the tag; the stored layout carries it before the
        // ciphertext body.
        let tag = ct.split_off(ct.len() - TAG_SIZE);
        let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + TAG_SIZE + ct.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn decrypt_field(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decrypt);
        }
        let (salt, rest) = data.split_at(SALT_SIZE);
        let (iv, rest) = rest.split_at(NONCE_SIZE);
        let (tag, ct) = rest.split_at(TAG_SIZE);

        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));

        let mut buf = Vec::with_capacity(ct.len() + TAG_SIZE);
        buf.extend_from_slice(ct);
        buf.extend_from_slice(tag);
        cipher
            .decrypt(Nonce::from_slice(iv), buf.as_ref())
            .map_err(|_| CryptoError::Decrypt)
    }

    fn private_key_path(&self, identity: &str) -> PathBuf {
        self.keys_dir.join(format!("{}_private_key.enc", identity))
    }

    fn public_key_path(&self, identity: &str) -> PathBuf {
        self.keys_dir.join(format!("{}_public_key.pem", identity))
    }

    /// Generate a P-256 pair for `identity`. The private half lands on disk
    /// as base64 over the encrypted field layout, the public half as SPKI
    /// PEM. Returns the public PEM.
    pub fn generate_keypair(&self, identity: &str) -> Result<String, CryptoError> {
        let signing_key = SigningKey::random(&mut rand::thread_rng());

        let pkcs8_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        let encrypted = self.encrypt_field(pkcs8_pem.as_bytes())?;
        fs::write(self.private_key_path(identity), BASE64.encode(&encrypted))?;

        let public_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        fs::write(self.public_key_path(identity), &public_pem)?;

        Ok(public_pem)
    }

    /// `Ok(None)` when no key file exists; `CryptoError::Decrypt` on MAC
    /// failure, which at startup means a wrong operator password.
    pub fn load_private_key(&self, identity: &str) -> Result<Option<SigningKey>, CryptoError> {
        let path = self.private_key_path(identity);
        if !path.exists() {
            return Ok(None);
        }
        let encoded = fs::read_to_string(&path)?;
        let encrypted = BASE64
            .decode(encoded.trim())
            .map_err(|_| CryptoError::Decrypt)?;
        let pem_bytes = Zeroizing::new(self.decrypt_field(&encrypted)?);
        let pem = std::str::from_utf8(&pem_bytes).map_err(|_| CryptoError::Decrypt)?;
        let key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(Some(key))
    }

    /// Generate the server pair on first run; on later runs a successful
    /// load doubles as the password check.
    pub fn ensure_server_keypair(&self, identity: &str) -> Result<(), CryptoError> {
        if self.load_private_key(identity)?.is_none() {
            self.generate_keypair(identity)?;
            log::info!("crypto: generated server key pair for '{}'", identity);
        }
        Ok(())
    }

    /// ECDSA/SHA-256 over `message`; hex of the DER-encoded (r,s) pair.
    pub fn sign(&self, identity: &str, message: &[u8]) -> Result<String, CryptoError> {
        let key = self
            .load_private_key(identity)?
            .ok_or(CryptoError::MissingKey)?;
        let signature: Signature = key.sign(message);
        Ok(hex::encode(signature.to_der().as_bytes()))
    }

    /// False on any decode, parse, or verification failure. Never errors;
    /// callers treat `false` as a generic bad signature.
    pub fn verify(public_key_pem: &str, message: &[u8], signature_hex: &str) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_public_key_pem(public_key_pem) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(signature) = Signature::from_der(&sig_bytes) else {
            return false;
        };
        verifying_key.verify(message, &signature).is_ok()
    }
}

/// 16 random bytes, hex-encoded. Challenge nonces are single-use.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
