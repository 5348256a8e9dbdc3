//! Key storage and RSA key pair generation

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::config::KeyConfig;

/// Named-file store holding PEM or raw key bytes
pub trait KeyStore: Send + Sync {
    fn exists(&self, name: &str) -> bool;

    fn get(&self, name: &str) -> io::Result<Vec<u8>>;

    /// Write a key. `private` keys must not be readable by other users.
    fn put(&self, name: &str, contents: &[u8], private: bool) -> io::Result<()>;
}

/// Key store rooted at a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct FsKeyStore {
    root: PathBuf,
}

impl FsKeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl KeyStore for FsKeyStore {
    fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    fn get(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(name))
    }

    fn put(&self, name: &str, contents: &[u8], private: bool) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.path(name);
        fs::write(&path, contents)?;

        #[cfg(unix)]
        if private {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        #[cfg(not(unix))]
        let _ = private;

        Ok(())
    }
}

/// In-memory key store, mostly for tests and embedded use
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, name: &str, contents: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(name.to_string(), contents.into());
        }
        self
    }

    pub fn remove(&self, name: &str) -> bool {
        self.keys
            .write()
            .map(|mut keys| keys.remove(name).is_some())
            .unwrap_or(false)
    }
}

fn poisoned() -> io::Error {
    io::Error::other("key store lock poisoned")
}

impl KeyStore for MemoryKeyStore {
    fn exists(&self, name: &str) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(name))
            .unwrap_or(false)
    }

    fn get(&self, name: &str) -> io::Result<Vec<u8>> {
        let keys = self.keys.read().map_err(|_| poisoned())?;
        keys.get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }

    fn put(&self, name: &str, contents: &[u8], _private: bool) -> io::Result<()> {
        let mut keys = self.keys.write().map_err(|_| poisoned())?;
        keys.insert(name.to_string(), contents.to_vec());
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyGenError {
    #[error("Invalid key length {0}. Allowed lengths are 2048, 3072 and 4096.")]
    InvalidLength(usize),
    #[error("Encryption keys already exist. Use the --force option to overwrite them.")]
    AlreadyExists,
    #[error("RSA key generation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("Private key encoding failed: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),
    #[error("Public key encoding failed: {0}")]
    Spki(#[from] rsa::pkcs8::spki::Error),
    #[error("Failed to write key: {0}")]
    Io(#[from] io::Error),
}

/// RSA modulus sizes the key generator accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RsaKeyLength {
    Bits2048,
    Bits3072,
    #[default]
    Bits4096,
}

impl RsaKeyLength {
    pub fn bits(self) -> usize {
        match self {
            RsaKeyLength::Bits2048 => 2048,
            RsaKeyLength::Bits3072 => 3072,
            RsaKeyLength::Bits4096 => 4096,
        }
    }
}

impl TryFrom<usize> for RsaKeyLength {
    type Error = KeyGenError;

    fn try_from(bits: usize) -> Result<Self, Self::Error> {
        match bits {
            2048 => Ok(RsaKeyLength::Bits2048),
            3072 => Ok(RsaKeyLength::Bits3072),
            4096 => Ok(RsaKeyLength::Bits4096),
            other => Err(KeyGenError::InvalidLength(other)),
        }
    }
}

/// Generate an RSA key pair and write it under the configured filenames.
///
/// The private key is PKCS#8 PEM, the public key SPKI PEM. Existing keys are
/// only replaced when `force` is set.
pub fn generate_rsa_key_pair(
    store: &dyn KeyStore,
    keys: &KeyConfig,
    length: RsaKeyLength,
    force: bool,
) -> Result<(), KeyGenError> {
    let private_name = keys.private_key_filename.as_str();
    let public_name = keys.public_key_filename.as_str();

    if !force && (store.exists(private_name) || store.exists(public_name)) {
        return Err(KeyGenError::AlreadyExists);
    }

    tracing::debug!(bits = length.bits(), "generating RSA key pair");
    let private_key = RsaPrivateKey::new(&mut OsRng, length.bits())?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key.to_pkcs8_pem(LineEnding::LF)?;
    let public_pem = public_key.to_public_key_pem(LineEnding::LF)?;

    store.put(private_name, private_pem.as_bytes(), true)?;
    store.put(public_name, public_pem.as_bytes(), false)?;

    tracing::info!(
        private_key = %private_name,
        public_key = %public_name,
        bits = length.bits(),
        "RSA key pair written"
    );
    Ok(())
}
