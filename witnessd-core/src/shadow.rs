use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::topology::chunking::{self, Chunk};

const VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;
const SHADOW_FILE_NAME: &str = "current.shadow";

/// Full payloads are kept up to this size.
pub const FULL_MAX_SIZE: usize = 256 * 1024;
/// Chunk digests are kept up to this size; beyond it only the size survives.
pub const CHUNKED_MAX_SIZE: usize = 10 * 1024 * 1024;

const STRATEGY_FULL: u8 = 1;
const STRATEGY_CHUNKED: u8 = 2;
const STRATEGY_SIZE_ONLY: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    #[error("shadow: unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("shadow: unknown strategy {0}")]
    UnknownStrategy(u8),
    #[error("shadow: truncated data")]
    Truncated,
    #[error("shadow: decryption failed")]
    DecryptionFailed,
    #[error("shadow: encryption failed")]
    EncryptionFailed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShadowStrategy {
    Full(Vec<u8>),
    Chunked(Vec<Chunk>),
    SizeOnly,
}

/// Cached view of a tracked file's previous content. Only ever read back
/// as diff input; the chain itself never references shadow data.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowFile {
    pub version: u8,
    pub content_hash: [u8; 32],
    pub file_size: i64,
    pub timestamp_ns: i64,
    pub strategy: ShadowStrategy,
}

impl ShadowFile {
    pub fn for_content(content: &[u8]) -> Self {
        let strategy = if content.len() <= FULL_MAX_SIZE {
            ShadowStrategy::Full(content.to_vec())
        } else if content.len() <= CHUNKED_MAX_SIZE {
            ShadowStrategy::Chunked(chunking::chunk_bytes(content))
        } else {
            ShadowStrategy::SizeOnly
        };

        Self {
            version: VERSION,
            content_hash: Sha256::digest(content).into(),
            file_size: content.len() as i64,
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
            strategy,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 32 + 8 + 8 + 1);
        buf.push(self.version);
        buf.extend_from_slice(&self.content_hash);
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_ns.to_be_bytes());

        match &self.strategy {
            ShadowStrategy::Full(bytes) => {
                buf.push(STRATEGY_FULL);
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            ShadowStrategy::Chunked(chunks) => {
                buf.push(STRATEGY_CHUNKED);
                buf.extend_from_slice(&(chunks.len() as u32).to_be_bytes());
                for chunk in chunks {
                    buf.extend_from_slice(&chunk.offset.to_be_bytes());
                    buf.extend_from_slice(&chunk.length.to_be_bytes());
                    buf.extend_from_slice(&chunk.hash);
                }
            }
            ShadowStrategy::SizeOnly => buf.push(STRATEGY_SIZE_ONLY),
        }

        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ShadowError> {
        if data.len() < 1 + 32 + 8 + 8 + 1 {
            return Err(ShadowError::Truncated);
        }

        let version = data[0];
        if version != VERSION {
            return Err(ShadowError::UnsupportedVersion(version));
        }

        let mut content_hash = [0u8; 32];
        content_hash.copy_from_slice(&data[1..33]);
        let file_size = i64::from_be_bytes(data[33..41].try_into().unwrap());
        let timestamp_ns = i64::from_be_bytes(data[41..49].try_into().unwrap());
        let strategy_byte = data[49];
        let tail = &data[50..];

        let strategy = match strategy_byte {
            STRATEGY_FULL => {
                if tail.len() < 4 {
                    return Err(ShadowError::Truncated);
                }
                let len = u32::from_be_bytes(tail[0..4].try_into().unwrap()) as usize;
                if tail.len() < 4 + len {
                    return Err(ShadowError::Truncated);
                }
                ShadowStrategy::Full(tail[4..4 + len].to_vec())
            }
            STRATEGY_CHUNKED => {
                if tail.len() < 4 {
                    return Err(ShadowError::Truncated);
                }
                let count = u32::from_be_bytes(tail[0..4].try_into().unwrap()) as usize;
                let record = 8 + 8 + 32;
                if tail.len() < 4 + count * record {
                    return Err(ShadowError::Truncated);
                }
                let mut chunks = Vec::with_capacity(count);
                for i in 0..count {
                    let at = 4 + i * record;
                    let offset = i64::from_be_bytes(tail[at..at + 8].try_into().unwrap());
                    let length = i64::from_be_bytes(tail[at + 8..at + 16].try_into().unwrap());
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&tail[at + 16..at + 48]);
                    chunks.push(Chunk {
                        offset,
                        length,
                        hash,
                    });
                }
                ShadowStrategy::Chunked(chunks)
            }
            STRATEGY_SIZE_ONLY => ShadowStrategy::SizeOnly,
            other => return Err(ShadowError::UnknownStrategy(other)),
        };

        Ok(Self {
            version,
            content_hash,
            file_size,
            timestamp_ns,
            strategy,
        })
    }
}

/// Encrypted, content-addressed cache of prior file content, one
/// `current.shadow` per tracked path.
pub struct ShadowCache {
    base_dir: PathBuf,
    key: [u8; 32],
}

impl ShadowCache {
    pub fn new(
        base_dir: impl AsRef<Path>,
        signing_key_seed: &[u8],
    ) -> Result<Self, ShadowError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        restrict_dir(&base_dir)?;

        let mut hasher = Sha256::new();
        hasher.update(signing_key_seed);
        hasher.update(b"shadow-cache");
        let key: [u8; 32] = hasher.finalize().into();

        Ok(Self { base_dir, key })
    }

    pub fn get(&self, file_path: &str) -> Result<Option<ShadowFile>, ShadowError> {
        let path = self.shadow_path(file_path);
        let sealed = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if sealed.len() < NONCE_SIZE {
            return Err(ShadowError::Truncated);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| ShadowError::DecryptionFailed)?;
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        let plaintext = cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|_| ShadowError::DecryptionFailed)?;

        ShadowFile::decode(&plaintext).map(Some)
    }

    pub fn put(&self, file_path: &str, content: &[u8]) -> Result<(), ShadowError> {
        let shadow = ShadowFile::for_content(content);
        let plaintext = shadow.encode();

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| ShadowError::EncryptionFailed)?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| ShadowError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        let path = self.shadow_path(file_path);
        let dir = path.parent().expect("shadow path has parent");
        fs::create_dir_all(dir)?;
        restrict_dir(dir)?;

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &sealed)?;
        restrict_file(&tmp_path)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn delete(&self, file_path: &str) -> Result<(), ShadowError> {
        let path = self.shadow_path(file_path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn shadow_path(&self, file_path: &str) -> PathBuf {
        let digest = Sha256::digest(file_path.as_bytes());
        let prefix = hex::encode(&digest[0..4]);
        self.base_dir.join(prefix).join(SHADOW_FILE_NAME)
    }
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
