use ed25519_dalek::SigningKey;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};

use crate::keyhierarchy::MasterIdentity;

#[derive(Debug, thiserror::Error)]
pub enum DataDirError {
    #[error("data directory not initialized at {0}")]
    NotInitialized(String),
    #[error("invalid key file {0}")]
    InvalidKeyFile(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Owner-only data directory. Resolved once at startup and passed
/// explicitly; no ambient singleton.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Explicit path, then `WITNESSD_DATA_DIR`, then `~/.witnessd`.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        if let Ok(dir) = std::env::var("WITNESSD_DATA_DIR") {
            return Self::new(dir);
        }
        if let Some(home) = dirs::home_dir() {
            return Self::new(home.join(".witnessd"));
        }
        Self::new(".witnessd")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signing_key_path(&self) -> PathBuf {
        self.root.join("signing_key")
    }

    pub fn signing_key_pub_path(&self) -> PathBuf {
        self.root.join("signing_key.pub")
    }

    pub fn puf_seed_path(&self) -> PathBuf {
        self.root.join("puf_seed")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.root.join("identity.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn events_db_path(&self) -> PathBuf {
        self.root.join("events.db")
    }

    pub fn chains_dir(&self) -> PathBuf {
        self.root.join("chains")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn tracking_dir(&self) -> PathBuf {
        self.root.join("tracking")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.tracking_dir().join("wal")
    }

    pub fn shadow_dir(&self) -> PathBuf {
        self.root.join("shadow")
    }

    pub fn is_initialized(&self) -> bool {
        self.signing_key_path().exists()
    }

    /// Create the directory tree with owner-only modes.
    pub fn ensure(&self) -> Result<(), DataDirError> {
        for dir in [
            self.root.clone(),
            self.chains_dir(),
            self.sessions_dir(),
            self.tracking_dir(),
            self.wal_dir(),
            self.shadow_dir(),
        ] {
            fs::create_dir_all(&dir)?;
            restrict_dir(&dir)?;
        }
        Ok(())
    }

    /// Load the 32-byte signing seed, generating it (plus the public key
    /// file) on first use. Atomic write, mode 0600.
    pub fn load_or_create_signing_seed(&self) -> Result<[u8; 32], DataDirError> {
        let path = self.signing_key_path();

        if let Ok(data) = fs::read(&path) {
            let seed: [u8; 32] = data
                .try_into()
                .map_err(|_| DataDirError::InvalidKeyFile(path.display().to_string()))?;
            return Ok(seed);
        }

        self.ensure()?;
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, seed)?;
        restrict_file(&tmp)?;
        fs::rename(&tmp, &path)?;

        let signing_key = SigningKey::from_bytes(&seed);
        fs::write(
            self.signing_key_pub_path(),
            signing_key.verifying_key().to_bytes(),
        )?;

        Ok(seed)
    }

    pub fn load_signing_seed(&self) -> Result<[u8; 32], DataDirError> {
        let path = self.signing_key_path();
        let data = fs::read(&path)
            .map_err(|_| DataDirError::NotInitialized(self.root.display().to_string()))?;
        data.try_into()
            .map_err(|_| DataDirError::InvalidKeyFile(path.display().to_string()))
    }

    pub fn write_identity(&self, identity: &MasterIdentity) -> Result<(), DataDirError> {
        let data = serde_json::to_vec_pretty(identity)?;
        let path = self.identity_path();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load_identity(&self) -> Result<MasterIdentity, DataDirError> {
        let data = fs::read(self.identity_path())
            .map_err(|_| DataDirError::NotInitialized(self.root.display().to_string()))?;
        Ok(serde_json::from_slice(&data)?)
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
