//! Read-only support for the legacy JSON chain format under `chains/`.
//! The secure store is canonical; these files are only ever loaded for
//! verification of old evidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::vdf::{Parameters, VdfProof};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain: no chain found for {0}")]
    NotFound(String),
    #[error("chain: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub ordinal: u64,
    pub previous_hash: [u8; 32],
    pub hash: [u8; 32],
    pub content_hash: [u8; 32],
    pub content_size: i64,
    pub file_path: String,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
    pub vdf: Option<VdfProof>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub document_id: String,
    pub document_path: String,
    pub created_at: DateTime<Utc>,
    pub checkpoints: Vec<Checkpoint>,
    pub vdf_params: Parameters,
}

impl Chain {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let data = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn verify(&self) -> Result<(), ChainError> {
        for (i, checkpoint) in self.checkpoints.iter().enumerate() {
            if checkpoint.compute_hash() != checkpoint.hash {
                return Err(ChainError::Invalid(format!("checkpoint {i}: hash mismatch")));
            }

            if i > 0 {
                if checkpoint.previous_hash != self.checkpoints[i - 1].hash {
                    return Err(ChainError::Invalid(format!(
                        "checkpoint {i}: broken chain link"
                    )));
                }
            } else if checkpoint.previous_hash != [0u8; 32] {
                return Err(ChainError::Invalid(
                    "checkpoint 0: non-zero previous hash".to_string(),
                ));
            }

            if i > 0 {
                let vdf = checkpoint.vdf.as_ref().ok_or_else(|| {
                    ChainError::Invalid(format!("checkpoint {i}: missing VDF proof"))
                })?;
                let expected_input = chain_input(
                    checkpoint.content_hash,
                    checkpoint.previous_hash,
                    checkpoint.ordinal,
                );
                if vdf.input != expected_input {
                    return Err(ChainError::Invalid(format!(
                        "checkpoint {i}: VDF input mismatch"
                    )));
                }
                if !vdf.verify(self.vdf_params) {
                    return Err(ChainError::Invalid(format!(
                        "checkpoint {i}: VDF verification failed"
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn total_elapsed_time(&self) -> Duration {
        self.checkpoints
            .iter()
            .filter_map(|cp| cp.vdf.as_ref())
            .map(|v| v.min_elapsed(self.vdf_params))
            .fold(Duration::ZERO, |acc, v| acc + v)
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            document_path: self.document_path.clone(),
            checkpoint_count: self.checkpoints.len(),
            first_commit: self.checkpoints.first().map(|cp| cp.timestamp),
            last_commit: self.checkpoints.last().map(|cp| cp.timestamp),
            total_elapsed_time: self.total_elapsed_time(),
            final_content_hash: self
                .checkpoints
                .last()
                .map(|cp| hex::encode(cp.content_hash)),
            chain_valid: self.verify().is_ok(),
        }
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }
}

impl Checkpoint {
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"witnessd-checkpoint-v1");
        hasher.update(self.ordinal.to_be_bytes());
        hasher.update(self.previous_hash);
        hasher.update(self.content_hash);
        hasher.update((self.content_size as u64).to_be_bytes());

        let timestamp_nanos = self.timestamp.timestamp_nanos_opt().unwrap_or(0) as u64;
        hasher.update(timestamp_nanos.to_be_bytes());

        if let Some(vdf) = &self.vdf {
            hasher.update(vdf.encode());
        }

        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSummary {
    pub document_path: String,
    pub checkpoint_count: usize,
    pub first_commit: Option<DateTime<Utc>>,
    pub last_commit: Option<DateTime<Utc>>,
    pub total_elapsed_time: Duration,
    pub final_content_hash: Option<String>,
    pub chain_valid: bool,
}

/// VDF chain input used by the legacy format.
pub fn chain_input(content_hash: [u8; 32], previous_hash: [u8; 32], ordinal: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"witnessd-vdf-v1");
    hasher.update(content_hash);
    hasher.update(previous_hash);
    hasher.update(ordinal.to_be_bytes());
    hasher.finalize().into()
}

pub fn find_chain(
    document_path: impl AsRef<Path>,
    chains_dir: impl AsRef<Path>,
) -> Result<PathBuf, ChainError> {
    let abs_path = fs::canonicalize(document_path.as_ref())?;
    let path_hash = Sha256::digest(abs_path.to_string_lossy().as_bytes());
    let doc_id = hex::encode(&path_hash[0..8]);
    let chain_path = chains_dir.as_ref().join(format!("{doc_id}.json"));
    if !chain_path.exists() {
        return Err(ChainError::NotFound(abs_path.to_string_lossy().to_string()));
    }
    Ok(chain_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdf::VdfProof;
    use tempfile::TempDir;

    fn test_params() -> Parameters {
        Parameters {
            iterations_per_second: 1000,
            min_iterations: 10,
            max_iterations: 100_000,
            calibrated: false,
        }
    }

    /// Build a well-formed legacy chain the way the old writer did.
    fn legacy_chain(checkpoint_count: usize) -> Chain {
        let params = test_params();
        let mut checkpoints = Vec::new();
        let mut previous_hash = [0u8; 32];

        for ordinal in 0..checkpoint_count as u64 {
            let content_hash = [ordinal as u8 + 1; 32];
            let vdf = (ordinal > 0).then(|| {
                VdfProof::compute_iterations(
                    chain_input(content_hash, previous_hash, ordinal),
                    50,
                )
            });

            let mut checkpoint = Checkpoint {
                ordinal,
                previous_hash,
                hash: [0u8; 32],
                content_hash,
                content_size: 100 + ordinal as i64,
                file_path: "/legacy/doc.txt".to_string(),
                timestamp: Utc::now(),
                message: None,
                vdf,
            };
            checkpoint.hash = checkpoint.compute_hash();
            previous_hash = checkpoint.hash;
            checkpoints.push(checkpoint);
        }

        Chain {
            document_id: "abcd1234".to_string(),
            document_path: "/legacy/doc.txt".to_string(),
            created_at: Utc::now(),
            checkpoints,
            vdf_params: params,
        }
    }

    #[test]
    fn test_load_and_verify_legacy_chain() {
        let dir = TempDir::new().expect("create temp dir");
        let chain = legacy_chain(3);

        let path = dir.path().join("abcd1234.json");
        fs::write(&path, serde_json::to_vec_pretty(&chain).unwrap()).expect("write");

        let loaded = Chain::load(&path).expect("load");
        loaded.verify().expect("verify");
        assert_eq!(loaded.checkpoints.len(), 3);
        assert!(loaded.total_elapsed_time() > Duration::ZERO);
    }

    #[test]
    fn test_verify_detects_hash_tampering() {
        let mut chain = legacy_chain(2);
        chain.checkpoints[1].content_size += 1;

        let err = chain.verify().unwrap_err();
        assert!(matches!(err, ChainError::Invalid(msg) if msg.contains("hash mismatch")));
    }

    #[test]
    fn test_verify_detects_broken_link() {
        let mut chain = legacy_chain(2);
        chain.checkpoints[1].previous_hash = [0xFFu8; 32];
        chain.checkpoints[1].hash = chain.checkpoints[1].compute_hash();

        let err = chain.verify().unwrap_err();
        assert!(matches!(err, ChainError::Invalid(msg) if msg.contains("broken chain link")));
    }

    #[test]
    fn test_verify_requires_vdf_after_genesis() {
        let mut chain = legacy_chain(2);
        chain.checkpoints[1].vdf = None;
        chain.checkpoints[1].hash = chain.checkpoints[1].compute_hash();

        let err = chain.verify().unwrap_err();
        assert!(matches!(err, ChainError::Invalid(msg) if msg.contains("missing VDF proof")));
    }

    #[test]
    fn test_summary() {
        let chain = legacy_chain(2);
        let summary = chain.summary();
        assert_eq!(summary.checkpoint_count, 2);
        assert!(summary.chain_valid);
        assert!(summary.final_content_hash.is_some());
    }

    #[test]
    fn test_find_chain_not_found() {
        let dir = TempDir::new().expect("create temp dir");
        let doc = dir.path().join("doc.txt");
        fs::write(&doc, b"content").expect("write doc");

        let err = find_chain(&doc, dir.path()).unwrap_err();
        assert!(matches!(err, ChainError::NotFound(_)));
    }

    #[test]
    fn test_find_chain_by_path_hash() {
        let dir = TempDir::new().expect("create temp dir");
        let doc = dir.path().join("doc.txt");
        fs::write(&doc, b"content").expect("write doc");

        let abs = fs::canonicalize(&doc).unwrap();
        let path_hash = Sha256::digest(abs.to_string_lossy().as_bytes());
        let doc_id = hex::encode(&path_hash[0..8]);
        let chain_path = dir.path().join(format!("{doc_id}.json"));
        fs::write(&chain_path, b"{}").expect("write chain stub");

        let found = find_chain(&doc, dir.path()).expect("find");
        assert_eq!(found, chain_path);
    }
}
