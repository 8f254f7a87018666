use chrono::Utc;
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::config::{Config, ConfigError};
use crate::datadir::{DataDir, DataDirError};
use crate::event::Event;
use crate::keyhierarchy::{
    self, derive_master_identity, start_session, KeyHierarchyError, MasterIdentity, Session,
    SoftwarePuf,
};
use crate::shadow::{ShadowCache, ShadowError, ShadowStrategy};
use crate::store::{SecureStore, StoreError, StoreStats};
use crate::topology;
use crate::vdf::{Parameters, VdfError, VdfProof};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Shadow(#[from] ShadowError),
    #[error(transparent)]
    Vdf(#[from] VdfError),
    #[error(transparent)]
    KeyHierarchy(#[from] KeyHierarchyError),
    #[error(transparent)]
    DataDir(#[from] DataDirError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-event outcome of walking a file's chain. A failure invalidates the
/// chain from that event forward; everything before it stays proven.
#[derive(Debug)]
pub struct ChainVerification {
    pub events: usize,
    pub valid: bool,
    pub first_invalid: Option<usize>,
    pub errors: Vec<String>,
    pub total_vdf_time: Duration,
}

#[derive(Debug)]
pub struct DocumentVerification {
    pub chain: ChainVerification,
    pub certificate_valid: Option<bool>,
    pub signatures_valid: Option<bool>,
    pub signed_events: usize,
}

/// The checkpoint engine: owns the store, the shadow cache and the key
/// hierarchy for one data directory. A commit is a single logical
/// sequence; the VDF step may block for seconds.
pub struct Engine {
    data_dir: DataDir,
    config: Config,
    vdf_params: Parameters,
    store: SecureStore,
    shadow: ShadowCache,
    puf: SoftwarePuf,
    identity: MasterIdentity,
    device_id: [u8; 16],
    sessions: HashMap<String, Session>,
}

impl Engine {
    /// First-run initialization: directory tree, signing seed, PUF seed,
    /// identity record and default config.
    pub fn init(data_dir: &DataDir) -> Result<MasterIdentity, EngineError> {
        data_dir.ensure()?;
        data_dir.load_or_create_signing_seed()?;
        let puf = SoftwarePuf::load_or_create(data_dir.puf_seed_path())?;
        let identity = derive_master_identity(&puf)?;
        data_dir.write_identity(&identity)?;
        Config::load_or_default(&data_dir.config_path())?;
        Ok(identity)
    }

    pub fn open(data_dir: DataDir) -> Result<Self, EngineError> {
        let signing_seed = data_dir.load_signing_seed()?;
        let config = Config::load_or_default(&data_dir.config_path())?;
        let vdf_params = Parameters::from(&config);

        let puf = SoftwarePuf::load_or_create(data_dir.puf_seed_path())?;
        let identity = match data_dir.load_identity() {
            Ok(identity) => identity,
            Err(_) => {
                let identity = derive_master_identity(&puf)?;
                data_dir.write_identity(&identity)?;
                identity
            }
        };
        let device_id = identity.device_id_bytes();

        let hmac_key = crate::crypto::derive_hmac_key(&signing_seed);
        let store = SecureStore::open_secure(data_dir.events_db_path(), hmac_key)?;
        let shadow = ShadowCache::new(data_dir.shadow_dir(), &signing_seed)?;

        Ok(Self {
            data_dir,
            config,
            vdf_params,
            store,
            shadow,
            puf,
            identity,
            device_id,
            sessions: HashMap::new(),
        })
    }

    /// Commit the current content of `file_path` to its chain.
    ///
    /// `vdf_duration` targets the proof length; when absent the wall time
    /// since the previous event is used, so the proof covers the editing
    /// gap it stands in for.
    pub fn commit(
        &mut self,
        file_path: &Path,
        message: Option<String>,
        vdf_duration: Option<Duration>,
    ) -> Result<Event, EngineError> {
        let abs_path = fs::canonicalize(file_path)?;
        let path_str = abs_path.to_string_lossy().to_string();

        let content = fs::read(&abs_path)?;
        let content_hash = crate::crypto::hash_content(&content);
        let file_size = content.len() as i64;
        let timestamp_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);

        let previous = self.store.get_last_secure_event_for_file(&path_str)?;
        let (vdf_input, size_delta, previous_hash, elapsed) = match &previous {
            None => (content_hash, saturating_delta(file_size), [0u8; 32], None),
            Some(prev) => (
                prev.event_hash,
                saturating_delta(file_size - prev.file_size),
                prev.event_hash,
                Some(Duration::from_nanos(
                    (timestamp_ns - prev.timestamp_ns).max(0) as u64,
                )),
            ),
        };

        let target = vdf_duration
            .or(elapsed)
            .unwrap_or(Duration::ZERO);
        debug!("computing VDF for {path_str}: target {target:?}");
        let proof = VdfProof::compute(vdf_input, target, self.vdf_params)?;

        let regions = match self.shadow.get(&path_str)? {
            None => topology::extract_topology(&[], &content),
            Some(shadow) => match shadow.strategy {
                ShadowStrategy::Full(prev_bytes) => {
                    topology::extract_topology(&prev_bytes, &content)
                }
                ShadowStrategy::Chunked(chunks) => topology::extract_topology_from_chunks(
                    &chunks,
                    shadow.file_size as usize,
                    &content,
                ),
                ShadowStrategy::SizeOnly => Vec::new(),
            },
        };
        let regions_root = topology::regions_root(&regions);

        self.shadow.put(&path_str, &content)?;

        let mut event = Event {
            device_id: self.device_id,
            timestamp_ns,
            file_path: path_str.clone(),
            content_hash,
            file_size,
            size_delta,
            context_msg: message,
            vdf_input: proof.input,
            vdf_output: proof.output,
            vdf_iterations: proof.iterations,
            regions_root,
            regions,
            previous_hash,
            event_hash: [0u8; 32],
        };
        event.event_hash = event.compute_hash();

        let sessions_dir = self.data_dir.sessions_dir();
        let session = self.session_for(&path_str)?;
        session.sign_event(event.event_hash)?;
        session.persist(&sessions_dir)?;

        self.store.insert_secure_event(&event)?;
        Ok(event)
    }

    fn session_for(&mut self, path_str: &str) -> Result<&mut Session, EngineError> {
        use std::collections::hash_map::Entry;

        match self.sessions.entry(path_str.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let session = start_session(&self.puf, document_fingerprint(path_str))?;
                Ok(entry.insert(session))
            }
        }
    }

    pub fn verify_document(&self, file_path: &Path) -> Result<DocumentVerification, EngineError> {
        let path_str = match fs::canonicalize(file_path) {
            Ok(path) => path.to_string_lossy().to_string(),
            Err(_) => file_path.to_string_lossy().to_string(),
        };

        let events = self.store.get_events_for_file(&path_str)?;
        let chain = verify_chain(&events, self.vdf_params);

        let fingerprint = document_fingerprint(&path_str);
        let record_path =
            keyhierarchy::session_state_path(&self.data_dir.sessions_dir(), &fingerprint);
        let (certificate_valid, signatures_valid, signed_events) = if record_path.exists() {
            match keyhierarchy::load_session_record(&record_path) {
                Ok(record) => {
                    // The certificate must be validly signed AND scoped to
                    // this document; a valid certificate for some other
                    // document does not count.
                    let cert_ok = keyhierarchy::verify_session_certificate(&record.certificate)
                        .is_ok()
                        && record.certificate.document_hash == fingerprint;

                    // The session's signatures cover its own commits: the
                    // most recent events of the chain. Each one must bind
                    // to the recomputed event hash at its position.
                    let sigs_ok = if record.signatures.len() > events.len() {
                        false
                    } else {
                        let signed = &events[events.len() - record.signatures.len()..];
                        keyhierarchy::verify_event_signatures(&record.signatures, signed).is_ok()
                    };
                    (Some(cert_ok), Some(sigs_ok), record.signatures.len())
                }
                Err(_) => (Some(false), Some(false), 0),
            }
        } else {
            (None, None, 0)
        };

        Ok(DocumentVerification {
            chain,
            certificate_valid,
            signatures_valid,
            signed_events,
        })
    }

    pub fn events_for(&self, file_path: &Path) -> Result<Vec<Event>, EngineError> {
        let path_str = match fs::canonicalize(file_path) {
            Ok(path) => path.to_string_lossy().to_string(),
            Err(_) => file_path.to_string_lossy().to_string(),
        };
        Ok(self.store.get_events_for_file(&path_str)?)
    }

    pub fn stats(&self) -> Result<StoreStats, EngineError> {
        Ok(self.store.get_stats()?)
    }

    pub fn list_files(&self) -> Result<Vec<(String, i64, u64)>, EngineError> {
        Ok(self.store.list_files()?)
    }

    pub fn total_vdf_time(&self, file_path: &Path) -> Result<Duration, EngineError> {
        let path_str = match fs::canonicalize(file_path) {
            Ok(path) => path.to_string_lossy().to_string(),
            Err(_) => file_path.to_string_lossy().to_string(),
        };
        Ok(self
            .store
            .get_total_vdf_time(&path_str, self.vdf_params.iterations_per_second)?)
    }

    pub fn identity(&self) -> &MasterIdentity {
        &self.identity
    }

    pub fn vdf_params(&self) -> Parameters {
        self.vdf_params
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn master_signing_key(&self) -> Result<ed25519_dalek::SigningKey, EngineError> {
        Ok(keyhierarchy::derive_master_signing_key(&self.puf)?)
    }

    /// Wipe every live ratchet. Signatures made so far remain verifiable.
    pub fn end_sessions(&mut self) {
        for session in self.sessions.values_mut() {
            session.end();
        }
    }
}

/// Stable per-document identifier: hash of the canonical path. Binds the
/// session certificate to the document without touching its content.
pub fn document_fingerprint(path_str: &str) -> [u8; 32] {
    Sha256::digest(path_str.as_bytes()).into()
}

fn saturating_delta(delta: i64) -> i32 {
    delta.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Walk a file's event chain front to back. Each event must recompute to
/// its stored hash, link to its predecessor, and carry a valid VDF proof.
/// The first failure poisons everything after it.
pub fn verify_chain(events: &[Event], params: Parameters) -> ChainVerification {
    let mut result = ChainVerification {
        events: events.len(),
        valid: true,
        first_invalid: None,
        errors: Vec::new(),
        total_vdf_time: Duration::ZERO,
    };

    for (i, event) in events.iter().enumerate() {
        let fail = |reason: String, result: &mut ChainVerification| {
            result.valid = false;
            result.first_invalid = Some(i);
            result.errors.push(reason);
        };

        if event.compute_hash() != event.event_hash {
            fail(format!("event {i}: hash mismatch"), &mut result);
            break;
        }

        if i == 0 {
            if event.previous_hash != [0u8; 32] {
                fail(format!("event {i}: non-zero genesis previous hash"), &mut result);
                break;
            }
            if event.vdf_input != event.content_hash {
                fail(
                    format!("event {i}: genesis VDF input is not the content hash"),
                    &mut result,
                );
                break;
            }
        } else {
            let prev = &events[i - 1];
            if event.previous_hash != prev.event_hash {
                fail(format!("event {i}: broken chain link"), &mut result);
                break;
            }
            if event.vdf_input != prev.event_hash {
                fail(format!("event {i}: VDF input mismatch"), &mut result);
                break;
            }
        }

        let proof = VdfProof {
            input: event.vdf_input,
            output: event.vdf_output,
            iterations: event.vdf_iterations,
        };
        if !proof.verify(params) {
            fail(format!("event {i}: VDF verification failed"), &mut result);
            break;
        }

        if topology::regions_root(&event.regions) != event.regions_root {
            fail(format!("event {i}: regions root mismatch"), &mut result);
            break;
        }

        result.total_vdf_time += proof.min_elapsed(params);
    }

    result
}
