use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

use crate::event::Event;

const VERSION: u32 = 1;
const MASTER_DOMAIN: &str = "witnessd-master-v1";
const RATCHET_SALT: &[u8] = b"ratchet";

mod serde_array_64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = Vec::<u8>::deserialize(deserializer)?;
        if values.len() != 64 {
            return Err(serde::de::Error::custom(format!(
                "expected 64-byte array, got {} bytes",
                values.len()
            )));
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&values);
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyHierarchyError {
    #[error("keyhierarchy: ratchet state has been wiped")]
    RatchetWiped,
    #[error("keyhierarchy: invalid session certificate")]
    InvalidCert,
    #[error("keyhierarchy: ratchet index mismatch")]
    IndexMismatch,
    #[error("keyhierarchy: signature bound to a different event")]
    EventBindingMismatch,
    #[error("keyhierarchy: signature verification failed")]
    SignatureFailed,
    #[error("keyhierarchy: failed to initialize software PUF")]
    SoftwarePufInit,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Tier 0: a persisted random seed treated as the device-unique root.
/// The seed never leaves the data directory; everything above it is
/// derived transiently.
#[derive(Debug)]
pub struct SoftwarePuf {
    seed: [u8; 32],
    seed_path: PathBuf,
}

impl SoftwarePuf {
    pub fn load_or_create(seed_path: impl AsRef<Path>) -> Result<Self, KeyHierarchyError> {
        let seed_path = seed_path.as_ref().to_path_buf();
        if let Some(parent) = seed_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Ok(data) = fs::read(&seed_path) {
            if data.len() == 32 {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&data);
                return Ok(Self { seed, seed_path });
            }
            return Err(KeyHierarchyError::SoftwarePufInit);
        }

        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);

        let tmp_path = seed_path.with_extension("tmp");
        fs::write(&tmp_path, seed)?;
        restrict_to_owner(&tmp_path)?;
        fs::rename(&tmp_path, &seed_path)?;

        Ok(Self { seed, seed_path })
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            seed,
            seed_path: PathBuf::new(),
        }
    }

    pub fn seed_path(&self) -> &Path {
        &self.seed_path
    }
}

impl Drop for SoftwarePuf {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Tier 1: the stable identity of this installation. Deterministic from the
/// PUF seed; the private scalar is rebuilt on demand and zeroized after use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterIdentity {
    pub public_key: Vec<u8>,
    pub fingerprint: String,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub version: u32,
}

impl MasterIdentity {
    pub fn device_id_bytes(&self) -> [u8; 16] {
        device_id_for_public_key(&self.public_key)
    }
}

/// First 16 bytes of SHA-256 over the master public key.
pub fn device_id_for_public_key(public_key: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(public_key);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[0..16]);
    out
}

pub fn derive_master_identity(puf: &SoftwarePuf) -> Result<MasterIdentity, KeyHierarchyError> {
    let signing_key = derive_master_signing_key(puf)?;
    let public_key = signing_key.verifying_key().to_bytes().to_vec();

    Ok(MasterIdentity {
        fingerprint: hex::encode(&public_key),
        device_id: hex::encode(device_id_for_public_key(&public_key)),
        public_key,
        created_at: Utc::now(),
        version: VERSION,
    })
}

pub fn derive_master_signing_key(puf: &SoftwarePuf) -> Result<SigningKey, KeyHierarchyError> {
    let mut seed = hkdf_expand(&puf.seed, MASTER_DOMAIN.as_bytes(), b"master-seed")?;
    let signing_key = SigningKey::from_bytes(&seed);
    seed.zeroize();
    Ok(signing_key)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCertificate {
    pub session_pubkey: Vec<u8>,
    pub started_at_ns: i64,
    pub document_hash: [u8; 32],
    pub master_pubkey: Vec<u8>,
    #[serde(with = "serde_array_64")]
    pub signature: [u8; 64],
    pub version: u32,
}

/// Signature produced by ratchet key `n` over event `n`'s hash. The secret
/// behind `public_key` is destroyed the moment the signature exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSignature {
    pub index: u64,
    pub public_key: Vec<u8>,
    #[serde(with = "serde_array_64")]
    pub signature: [u8; 64],
    pub event_hash: [u8; 32],
}

/// Tier 2: one session per (document, process). Ratchet key `n` is derived
/// just-in-time as HKDF(session_secret, "ratchet" ‖ n) and zeroized after
/// signing; verification needs only the recorded public keys.
pub struct Session {
    pub certificate: SessionCertificate,
    secret: [u8; 32],
    next_index: u64,
    signatures: Vec<EventSignature>,
    wiped: bool,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

pub fn start_session(
    puf: &SoftwarePuf,
    document_hash: [u8; 32],
) -> Result<Session, KeyHierarchyError> {
    let master_key = derive_master_signing_key(puf)?;
    let master_pubkey = master_key.verifying_key().to_bytes().to_vec();

    let mut secret = [0u8; 32];
    rand::rng().fill_bytes(&mut secret);

    let session_key = SigningKey::from_bytes(&secret);
    let session_pubkey = session_key.verifying_key().to_bytes().to_vec();

    let started_at_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let cert_data = build_cert_data(&session_pubkey, started_at_ns, &document_hash);
    let signature = master_key.sign(&cert_data).to_bytes();

    Ok(Session {
        certificate: SessionCertificate {
            session_pubkey,
            started_at_ns,
            document_hash,
            master_pubkey,
            signature,
            version: VERSION,
        },
        secret,
        next_index: 0,
        signatures: Vec::new(),
        wiped: false,
    })
}

impl Session {
    pub fn sign_event(&mut self, event_hash: [u8; 32]) -> Result<EventSignature, KeyHierarchyError> {
        if self.wiped {
            return Err(KeyHierarchyError::RatchetWiped);
        }

        let index = self.next_index;
        let mut ratchet_seed = hkdf_expand(&self.secret, RATCHET_SALT, &index.to_be_bytes())?;
        let ratchet_key = SigningKey::from_bytes(&ratchet_seed);
        let public_key = ratchet_key.verifying_key().to_bytes().to_vec();
        let signature = ratchet_key.sign(&event_hash).to_bytes();
        ratchet_seed.zeroize();

        self.next_index += 1;

        let sig = EventSignature {
            index,
            public_key,
            signature,
            event_hash,
        };
        self.signatures.push(sig.clone());
        Ok(sig)
    }

    pub fn end(&mut self) {
        if !self.wiped {
            self.secret.zeroize();
            self.wiped = true;
        }
    }

    pub fn signatures(&self) -> &[EventSignature] {
        &self.signatures
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn export(&self, identity: &MasterIdentity) -> KeyHierarchyEvidence {
        KeyHierarchyEvidence {
            version: VERSION,
            master_fingerprint: identity.fingerprint.clone(),
            master_public_key: identity.public_key.clone(),
            device_id: identity.device_id.clone(),
            certificate: self.certificate.clone(),
            signatures: self.signatures.clone(),
            ratchet_count: self.signatures.len() as u64,
            ratchet_public_keys: self
                .signatures
                .iter()
                .map(|s| s.public_key.clone())
                .collect(),
        }
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            certificate: self.certificate.clone(),
            signatures: self.signatures.clone(),
            version: VERSION,
        }
    }

    /// Persist the public half of the session under
    /// `sessions/<docHash[:8]>.keyhierarchy.json`. Ratchet secrets are
    /// never written.
    pub fn persist(&self, sessions_dir: impl AsRef<Path>) -> Result<PathBuf, KeyHierarchyError> {
        let dir = sessions_dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = session_state_path(dir, &self.certificate.document_hash);
        let data = serde_json::to_vec_pretty(&self.record())
            .map_err(|e| KeyHierarchyError::Crypto(e.to_string()))?;

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(path)
    }
}

/// Public session state as persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub certificate: SessionCertificate,
    pub signatures: Vec<EventSignature>,
    pub version: u32,
}

pub fn session_state_path(sessions_dir: &Path, document_hash: &[u8; 32]) -> PathBuf {
    let prefix = hex::encode(&document_hash[0..4]);
    sessions_dir.join(format!("{prefix}.keyhierarchy.json"))
}

pub fn load_session_record(path: impl AsRef<Path>) -> Result<SessionRecord, KeyHierarchyError> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| KeyHierarchyError::Crypto(e.to_string()))
}

pub fn verify_session_certificate(cert: &SessionCertificate) -> Result<(), KeyHierarchyError> {
    let cert_data = build_cert_data(&cert.session_pubkey, cert.started_at_ns, &cert.document_hash);

    let pubkey = VerifyingKey::from_bytes(
        cert.master_pubkey
            .as_slice()
            .try_into()
            .map_err(|_| KeyHierarchyError::InvalidCert)?,
    )
    .map_err(|_| KeyHierarchyError::InvalidCert)?;

    let signature = Signature::from_bytes(&cert.signature);
    pubkey
        .verify(&cert_data, &signature)
        .map_err(|_| KeyHierarchyError::InvalidCert)
}

/// Verify signatures against the events they claim to sign. Signature `i`
/// must bind to the chained `event_hash` of event `i`; the copy carried
/// inside the signature record is never trusted on its own, so a
/// signature rebound to a different event fails here even though it is
/// internally consistent.
pub fn verify_event_signatures(
    signatures: &[EventSignature],
    events: &[Event],
) -> Result<(), KeyHierarchyError> {
    if signatures.len() != events.len() {
        return Err(KeyHierarchyError::EventBindingMismatch);
    }
    for (i, sig) in signatures.iter().enumerate() {
        if sig.index != i as u64 {
            return Err(KeyHierarchyError::IndexMismatch);
        }
        if sig.event_hash != events[i].event_hash {
            return Err(KeyHierarchyError::EventBindingMismatch);
        }
        verify_ratchet_signature(&sig.public_key, &sig.event_hash, &sig.signature)?;
    }
    Ok(())
}

/// Structural check of a signature list on its own: monotonic indices and
/// each signature valid over the hash it carries. Binding to the real
/// chain is [`verify_event_signatures`]'s job.
pub fn verify_signature_records(signatures: &[EventSignature]) -> Result<(), KeyHierarchyError> {
    for (i, sig) in signatures.iter().enumerate() {
        if sig.index != i as u64 {
            return Err(KeyHierarchyError::IndexMismatch);
        }
        verify_ratchet_signature(&sig.public_key, &sig.event_hash, &sig.signature)?;
    }
    Ok(())
}

pub fn verify_ratchet_signature(
    ratchet_pubkey: &[u8],
    event_hash: &[u8; 32],
    signature: &[u8; 64],
) -> Result<(), KeyHierarchyError> {
    let pubkey = VerifyingKey::from_bytes(
        ratchet_pubkey
            .try_into()
            .map_err(|_| KeyHierarchyError::SignatureFailed)?,
    )
    .map_err(|_| KeyHierarchyError::SignatureFailed)?;

    let signature = Signature::from_bytes(signature);
    pubkey
        .verify(event_hash, &signature)
        .map_err(|_| KeyHierarchyError::SignatureFailed)
}

fn build_cert_data(session_pubkey: &[u8], started_at_ns: i64, document_hash: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + 8 + 32);
    data.extend_from_slice(session_pubkey);
    data.extend_from_slice(&started_at_ns.to_be_bytes());
    data.extend_from_slice(document_hash);
    data
}

fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], KeyHierarchyError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|_| KeyHierarchyError::Crypto("HKDF expand failed".to_string()))?;
    Ok(okm)
}

// =============================================================================
// Evidence export
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyHierarchyEvidence {
    pub version: u32,
    pub master_fingerprint: String,
    pub master_public_key: Vec<u8>,
    pub device_id: String,
    pub certificate: SessionCertificate,
    pub signatures: Vec<EventSignature>,
    pub ratchet_count: u64,
    pub ratchet_public_keys: Vec<Vec<u8>>,
}

/// Rebuild exportable evidence from a persisted session record. Only
/// public material is involved, so this works long after the session's
/// ratchet was wiped.
pub fn evidence_from_record(
    identity: &MasterIdentity,
    record: &SessionRecord,
) -> KeyHierarchyEvidence {
    KeyHierarchyEvidence {
        version: VERSION,
        master_fingerprint: identity.fingerprint.clone(),
        master_public_key: identity.public_key.clone(),
        device_id: identity.device_id.clone(),
        certificate: record.certificate.clone(),
        signatures: record.signatures.clone(),
        ratchet_count: record.signatures.len() as u64,
        ratchet_public_keys: record
            .signatures
            .iter()
            .map(|s| s.public_key.clone())
            .collect(),
    }
}

pub fn verify_key_hierarchy(evidence: &KeyHierarchyEvidence) -> Result<(), KeyHierarchyError> {
    verify_session_certificate(&evidence.certificate)?;

    if evidence.master_public_key != evidence.certificate.master_pubkey {
        return Err(KeyHierarchyError::InvalidCert);
    }
    if evidence.master_fingerprint != hex::encode(&evidence.master_public_key) {
        return Err(KeyHierarchyError::InvalidCert);
    }
    if evidence.ratchet_count != evidence.signatures.len() as u64 {
        return Err(KeyHierarchyError::InvalidCert);
    }

    verify_signature_records(&evidence.signatures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_puf() -> SoftwarePuf {
        SoftwarePuf::from_seed([7u8; 32])
    }

    fn different_puf() -> SoftwarePuf {
        SoftwarePuf::from_seed([8u8; 32])
    }

    #[test]
    fn test_puf_load_or_create_roundtrip() {
        let dir = TempDir::new().expect("create temp dir");
        let seed_path = dir.path().join("puf_seed");

        let puf = SoftwarePuf::load_or_create(&seed_path).expect("create puf");
        assert_eq!(puf.seed_path(), seed_path);

        let identity1 = derive_master_identity(&puf).expect("identity");
        let puf2 = SoftwarePuf::load_or_create(&seed_path).expect("reopen puf");
        let identity2 = derive_master_identity(&puf2).expect("identity");
        assert_eq!(identity1.public_key, identity2.public_key);
    }

    #[cfg(unix)]
    #[test]
    fn test_puf_seed_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("create temp dir");
        let seed_path = dir.path().join("puf_seed");
        let _puf = SoftwarePuf::load_or_create(&seed_path).expect("create puf");

        let mode = fs::metadata(&seed_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_puf_rejects_corrupt_seed_file() {
        let dir = TempDir::new().expect("create temp dir");
        let seed_path = dir.path().join("puf_seed");
        fs::write(&seed_path, [1u8; 16]).expect("write short seed");

        let err = SoftwarePuf::load_or_create(&seed_path).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::SoftwarePufInit));
    }

    #[test]
    fn test_same_seed_same_identity() {
        let identity1 = derive_master_identity(&test_puf()).expect("derive 1");
        let identity2 = derive_master_identity(&test_puf()).expect("derive 2");
        assert_eq!(identity1.public_key, identity2.public_key);
        assert_eq!(identity1.fingerprint, identity2.fingerprint);
        assert_eq!(identity1.device_id, identity2.device_id);
    }

    #[test]
    fn test_different_seed_different_identity() {
        let identity1 = derive_master_identity(&test_puf()).expect("derive 1");
        let identity2 = derive_master_identity(&different_puf()).expect("derive 2");
        assert_ne!(identity1.public_key, identity2.public_key);
    }

    #[test]
    fn test_identity_shape() {
        let identity = derive_master_identity(&test_puf()).expect("derive");
        assert_eq!(identity.public_key.len(), 32);
        // Fingerprint is the full public key in hex.
        assert_eq!(identity.fingerprint, hex::encode(&identity.public_key));
        // Device id is the first 16 bytes of SHA-256(pubkey).
        assert_eq!(identity.device_id.len(), 32);
        assert_eq!(
            identity.device_id,
            hex::encode(identity.device_id_bytes())
        );
    }

    #[test]
    fn test_session_certificate_verification() {
        let session = start_session(&test_puf(), [9u8; 32]).expect("start session");
        verify_session_certificate(&session.certificate).expect("verify certificate");
    }

    #[test]
    fn test_certificate_rejects_tampered_pubkey() {
        let mut session = start_session(&test_puf(), [1u8; 32]).expect("start");
        session.certificate.session_pubkey[0] ^= 0xFF;

        let err = verify_session_certificate(&session.certificate).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::InvalidCert));
    }

    #[test]
    fn test_certificate_rejects_tampered_document_hash() {
        let mut session = start_session(&test_puf(), [1u8; 32]).expect("start");
        session.certificate.document_hash[0] ^= 0xFF;

        let err = verify_session_certificate(&session.certificate).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::InvalidCert));
    }

    /// Event carcass carrying only the hash the binding check reads.
    fn stub_event(event_hash: [u8; 32]) -> Event {
        Event {
            device_id: [0u8; 16],
            timestamp_ns: 0,
            file_path: "/doc".to_string(),
            content_hash: [0u8; 32],
            file_size: 0,
            size_delta: 0,
            context_msg: None,
            vdf_input: [0u8; 32],
            vdf_output: [0u8; 32],
            vdf_iterations: 0,
            regions_root: [0u8; 32],
            regions: Vec::new(),
            previous_hash: [0u8; 32],
            event_hash,
        }
    }

    #[test]
    fn test_event_signature_verification() {
        let mut session = start_session(&test_puf(), [3u8; 32]).expect("start session");
        session.sign_event([1u8; 32]).expect("sign");
        session.sign_event([2u8; 32]).expect("sign");

        let events = vec![stub_event([1u8; 32]), stub_event([2u8; 32])];
        verify_event_signatures(session.signatures(), &events).expect("verify signatures");
    }

    #[test]
    fn test_rebound_signature_rejected() {
        let mut session = start_session(&test_puf(), [3u8; 32]).expect("start session");
        session.sign_event([1u8; 32]).expect("sign");
        session.sign_event([2u8; 32]).expect("sign");

        // Swap the (key, hash, signature) triples between the two records
        // while keeping the index fields. Each record stays internally
        // consistent, so the structural check still passes...
        let mut sigs = session.signatures().to_vec();
        let (pk0, hash0, sig0) = (
            sigs[0].public_key.clone(),
            sigs[0].event_hash,
            sigs[0].signature,
        );
        sigs[0].public_key = sigs[1].public_key.clone();
        sigs[0].event_hash = sigs[1].event_hash;
        sigs[0].signature = sigs[1].signature;
        sigs[1].public_key = pk0;
        sigs[1].event_hash = hash0;
        sigs[1].signature = sig0;
        verify_signature_records(&sigs).expect("internally consistent");

        // ...but the binding to the real chain does not.
        let events = vec![stub_event([1u8; 32]), stub_event([2u8; 32])];
        let err = verify_event_signatures(&sigs, &events).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::EventBindingMismatch));
    }

    #[test]
    fn test_signature_count_mismatch_rejected() {
        let mut session = start_session(&test_puf(), [3u8; 32]).expect("start session");
        session.sign_event([1u8; 32]).expect("sign");

        let events = vec![stub_event([1u8; 32]), stub_event([2u8; 32])];
        let err = verify_event_signatures(session.signatures(), &events).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::EventBindingMismatch));
    }

    #[test]
    fn test_sign_event_advances_index() {
        let mut session = start_session(&test_puf(), [1u8; 32]).expect("start session");
        assert_eq!(session.next_index(), 0);

        let sig0 = session.sign_event([1u8; 32]).expect("sign 0");
        assert_eq!(sig0.index, 0);
        let sig1 = session.sign_event([2u8; 32]).expect("sign 1");
        assert_eq!(sig1.index, 1);
        assert_eq!(session.next_index(), 2);

        // Each ratchet index yields a distinct key.
        assert_ne!(sig0.public_key, sig1.public_key);
    }

    #[test]
    fn test_session_end_wipes_ratchet() {
        let mut session = start_session(&test_puf(), [1u8; 32]).expect("start session");
        session.sign_event([1u8; 32]).expect("sign");
        session.end();

        let err = session.sign_event([2u8; 32]).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::RatchetWiped));
    }

    #[test]
    fn test_signatures_verify_after_session_end() {
        let mut session = start_session(&test_puf(), [1u8; 32]).expect("start session");
        session.sign_event([1u8; 32]).expect("sign");
        session.sign_event([2u8; 32]).expect("sign");
        session.end();

        // Deleting ratchet secrets must not prevent verification.
        let events = vec![stub_event([1u8; 32]), stub_event([2u8; 32])];
        verify_event_signatures(session.signatures(), &events).expect("verify after end");
    }

    #[test]
    fn test_index_mismatch_detected() {
        let mut session = start_session(&test_puf(), [1u8; 32]).expect("start session");
        session.sign_event([1u8; 32]).expect("sign");
        session.sign_event([2u8; 32]).expect("sign");

        let mut sigs = session.signatures().to_vec();
        sigs[1].index = 5;

        let err = verify_signature_records(&sigs).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::IndexMismatch));
    }

    #[test]
    fn test_tampered_signature_detected() {
        let mut session = start_session(&test_puf(), [1u8; 32]).expect("start session");
        session.sign_event([1u8; 32]).expect("sign");

        let mut sigs = session.signatures().to_vec();
        sigs[0].signature[0] ^= 0xFF;

        let err = verify_signature_records(&sigs).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::SignatureFailed));
    }

    #[test]
    fn test_key_hierarchy_evidence_verification() {
        let puf = test_puf();
        let identity = derive_master_identity(&puf).expect("identity");
        let mut session = start_session(&puf, [6u8; 32]).expect("start session");
        session.sign_event([8u8; 32]).expect("sign");

        let evidence = session.export(&identity);
        verify_key_hierarchy(&evidence).expect("verify evidence");
        assert_eq!(evidence.ratchet_count, 1);
        assert_eq!(evidence.ratchet_public_keys.len(), 1);
    }

    #[test]
    fn test_key_hierarchy_fingerprint_mismatch() {
        let puf = test_puf();
        let identity = derive_master_identity(&puf).expect("identity");
        let mut session = start_session(&puf, [1u8; 32]).expect("start");
        session.sign_event([1u8; 32]).expect("sign");

        let mut evidence = session.export(&identity);
        evidence.master_fingerprint = "0000".to_string();

        let err = verify_key_hierarchy(&evidence).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::InvalidCert));
    }

    #[test]
    fn test_key_hierarchy_ratchet_count_mismatch() {
        let puf = test_puf();
        let identity = derive_master_identity(&puf).expect("identity");
        let mut session = start_session(&puf, [1u8; 32]).expect("start");
        session.sign_event([1u8; 32]).expect("sign");

        let mut evidence = session.export(&identity);
        evidence.ratchet_count = 999;

        let err = verify_key_hierarchy(&evidence).unwrap_err();
        assert!(matches!(err, KeyHierarchyError::InvalidCert));
    }

    #[test]
    fn test_session_persist_and_load() {
        let dir = TempDir::new().expect("create temp dir");
        let puf = test_puf();
        let document_hash = [4u8; 32];

        let mut session = start_session(&puf, document_hash).expect("start session");
        session.sign_event([1u8; 32]).expect("sign");
        let path = session.persist(dir.path()).expect("persist");

        assert_eq!(path, session_state_path(dir.path(), &document_hash));
        let record = load_session_record(&path).expect("load");
        assert_eq!(record.signatures.len(), 1);
        verify_session_certificate(&record.certificate).expect("verify");
        verify_event_signatures(&record.signatures, &[stub_event([1u8; 32])])
            .expect("verify sigs");
    }

    #[test]
    fn test_ratchet_derivation_is_deterministic_per_session() {
        // Two sessions never share ratchet keys even for the same document.
        let mut s1 = start_session(&test_puf(), [1u8; 32]).expect("start 1");
        let mut s2 = start_session(&test_puf(), [1u8; 32]).expect("start 2");

        let sig1 = s1.sign_event([9u8; 32]).expect("sign 1");
        let sig2 = s2.sign_event([9u8; 32]).expect("sign 2");
        assert_ne!(sig1.public_key, sig2.public_key);
    }
}
