use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

pub type HmacSha256 = Hmac<Sha256>;

/// Plain SHA-256 of file content.
pub fn hash_content(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Canonical metadata encoding: big-endian i64 ‖ i64 ‖ i32 followed by the
/// raw UTF-8 path bytes. The path carries no length prefix; it consumes the
/// remainder of the buffer.
pub fn canonical_metadata(
    timestamp_ns: i64,
    file_size: i64,
    size_delta: i32,
    file_path: &str,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + 8 + 4 + file_path.len());
    buf.extend_from_slice(&timestamp_ns.to_be_bytes());
    buf.extend_from_slice(&file_size.to_be_bytes());
    buf.extend_from_slice(&size_delta.to_be_bytes());
    buf.extend_from_slice(file_path.as_bytes());
    buf
}

pub fn metadata_hash(
    timestamp_ns: i64,
    file_size: i64,
    size_delta: i32,
    file_path: &str,
) -> [u8; 32] {
    Sha256::digest(canonical_metadata(
        timestamp_ns,
        file_size,
        size_delta,
        file_path,
    ))
    .into()
}

/// Per-event commitment. Binds content, metadata, the VDF proof, the
/// topology regions root and the previous event hash into one digest.
/// `previous_hash` is the zero hash at genesis.
#[allow(clippy::too_many_arguments)]
pub fn compute_event_hash(
    device_id: &[u8; 16],
    timestamp_ns: i64,
    file_path: &str,
    content_hash: &[u8; 32],
    file_size: i64,
    size_delta: i32,
    vdf_input: &[u8; 32],
    vdf_output: &[u8; 32],
    vdf_iterations: u64,
    regions_root: &[u8; 32],
    previous_hash: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"witnessd-event-v2");
    hasher.update(device_id);
    hasher.update(timestamp_ns.to_be_bytes());
    hasher.update(file_path.as_bytes());
    hasher.update(content_hash);
    hasher.update(file_size.to_be_bytes());
    hasher.update(size_delta.to_be_bytes());
    hasher.update(vdf_input);
    hasher.update(vdf_output);
    hasher.update(vdf_iterations.to_be_bytes());
    hasher.update(regions_root);
    hasher.update(previous_hash);
    hasher.finalize().into()
}

/// Store HMAC key: HMAC-SHA256 keyed by the version label over the signing
/// key seed.
pub fn derive_hmac_key(signing_key_seed: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(b"witnessd-hmac-key-v1")
        .expect("HMAC can take key of any size");
    mac.update(signing_key_seed);
    mac.finalize().into_bytes().to_vec()
}

/// Per-session WAL HMAC key.
pub fn derive_wal_hmac_key(session_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"witnessd-wal-hmac-");
    hasher.update(session_id.as_bytes());
    hasher.finalize().into()
}

/// Row HMAC over the canonical binary encoding of an event.
pub fn compute_row_hmac(key: &[u8], canonical_event: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(canonical_event);

    let result = mac.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result.into_bytes());
    out
}

/// Rolling chain hash: H(prev_rolling ‖ event_hash), seeded with the zero
/// hash before the first row.
pub fn roll_chain_hash(previous_rolling: &[u8; 32], event_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(previous_rolling);
    hasher.update(event_hash);
    hasher.finalize().into()
}
